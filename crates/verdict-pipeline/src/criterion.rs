//! Criterion trait and the registry that resolves criterion names once, at
//! configuration load.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use verdict_types::{Artifact, Result, ScoreResult};

use crate::criteria::{CriterionDef, NonEmpty};

// ---------------------------------------------------------------------------
// Criterion trait
// ---------------------------------------------------------------------------

/// What a criterion sees besides the artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalContext {
    pub stage_id: String,
    /// Present only inside reproducibility trials. Stochastic criteria must
    /// derive all randomness from it.
    pub trial_seed: Option<u64>,
}

impl EvalContext {
    pub fn new(stage_id: impl Into<String>, trial_seed: Option<u64>) -> Self {
        Self {
            stage_id: stage_id.into(),
            trial_seed,
        }
    }
}

#[async_trait]
pub trait Criterion: Send + Sync {
    /// The registry key (e.g. "non_empty", "energy_conservation").
    fn name(&self) -> &str;

    /// Score the artifact. Must not depend on hidden state; facts worth
    /// keeping go into [`ScoreResult::metadata_updates`].
    ///
    /// Returning `Err` is recorded as a criterion error (score 0) and does
    /// not abort sibling criteria.
    async fn evaluate(&self, artifact: &Artifact, ctx: &EvalContext) -> Result<ScoreResult>;
}

// ---------------------------------------------------------------------------
// CriterionRegistry
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct CriterionRegistry {
    criteria: HashMap<String, Arc<dyn Criterion>>,
}

impl CriterionRegistry {
    pub fn new() -> Self {
        Self {
            criteria: HashMap::new(),
        }
    }

    pub fn register(&mut self, criterion: impl Criterion + 'static) {
        self.register_arc(Arc::new(criterion));
    }

    pub fn register_arc(&mut self, criterion: Arc<dyn Criterion>) {
        let name = criterion.name().to_string();
        if self.criteria.insert(name.clone(), criterion).is_some() {
            tracing::debug!(criterion = %name, "Replaced registered criterion");
        }
    }

    /// Instantiate and register built-in criteria from configuration.
    pub fn register_defs(&mut self, defs: &[CriterionDef]) -> Result<()> {
        for def in defs {
            self.register_arc(def.build()?);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Criterion>> {
        self.criteria.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.criteria.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.criteria.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Registry pre-loaded with the parameterless built-ins.
pub fn default_registry() -> CriterionRegistry {
    let mut registry = CriterionRegistry::new();
    registry.register(NonEmpty::new("non_empty"));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    #[async_trait]
    impl Criterion for Fixed {
        fn name(&self) -> &str {
            self.0
        }
        async fn evaluate(&self, _artifact: &Artifact, _ctx: &EvalContext) -> Result<ScoreResult> {
            Ok(ScoreResult::pass(self.0, 1.0, "fixed"))
        }
    }

    #[test]
    fn default_registry_has_non_empty() {
        let registry = default_registry();
        assert!(registry.has("non_empty"));
        assert!(!registry.has("pattern"));
    }

    #[test]
    fn register_and_lookup_by_name() {
        let mut registry = CriterionRegistry::new();
        registry.register(Fixed("units"));
        registry.register(Fixed("energy"));

        assert!(registry.get("units").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["energy".to_string(), "units".to_string()]);
    }

    #[test]
    fn register_defs_builds_builtins() {
        let defs: Vec<CriterionDef> = serde_json::from_str(
            r#"[{"kind": "min_length", "name": "long_enough", "min_chars": 10}]"#,
        )
        .unwrap();
        let mut registry = CriterionRegistry::new();
        registry.register_defs(&defs).unwrap();
        assert!(registry.has("long_enough"));
    }

    #[tokio::test]
    async fn registered_criterion_evaluates() {
        let mut registry = CriterionRegistry::new();
        registry.register(Fixed("units"));
        let artifact = Artifact::from_bytes("a", "content");
        let ctx = EvalContext::new("stage", None);

        let result = registry
            .get("units")
            .unwrap()
            .evaluate(&artifact, &ctx)
            .await
            .unwrap();
        assert!(result.passed);
        assert_eq!(result.criterion_name, "units");
    }
}
