//! External simulation services exposed as ordinary criteria.
//!
//! The engine never talks to a simulator directly: [`SimulatorCriterion`]
//! turns a [`Simulator`] into a [`Criterion`] whose only difference is its
//! latency, so bind it with a `timeout_ms`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use verdict_types::{Artifact, Metadata, Result, ScoreResult, VerdictError};

use crate::criterion::{Criterion, EvalContext};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationSpec {
    pub model: String,
    #[serde(default)]
    pub parameters: Metadata,
    /// Trial seed when running inside a reproducibility check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub converged: bool,
    /// Normalised to [0, 1] by the simulator.
    pub score: f64,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub outputs: Metadata,
}

#[async_trait]
pub trait Simulator: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, spec: &SimulationSpec) -> Result<SimulationResult>;
}

/// Builds the simulation request from an artifact.
pub type SpecBuilder = dyn Fn(&Artifact) -> Result<SimulationSpec> + Send + Sync;

pub struct SimulatorCriterion {
    name: String,
    simulator: Arc<dyn Simulator>,
    build_spec: Box<SpecBuilder>,
    min_score: f64,
}

impl SimulatorCriterion {
    /// `build_spec` maps the artifact to a request; the criterion passes when
    /// the simulation converges with a score of at least `min_score`.
    pub fn new(
        name: impl Into<String>,
        simulator: Arc<dyn Simulator>,
        min_score: f64,
        build_spec: impl Fn(&Artifact) -> Result<SimulationSpec> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            simulator,
            build_spec: Box::new(build_spec),
            min_score,
        }
    }

    /// Request built from the artifact's metadata: `model` from the given
    /// key, every other metadata entry as a parameter.
    pub fn from_metadata(
        name: impl Into<String>,
        simulator: Arc<dyn Simulator>,
        min_score: f64,
        model_key: impl Into<String>,
    ) -> Self {
        let model_key = model_key.into();
        Self::new(name, simulator, min_score, move |artifact: &Artifact| {
            let model = artifact
                .metadata
                .get(&model_key)
                .and_then(|v| v.as_str())
                .ok_or_else(|| VerdictError::Other(format!("metadata '{model_key}' names no model")))?
                .to_string();
            let parameters = artifact
                .metadata
                .iter()
                .filter(|(k, _)| **k != model_key)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Ok(SimulationSpec {
                model,
                parameters,
                seed: None,
            })
        })
    }
}

#[async_trait]
impl Criterion for SimulatorCriterion {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, artifact: &Artifact, ctx: &EvalContext) -> Result<ScoreResult> {
        let mut spec = (self.build_spec)(artifact)?;
        spec.seed = ctx.trial_seed;

        let result = self.simulator.run(&spec).await.map_err(|e| VerdictError::Criterion {
            criterion: self.name.clone(),
            message: format!("simulator '{}' failed: {e}", self.simulator.name()),
        })?;

        let passed = result.converged && result.score >= self.min_score;
        let detail = if result.converged {
            format!("{} scored {:.3}: {}", spec.model, result.score, result.summary)
        } else {
            format!("{} did not converge: {}", spec.model, result.summary)
        };
        let score = if result.converged { result.score } else { 0.0 };

        let mut scored = ScoreResult::new(&self.name, score, passed, detail);
        for (key, value) in result.outputs {
            scored = scored.with_update(format!("{}.{key}", self.name), value);
        }
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Converges when `mass` is positive; echoes the seed as an output.
    struct Toy;

    #[async_trait]
    impl Simulator for Toy {
        fn name(&self) -> &str {
            "toy"
        }
        async fn run(&self, spec: &SimulationSpec) -> Result<SimulationResult> {
            let mass = spec
                .parameters
                .get("mass")
                .and_then(|v| v.as_f64())
                .ok_or_else(|| VerdictError::Other("mass missing".into()))?;
            let mut outputs = Metadata::new();
            outputs.insert("seed".into(), serde_json::json!(spec.seed));
            Ok(SimulationResult {
                converged: mass > 0.0,
                score: 0.9,
                summary: format!("mass {mass}"),
                outputs,
            })
        }
    }

    fn criterion() -> SimulatorCriterion {
        SimulatorCriterion::from_metadata("orbit", Arc::new(Toy), 0.8, "model")
    }

    fn artifact(mass: f64) -> Artifact {
        Artifact::from_bytes("sim.json", "{}")
            .with_metadata("model", serde_json::json!("kepler"))
            .with_metadata("mass", serde_json::json!(mass))
    }

    #[tokio::test]
    async fn converged_simulation_passes_and_records_outputs() {
        let ctx = EvalContext::new("physics", Some(4));
        let result = criterion().evaluate(&artifact(1.0), &ctx).await.unwrap();
        assert!(result.passed);
        assert_eq!(result.score, 0.9);
        assert!(result.detail.starts_with("kepler scored 0.900"));
        assert_eq!(result.metadata_updates.get("orbit.seed"), Some(&serde_json::json!(4)));
    }

    #[tokio::test]
    async fn divergence_fails_with_zero_score() {
        let ctx = EvalContext::new("physics", None);
        let result = criterion().evaluate(&artifact(-1.0), &ctx).await.unwrap();
        assert!(!result.passed);
        assert_eq!(result.score, 0.0);
        assert!(result.detail.contains("did not converge"));
    }

    #[tokio::test]
    async fn simulator_error_surfaces_as_criterion_error() {
        let ctx = EvalContext::new("physics", None);
        let bare = Artifact::from_bytes("sim.json", "{}").with_metadata("model", serde_json::json!("kepler"));
        let err = criterion().evaluate(&bare, &ctx).await.unwrap_err();
        assert!(matches!(err, VerdictError::Criterion { .. }));
        assert!(err.to_string().contains("mass missing"));
    }
}
