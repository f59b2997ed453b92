//! Stage execution: run every criterion of one stage against one artifact and
//! fold the results into a [`StageOutcome`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use verdict_types::{Artifact, Result, ScoreResult, StageOutcome, VerdictError};

use crate::criterion::{Criterion, CriterionRegistry, EvalContext};
use crate::spec::StageSpec;

// ---------------------------------------------------------------------------
// Compiled stages
// ---------------------------------------------------------------------------

/// A criterion binding with its implementation resolved from the registry.
#[derive(Clone)]
pub struct BoundCriterion {
    pub name: String,
    pub weight: f64,
    pub timeout: Option<Duration>,
    criterion: Arc<dyn Criterion>,
}

/// A [`StageSpec`] whose criterion names have been resolved once, at
/// configuration load.
#[derive(Clone)]
pub struct CompiledStage {
    pub spec: StageSpec,
    pub threshold: f64,
    bindings: Vec<BoundCriterion>,
}

impl CompiledStage {
    pub fn compile(spec: &StageSpec, registry: &CriterionRegistry) -> Result<Self> {
        let threshold = spec.pass_threshold.ok_or_else(|| {
            VerdictError::StageAggregation(format!("stage '{}' has no pass_threshold", spec.id))
        })?;

        let bindings = spec
            .criteria
            .iter()
            .map(|binding| {
                let criterion = registry.get(&binding.criterion).ok_or_else(|| {
                    VerdictError::UnknownCriterion {
                        stage: spec.id.clone(),
                        criterion: binding.criterion.clone(),
                    }
                })?;
                Ok(BoundCriterion {
                    name: binding.criterion.clone(),
                    weight: binding.weight,
                    timeout: binding.timeout_ms.map(Duration::from_millis),
                    criterion,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            spec: spec.clone(),
            threshold,
            bindings,
        })
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn bindings(&self) -> &[BoundCriterion] {
        &self.bindings
    }
}

// ---------------------------------------------------------------------------
// StageExecutor
// ---------------------------------------------------------------------------

pub struct StageExecutor;

impl StageExecutor {
    /// Evaluate every criterion of `stage` in declared order.
    ///
    /// Never fails: a criterion that errors, panics, times out, or returns
    /// an out-of-range score is recorded as an errored [`ScoreResult`] and
    /// its siblings still run. `trial_seed` is only set by reproducibility
    /// trials, where the seed is the trial index.
    pub async fn execute(
        stage: &CompiledStage,
        artifact: &Arc<Artifact>,
        trial_seed: Option<u64>,
    ) -> StageOutcome {
        let ctx = EvalContext::new(stage.id(), trial_seed);
        let mut results = Vec::with_capacity(stage.bindings.len());

        for binding in &stage.bindings {
            let result = evaluate_one(binding, artifact, &ctx).await;
            if result.is_error() {
                tracing::warn!(
                    stage = %stage.id(),
                    criterion = %binding.name,
                    error = result.error.as_deref().unwrap_or_default(),
                    "Criterion errored"
                );
            }
            results.push(result);
        }

        let aggregate_score = stage
            .bindings
            .iter()
            .zip(&results)
            .map(|(b, r)| b.weight * r.score)
            .sum::<f64>()
            .clamp(0.0, 1.0);

        let hard_fail_triggered: Vec<String> = results
            .iter()
            .filter(|r| !r.passed && stage.spec.hard_fail.contains(&r.criterion_name))
            .map(|r| r.criterion_name.clone())
            .collect();

        let passed = aggregate_score >= stage.threshold && hard_fail_triggered.is_empty();

        tracing::debug!(
            stage = %stage.id(),
            aggregate_score,
            passed,
            hard_fail = hard_fail_triggered.len(),
            "Stage evaluated"
        );

        StageOutcome {
            stage_id: stage.id().to_string(),
            results,
            aggregate_score,
            passed,
            hard_fail_triggered,
            trial_index: trial_seed.and_then(|seed| u32::try_from(seed).ok()),
            timestamp: Utc::now(),
        }
    }
}

/// Run one criterion in its own task so a panic is contained.
async fn evaluate_one(
    binding: &BoundCriterion,
    artifact: &Arc<Artifact>,
    ctx: &EvalContext,
) -> ScoreResult {
    let criterion = Arc::clone(&binding.criterion);
    let artifact = Arc::clone(artifact);
    let task_ctx = ctx.clone();
    let mut handle =
        tokio::spawn(async move { criterion.evaluate(&artifact, &task_ctx).await });

    let joined = match binding.timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                handle.abort();
                let err = VerdictError::CriterionTimeout {
                    criterion: binding.name.clone(),
                    timeout_ms: limit.as_millis() as u64,
                };
                return ScoreResult::errored(&binding.name, err.to_string());
            }
        },
        None => handle.await,
    };

    match joined {
        Ok(Ok(mut result)) => {
            result.criterion_name = binding.name.clone();
            if !(0.0..=1.0).contains(&result.score) {
                return ScoreResult::errored(
                    &binding.name,
                    format!("score {} outside [0, 1]", result.score),
                );
            }
            result
        }
        Ok(Err(e)) => ScoreResult::errored(&binding.name, e.to_string()),
        Err(join_err) => {
            let message = if join_err.is_panic() {
                "criterion panicked".to_string()
            } else {
                format!("criterion task aborted: {join_err}")
            };
            ScoreResult::errored(&binding.name, message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Fixed {
        name: &'static str,
        score: f64,
        passed: bool,
    }

    #[async_trait]
    impl Criterion for Fixed {
        fn name(&self) -> &str {
            self.name
        }
        async fn evaluate(&self, _a: &Artifact, _ctx: &EvalContext) -> Result<ScoreResult> {
            Ok(ScoreResult::new(self.name, self.score, self.passed, "fixed")
                .with_update(format!("{}_seen", self.name), serde_json::json!(true)))
        }
    }

    struct Failing;

    #[async_trait]
    impl Criterion for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        async fn evaluate(&self, _a: &Artifact, _ctx: &EvalContext) -> Result<ScoreResult> {
            Err(VerdictError::Criterion {
                criterion: "failing".into(),
                message: "scorer unavailable".into(),
            })
        }
    }

    struct Panicking;

    #[async_trait]
    impl Criterion for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }
        async fn evaluate(&self, _a: &Artifact, _ctx: &EvalContext) -> Result<ScoreResult> {
            panic!("bug in scorer");
        }
    }

    struct Slow;

    #[async_trait]
    impl Criterion for Slow {
        fn name(&self) -> &str {
            "slow"
        }
        async fn evaluate(&self, _a: &Artifact, _ctx: &EvalContext) -> Result<ScoreResult> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(ScoreResult::pass("slow", 1.0, "eventually"))
        }
    }

    struct SeedEcho;

    #[async_trait]
    impl Criterion for SeedEcho {
        fn name(&self) -> &str {
            "seed_echo"
        }
        async fn evaluate(&self, _a: &Artifact, ctx: &EvalContext) -> Result<ScoreResult> {
            let score = match ctx.trial_seed {
                Some(seed) => 1.0 / (seed as f64 + 1.0),
                None => 2.0,
            };
            Ok(ScoreResult::pass("seed_echo", score, "echo"))
        }
    }

    fn registry() -> CriterionRegistry {
        let mut r = CriterionRegistry::new();
        r.register(Fixed { name: "a_high", score: 0.9, passed: true });
        r.register(Fixed { name: "a_hard", score: 0.9, passed: false });
        r.register(Fixed { name: "b_low", score: 0.4, passed: false });
        r.register(Fixed { name: "a_edge", score: 0.7 - 1e-12, passed: true });
        r.register(Failing);
        r.register(Panicking);
        r.register(Slow);
        r.register(SeedEcho);
        r
    }

    async fn run(spec: StageSpec, seed: Option<u64>) -> StageOutcome {
        let stage = CompiledStage::compile(&spec, &registry()).unwrap();
        let artifact = Arc::new(Artifact::from_bytes("doc", "content"));
        StageExecutor::execute(&stage, &artifact, seed).await
    }

    #[tokio::test]
    async fn weighted_aggregate_passes_at_boundary() {
        let outcome = run(
            StageSpec::new("s", 0.7).criterion("a_high", 0.6).criterion("b_low", 0.4),
            None,
        )
        .await;
        assert!((outcome.aggregate_score - 0.70).abs() < 1e-9);
        assert!(outcome.passed);
        assert_eq!(outcome.results[0].criterion_name, "a_high");
        assert_eq!(outcome.results[1].criterion_name, "b_low");
        assert!(outcome.trial_index.is_none());
    }

    #[tokio::test]
    async fn aggregate_just_below_threshold_fails() {
        let outcome = run(StageSpec::new("s", 0.7).criterion("a_edge", 1.0), None).await;
        assert!(outcome.aggregate_score < 0.7);
        assert!(!outcome.passed);
    }

    #[tokio::test]
    async fn hard_fail_overrides_aggregate() {
        let outcome = run(
            StageSpec::new("s", 0.7)
                .criterion("a_hard", 0.6)
                .criterion("b_low", 0.4)
                .hard_fail("a_hard"),
            None,
        )
        .await;
        assert!((outcome.aggregate_score - 0.70).abs() < 1e-9);
        assert!(!outcome.passed);
        assert_eq!(outcome.hard_fail_triggered, vec!["a_hard".to_string()]);
    }

    #[tokio::test]
    async fn erroring_criterion_degrades_without_aborting() {
        let outcome = run(
            StageSpec::new("s", 0.5).criterion("failing", 0.5).criterion("a_high", 0.5),
            None,
        )
        .await;
        assert_eq!(outcome.results.len(), 2);
        let failed = &outcome.results[0];
        assert!(failed.is_error());
        assert_eq!(failed.score, 0.0);
        assert!(failed.error.as_deref().unwrap().contains("scorer unavailable"));
        assert!((outcome.aggregate_score - 0.45).abs() < 1e-9);
        assert!(!outcome.passed);
    }

    #[tokio::test]
    async fn panicking_criterion_is_captured() {
        let outcome = run(
            StageSpec::new("s", 0.0).criterion("panicking", 0.5).criterion("a_high", 0.5),
            None,
        )
        .await;
        assert_eq!(outcome.results[0].error.as_deref(), Some("criterion panicked"));
        assert!(outcome.results[1].passed);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_criterion_is_an_error() {
        let outcome = run(
            StageSpec::new("s", 0.0)
                .timed_criterion("slow", 0.5, 100)
                .criterion("a_high", 0.5),
            None,
        )
        .await;
        let slow = &outcome.results[0];
        assert!(slow.is_error());
        assert!(slow.detail.contains("timed out after 100ms"));
    }

    #[tokio::test]
    async fn out_of_range_score_is_an_error() {
        let outcome = run(StageSpec::new("s", 0.0).criterion("seed_echo", 1.0), None).await;
        assert!(outcome.results[0].is_error());
        assert_eq!(outcome.aggregate_score, 0.0);
    }

    #[tokio::test]
    async fn trial_seed_reaches_criteria_and_tags_outcome() {
        let outcome = run(StageSpec::new("s", 0.0).criterion("seed_echo", 1.0), Some(3)).await;
        assert!((outcome.aggregate_score - 0.25).abs() < 1e-12);
        assert_eq!(outcome.trial_index, Some(3));
    }

    #[tokio::test]
    async fn metadata_updates_are_carried_not_applied() {
        let outcome = run(StageSpec::new("s", 0.0).criterion("a_high", 1.0), None).await;
        assert_eq!(
            outcome.results[0].metadata_updates.get("a_high_seen"),
            Some(&serde_json::json!(true))
        );
    }

    #[test]
    fn compile_rejects_unknown_criterion() {
        let err = CompiledStage::compile(
            &StageSpec::new("s", 0.5).criterion("nope", 1.0),
            &registry(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, VerdictError::UnknownCriterion { .. }));
    }
}
