//! Reproducibility verification: re-run a stage subset under distinct trial
//! seeds and check that the verdicts agree.
//!
//! Trials run concurrently, but the report is only computed once every trial
//! has finished; there is no partial verdict.

use std::sync::Arc;

use tracing::instrument;
use verdict_types::{Artifact, ReproducibilityReport, Result, StageOutcome, VerdictError};

use crate::executor::{CompiledStage, StageExecutor};

/// Minimum fraction of trials that must agree with the majority verdict.
pub const SUCCESS_RATE_FLOOR: f64 = 0.8;

/// Statistics over the per-trial results.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialSummary {
    pub majority_passed: bool,
    pub success_rate: f64,
    pub agreement_level: f64,
}

pub struct ReproducibilityVerifier;

impl ReproducibilityVerifier {
    /// Run `n_trials` independent executions of `stage_subset` with trial
    /// seeds `1..=n_trials`.
    ///
    /// Each trial starts from its own copy of `artifact`; metadata written in
    /// a trial never reaches the caller's artifact. The last stage of the
    /// subset is the stage the report is filed under.
    #[instrument(skip(artifact, stage_subset))]
    pub async fn verify(
        artifact: &Artifact,
        stage_subset: &[Arc<CompiledStage>],
        n_trials: u32,
        agreement_threshold: f64,
    ) -> Result<ReproducibilityReport> {
        let Some(target) = stage_subset.last() else {
            return Err(VerdictError::Config("reproducibility check has no stages".into()));
        };
        if n_trials == 0 {
            return Err(VerdictError::Config(format!(
                "stage '{}' requests zero reproducibility trials",
                target.id()
            )));
        }

        let mut tasks = Vec::with_capacity(n_trials as usize);
        for trial in 1..=n_trials {
            let artifact = artifact.clone();
            let subset = stage_subset.to_vec();
            tasks.push((trial, tokio::spawn(run_trial(artifact, subset, trial))));
        }

        // Join barrier: aggregation waits for every trial.
        let mut trials = Vec::with_capacity(tasks.len());
        for (trial, task) in tasks {
            let outcomes = task.await.map_err(|e| VerdictError::Trial {
                trial,
                message: e.to_string(),
            })?;
            trials.push(outcomes);
        }

        let trial_scores: Vec<f64> = trials
            .iter()
            .map(|outcomes| {
                outcomes.iter().map(|o| o.aggregate_score).sum::<f64>() / outcomes.len() as f64
            })
            .collect();
        let trial_passed: Vec<bool> = trials
            .iter()
            .map(|outcomes| outcomes.iter().all(|o| o.passed))
            .collect();

        let summary = summarize(&trial_scores, &trial_passed);
        let passed = summary.success_rate >= SUCCESS_RATE_FLOOR
            && summary.agreement_level >= agreement_threshold;

        tracing::info!(
            stage = %target.id(),
            success_rate = summary.success_rate,
            agreement_level = summary.agreement_level,
            passed,
            "Reproducibility checked"
        );

        Ok(ReproducibilityReport {
            stage_id: target.id().to_string(),
            stage_subset: stage_subset.iter().map(|s| s.id().to_string()).collect(),
            n_trials,
            trial_scores,
            trial_passed,
            majority_passed: summary.majority_passed,
            success_rate: summary.success_rate,
            agreement_level: summary.agreement_level,
            agreement_threshold,
            passed,
            trials: trials.into_iter().flatten().collect(),
        })
    }
}

async fn run_trial(
    mut artifact: Artifact,
    subset: Vec<Arc<CompiledStage>>,
    trial: u32,
) -> Vec<StageOutcome> {
    let mut outcomes = Vec::with_capacity(subset.len());
    for stage in &subset {
        let snapshot = Arc::new(artifact.clone());
        let outcome = StageExecutor::execute(stage, &snapshot, Some(u64::from(trial))).await;
        for result in &outcome.results {
            artifact.overwrite_updates(&result.metadata_updates);
        }
        outcomes.push(outcome);
    }
    outcomes
}

/// Majority vote, agreement with it, and score agreement across trials.
///
/// A tie counts as a failing majority.
pub fn summarize(trial_scores: &[f64], trial_passed: &[bool]) -> TrialSummary {
    let n = trial_passed.len();
    if n == 0 {
        return TrialSummary {
            majority_passed: false,
            success_rate: 0.0,
            agreement_level: 0.0,
        };
    }
    let passes = trial_passed.iter().filter(|p| **p).count();
    let majority_passed = passes * 2 > n;
    let agreeing = if majority_passed { passes } else { n - passes };

    TrialSummary {
        majority_passed,
        success_rate: agreeing as f64 / n as f64,
        agreement_level: agreement_level(trial_scores),
    }
}

/// `1 - coefficient of variation`, clamped to [0, 1]. Uses the population
/// standard deviation.
pub fn agreement_level(scores: &[f64]) -> f64 {
    let Some(first) = scores.first() else {
        return 0.0;
    };
    // Exact agreement must not pick up rounding noise from the mean.
    if scores.iter().all(|s| s == first) {
        return 1.0;
    }
    let n = scores.len() as f64;
    let mean = scores.iter().sum::<f64>() / n;
    if mean.abs() < f64::EPSILON {
        return 0.0;
    }
    let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
    (1.0 - variance.sqrt() / mean.abs()).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criterion::{Criterion, CriterionRegistry, EvalContext};
    use crate::spec::StageSpec;
    use async_trait::async_trait;
    use verdict_types::ScoreResult;

    /// Scores drawn from a tiny LCG seeded by the trial seed.
    struct Noisy {
        spread: f64,
    }

    #[async_trait]
    impl Criterion for Noisy {
        fn name(&self) -> &str {
            "noisy"
        }
        async fn evaluate(&self, _a: &Artifact, ctx: &EvalContext) -> Result<ScoreResult> {
            let seed = ctx.trial_seed.unwrap_or(0);
            let x = seed
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let unit = (x >> 11) as f64 / (1u64 << 53) as f64;
            let score = 0.6 + self.spread * (unit - 0.5);
            Ok(ScoreResult::pass("noisy", score, "noisy")
                .with_update("noise", serde_json::json!(score)))
        }
    }

    fn stage(spread: f64) -> Arc<CompiledStage> {
        let mut registry = CriterionRegistry::new();
        registry.register(Noisy { spread });
        let spec = StageSpec::new("physics", 0.5).criterion("noisy", 1.0);
        Arc::new(CompiledStage::compile(&spec, &registry).unwrap())
    }

    #[test]
    fn identical_trials_agree_fully() {
        let summary = summarize(&[0.7, 0.7, 0.7], &[true, true, true]);
        assert_eq!(summary.agreement_level, 1.0);
        assert_eq!(summary.success_rate, 1.0);
        assert!(summary.majority_passed);
    }

    #[test]
    fn all_zero_scores_agree() {
        assert_eq!(agreement_level(&[0.0, 0.0]), 1.0);
        assert_eq!(agreement_level(&[0.0, 0.0, 0.0]), 1.0);
    }

    #[test]
    fn success_rate_counts_majority_agreement() {
        let summary = summarize(&[0.9; 5], &[true, true, true, false, true]);
        assert!(summary.majority_passed);
        assert!((summary.success_rate - 0.8).abs() < 1e-12);

        let tie = summarize(&[0.5; 4], &[true, false, true, false]);
        assert!(!tie.majority_passed);
        assert!((tie.success_rate - 0.5).abs() < 1e-12);
    }

    #[test]
    fn agreement_drops_with_spread() {
        // mean 0.5, population std 0.1 -> cv 0.2
        let level = agreement_level(&[0.4, 0.6]);
        assert!((level - 0.8).abs() < 1e-12);
        assert_eq!(agreement_level(&[0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn deterministic_stage_passes_verification() {
        let artifact = Artifact::from_bytes("a", "content");
        let report = ReproducibilityVerifier::verify(&artifact, &[stage(0.0)], 5, 0.95)
            .await
            .unwrap();
        assert_eq!(report.n_trials, 5);
        assert_eq!(report.trials.len(), 5);
        assert_eq!(report.agreement_level, 1.0);
        assert_eq!(report.success_rate, 1.0);
        assert!(report.passed);
        let indices: Vec<_> = report.trials.iter().map(|t| t.trial_index).collect();
        assert_eq!(indices, vec![Some(1), Some(2), Some(3), Some(4), Some(5)]);
        assert_eq!(report.stage_subset, vec!["physics".to_string()]);
    }

    #[tokio::test]
    async fn noisy_stage_fails_verification() {
        let artifact = Artifact::from_bytes("a", "content");
        let report = ReproducibilityVerifier::verify(&artifact, &[stage(0.8)], 10, 0.95)
            .await
            .unwrap();
        assert!(report.agreement_level < 0.95);
        assert!(!report.passed);
    }

    #[tokio::test]
    async fn seeded_trials_are_repeatable() {
        let artifact = Artifact::from_bytes("a", "content");
        let a = ReproducibilityVerifier::verify(&artifact, &[stage(0.8)], 6, 0.95)
            .await
            .unwrap();
        let b = ReproducibilityVerifier::verify(&artifact, &[stage(0.8)], 6, 0.95)
            .await
            .unwrap();
        assert_eq!(a.trial_scores, b.trial_scores);
        assert_eq!(a.trial_passed, b.trial_passed);
    }

    #[tokio::test]
    async fn trials_do_not_touch_caller_metadata() {
        let artifact = Artifact::from_bytes("a", "content");
        ReproducibilityVerifier::verify(&artifact, &[stage(0.3)], 3, 0.5)
            .await
            .unwrap();
        assert!(artifact.metadata.is_empty());
    }

    #[tokio::test]
    async fn zero_trials_is_config_error() {
        let artifact = Artifact::from_bytes("a", "content");
        let err = ReproducibilityVerifier::verify(&artifact, &[stage(0.0)], 0, 0.95)
            .await
            .unwrap_err();
        assert!(err.is_config_error());
    }
}
