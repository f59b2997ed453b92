//! Pipeline engine: the state machine that drives one artifact through the
//! configured stages to a terminal disposition.
//!
//! States are stage indices plus the terminal statuses. Terminal states are
//! absorbing: once one is reached no further stage executes and the
//! [`PipelineRun`] is sealed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use verdict_types::{
    Artifact, FinalStatus, PipelineRun, ReproducibilityReport, Result, StageOutcome, VerdictError,
};

use crate::criterion::{default_registry, CriterionRegistry};
use crate::events::{EventEmitter, PipelineEvent};
use crate::executor::{CompiledStage, StageExecutor};
use crate::gates::check_gates;
use crate::reproducibility::{ReproducibilityVerifier, SUCCESS_RATE_FLOOR};
use crate::spec::{PipelineSpec, Transition};
use crate::validation::{validate_or_raise, Severity};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Owns the immutable configuration and drives artifacts through it.
///
/// Cheap to clone; clones share the compiled stages and the event channel.
#[derive(Clone)]
pub struct PipelineEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    spec: PipelineSpec,
    stages: Vec<Arc<CompiledStage>>,
    events: EventEmitter,
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

enum RunState {
    Stage(usize),
    Terminal(Disposition),
}

/// How a run ended, before it is sealed into a [`PipelineRun`].
struct Disposition {
    status: FinalStatus,
    stage: Option<String>,
    reason: Option<String>,
    code: Option<String>,
}

impl Disposition {
    fn approved() -> Self {
        Self {
            status: FinalStatus::Approved,
            stage: None,
            reason: None,
            code: None,
        }
    }

    fn at(status: FinalStatus, stage: &str, reason: String, code: &str) -> Self {
        Self {
            status,
            stage: Some(stage.to_string()),
            reason: Some(reason),
            code: Some(code.to_string()),
        }
    }
}

/// Everything a traversal accumulates. Only ever appended to.
struct Trace {
    run_id: String,
    artifact: Artifact,
    outcomes: Vec<StageOutcome>,
    reports: Vec<ReproducibilityReport>,
    /// Stage indices in execution order.
    path: Vec<usize>,
    /// Artifact as it entered each executed stage, by stage index.
    snapshots: HashMap<usize, Arc<Artifact>>,
    current_stage: Option<String>,
}

// ---------------------------------------------------------------------------
// PipelineEngine
// ---------------------------------------------------------------------------

impl PipelineEngine {
    /// Validate `spec` and resolve every criterion name against `registry`
    /// plus the built-ins the config declares.
    ///
    /// Fails fast on any configuration error; no artifact is processed by an
    /// engine that could not be built.
    pub fn new(spec: PipelineSpec, registry: &CriterionRegistry) -> Result<Self> {
        let mut registry = registry.clone();
        registry.register_defs(&spec.criteria)?;

        let diagnostics = validate_or_raise(&spec, &registry)?;
        for d in diagnostics.iter().filter(|d| d.severity == Severity::Warning) {
            tracing::warn!(rule = %d.rule, "{}", d.message);
        }

        let stages = spec
            .stages
            .iter()
            .map(|s| CompiledStage::compile(s, &registry).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            pipeline = %spec.name,
            stages = stages.len(),
            "Pipeline engine ready"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                spec,
                stages,
                events: EventEmitter::default(),
            }),
        })
    }

    /// Build with the default registry only.
    pub fn from_spec(spec: PipelineSpec) -> Result<Self> {
        Self::new(spec, &default_registry())
    }

    pub fn spec(&self) -> &PipelineSpec {
        &self.inner.spec
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.inner.events.subscribe()
    }

    /// Drive `artifact` through the pipeline.
    ///
    /// Never fails: an engine-level error ends the run with
    /// [`FinalStatus::Error`], the error message as the reason and its
    /// reason code attached.
    pub async fn run(&self, artifact: Artifact) -> PipelineRun {
        let started_at = Utc::now();
        let clock = Instant::now();
        let artifact_id = artifact.id.clone();
        let artifact_name = artifact.name.clone();
        let mut trace = Trace {
            run_id: uuid::Uuid::new_v4().to_string(),
            artifact,
            outcomes: Vec::new(),
            reports: Vec::new(),
            path: Vec::new(),
            snapshots: HashMap::new(),
            current_stage: None,
        };

        self.emit(PipelineEvent::RunStarted {
            run_id: trace.run_id.clone(),
            artifact_id: artifact_id.to_string(),
            pipeline: self.inner.spec.name.clone(),
        });
        tracing::info!(
            run_id = %trace.run_id,
            artifact = %artifact_id.short(),
            pipeline = %self.inner.spec.name,
            "Run started"
        );

        let disposition = match self.traverse(&mut trace).await {
            Ok(d) => d,
            Err(e) => {
                tracing::error!(
                    run_id = %trace.run_id,
                    stage = trace.current_stage.as_deref().unwrap_or("-"),
                    error = %e,
                    "Run aborted"
                );
                Disposition {
                    status: FinalStatus::Error,
                    stage: trace.current_stage.clone(),
                    reason: Some(e.to_string()),
                    code: Some(e.reason_code().to_string()),
                }
            }
        };

        let gates = check_gates(&trace.outcomes, &self.inner.spec.gates);
        let run = PipelineRun {
            run_id: trace.run_id,
            artifact_id,
            artifact_name,
            pipeline: self.inner.spec.name.clone(),
            outcomes: trace.outcomes,
            reproducibility: trace.reports,
            final_status: disposition.status,
            rejection_stage: disposition.stage,
            rejection_reason: disposition.reason,
            reason_code: disposition.code,
            quality_score: gates.quality_score,
            confidence_level: gates.confidence_level,
            final_metadata: trace.artifact.metadata,
            started_at,
            finished_at: Utc::now(),
        };

        self.emit(PipelineEvent::RunFinished {
            run_id: run.run_id.clone(),
            artifact_id: run.artifact_id.to_string(),
            status: run.final_status,
            duration_ms: clock.elapsed().as_millis() as u64,
        });
        tracing::info!(run_id = %run.run_id, "{}", run.summary());
        run
    }

    // -----------------------------------------------------------------------
    // Traversal
    // -----------------------------------------------------------------------

    async fn traverse(&self, trace: &mut Trace) -> Result<Disposition> {
        let mut executed = HashSet::new();
        let mut state = RunState::Stage(0);

        loop {
            let index = match state {
                RunState::Terminal(disposition) => return Ok(disposition),
                RunState::Stage(index) => index,
            };
            let stage = self.inner.stages.get(index).ok_or_else(|| {
                VerdictError::Routing(format!("stage index {index} out of range"))
            })?;
            if !executed.insert(index) {
                return Err(VerdictError::Routing(format!(
                    "stage '{}' would execute twice",
                    stage.id()
                )));
            }
            trace.current_stage = Some(stage.id().to_string());

            let outcome = self.execute_stage(trace, index, stage).await;
            let passed = outcome.passed;
            trace.outcomes.push(outcome);

            // A failing stage ends the run by its on_fail route; its updates
            // stay on the recorded outcome only.
            state = if passed {
                self.merge_metadata(trace, stage)?;
                self.on_pass(trace, index, stage).await?
            } else {
                let outcome = trace.outcomes.last().ok_or_else(|| {
                    VerdictError::Other("stage outcome missing after execution".into())
                })?;
                RunState::Terminal(fail_disposition(stage, outcome))
            };
        }
    }

    async fn execute_stage(
        &self,
        trace: &mut Trace,
        index: usize,
        stage: &CompiledStage,
    ) -> StageOutcome {
        self.emit(PipelineEvent::StageStarted {
            run_id: trace.run_id.clone(),
            stage_id: stage.id().to_string(),
        });

        let snapshot = Arc::new(trace.artifact.clone());
        trace.path.push(index);
        trace.snapshots.insert(index, Arc::clone(&snapshot));
        let outcome = StageExecutor::execute(stage, &snapshot, None).await;

        for failed in outcome.errors() {
            self.emit(PipelineEvent::CriterionFailed {
                run_id: trace.run_id.clone(),
                stage_id: stage.id().to_string(),
                criterion: failed.criterion_name.clone(),
                error: failed.error.clone().unwrap_or_default(),
            });
        }
        self.emit(PipelineEvent::StageCompleted {
            run_id: trace.run_id.clone(),
            stage_id: stage.id().to_string(),
            aggregate_score: outcome.aggregate_score,
            passed: outcome.passed,
        });
        tracing::info!(
            run_id = %trace.run_id,
            stage = %stage.id(),
            score = outcome.aggregate_score,
            passed = outcome.passed,
            "Stage completed"
        );
        outcome
    }

    /// Fold the last outcome's metadata updates into the artifact, in
    /// declared criterion order.
    fn merge_metadata(&self, trace: &mut Trace, stage: &CompiledStage) -> Result<()> {
        let Some(outcome) = trace.outcomes.last() else {
            return Ok(());
        };
        for result in &outcome.results {
            trace.artifact.apply_updates(&result.metadata_updates, stage.id())?;
        }
        Ok(())
    }

    async fn on_pass(
        &self,
        trace: &mut Trace,
        index: usize,
        stage: &CompiledStage,
    ) -> Result<RunState> {
        if let Some(repro) = &stage.spec.reproducibility {
            let report = self.verify(trace, index, stage).await?;
            let reason = if !report.passed {
                Some(format!(
                    "{}: reproducibility check failed (success rate {:.2} vs {:.2}, agreement {:.3} vs {:.3})",
                    stage.id(),
                    report.success_rate,
                    SUCCESS_RATE_FLOOR,
                    report.agreement_level,
                    repro.agreement_threshold
                ))
            } else if !report.majority_passed {
                // Trials agree with each other but not with the main run.
                let failed = report.trial_passed.iter().filter(|p| !**p).count();
                Some(format!(
                    "{}: passed once but failed {failed} of {} seeded trials",
                    stage.id(),
                    report.n_trials
                ))
            } else {
                None
            };
            trace.reports.push(report);
            if let Some(reason) = reason {
                return Ok(RunState::Terminal(Disposition::at(
                    FinalStatus::NeedsRevision,
                    stage.id(),
                    reason,
                    "reproducibility_disagreement",
                )));
            }
        }

        let transition = self.inner.spec.pass_transition(index).ok_or_else(|| {
            VerdictError::Routing(format!(
                "stage '{}' has no resolvable on_pass target",
                stage.id()
            ))
        })?;

        Ok(match transition {
            Transition::Stage(next) => RunState::Stage(next),
            Transition::Terminal(FinalStatus::Approved) => {
                let gates = check_gates(&trace.outcomes, &self.inner.spec.gates);
                match gates.failure(&self.inner.spec.gates) {
                    None => RunState::Terminal(Disposition::approved()),
                    Some((code, message)) => RunState::Terminal(Disposition::at(
                        FinalStatus::NeedsRevision,
                        stage.id(),
                        message,
                        code,
                    )),
                }
            }
            Transition::Terminal(status) => RunState::Terminal(Disposition::at(
                status,
                stage.id(),
                format!("{}: routed to {status} on pass", stage.id()),
                "routed",
            )),
        })
    }

    async fn verify(
        &self,
        trace: &Trace,
        index: usize,
        stage: &CompiledStage,
    ) -> Result<ReproducibilityReport> {
        let Some(repro) = &stage.spec.reproducibility else {
            return Err(VerdictError::Other(format!(
                "stage '{}' has no reproducibility settings",
                stage.id()
            )));
        };

        let mut included = HashSet::with_capacity(repro.include.len());
        for id in &repro.include {
            let i = self
                .inner
                .spec
                .stage_index(id)
                .ok_or_else(|| VerdictError::Config(format!("unknown included stage '{id}'")))?;
            included.insert(i);
        }

        // Trials replay the executed path from the earliest included stage
        // through this one, in run order.
        let to = trace.path.iter().position(|i| *i == index).ok_or_else(|| {
            VerdictError::Other(format!("stage '{}' verified before it executed", stage.id()))
        })?;
        let from = trace.path[..to]
            .iter()
            .position(|i| included.contains(i))
            .unwrap_or(to);
        let replay = &trace.path[from..=to];

        let start = trace.snapshots.get(&replay[0]).cloned().ok_or_else(|| {
            VerdictError::Other(format!("no snapshot recorded for stage index {}", replay[0]))
        })?;
        let stages: Vec<Arc<CompiledStage>> = replay
            .iter()
            .filter_map(|i| self.inner.stages.get(*i).cloned())
            .collect();

        let report = ReproducibilityVerifier::verify(
            &start,
            &stages,
            repro.n_trials,
            repro.agreement_threshold,
        )
        .await?;

        self.emit(PipelineEvent::ReproducibilityChecked {
            run_id: trace.run_id.clone(),
            stage_id: stage.id().to_string(),
            success_rate: report.success_rate,
            agreement_level: report.agreement_level,
            passed: report.passed && report.majority_passed,
        });
        Ok(report)
    }

    fn emit(&self, event: PipelineEvent) {
        self.inner.events.emit(event);
    }
}

// ---------------------------------------------------------------------------
// Failure reasons
// ---------------------------------------------------------------------------

fn fail_disposition(stage: &CompiledStage, outcome: &StageOutcome) -> Disposition {
    let hard_fail = outcome
        .hard_fail_triggered
        .first()
        .and_then(|name| outcome.result(name));
    let (culprit, code) = match hard_fail {
        Some(result) => (Some(result), "hard_fail"),
        None => (outcome.lowest_scoring(), "below_threshold"),
    };

    let reason = match culprit {
        Some(result) => render_reason(
            &stage.spec.on_fail.reason,
            &[
                ("stage", stage.id().to_string()),
                ("criterion", result.criterion_name.clone()),
                ("score", format!("{:.3}", result.score)),
                ("detail", result.detail.clone()),
            ],
        ),
        None => format!(
            "{}: aggregate score {:.3} below threshold {:.3}",
            stage.id(),
            outcome.aggregate_score,
            stage.threshold
        ),
    };

    Disposition::at(stage.spec.on_fail.status, stage.id(), reason, code)
}

/// Replace `${key}` placeholders in order.
pub fn render_reason(template: &str, vars: &[(&str, String)]) -> String {
    let mut result = template.to_string();
    for (key, value) in vars {
        result = result.replace(&format!("${{{key}}}"), value);
    }
    result
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
