//! Staged evaluation engine.
//!
//! This crate drives artifacts through an ordered sequence of stages, each
//! applying weighted criteria: stage execution and aggregation, the routing
//! state machine with global quality/confidence gates, reproducibility
//! trials, the append-only audit store, and idempotent disposition.

pub mod audit;
pub mod batch;
pub mod criteria;
pub mod criterion;
pub mod disposer;
pub mod engine;
pub mod events;
pub mod executor;
pub mod gates;
pub mod reproducibility;
pub mod simulator;
pub mod source;
pub mod spec;
pub mod validation;

pub use audit::{AuditStore, FsAuditStore, MemoryAuditStore};
pub use batch::{BatchConfig, BatchItem, BatchReport, BatchRunner};
pub use criteria::CriterionDef;
pub use criterion::{default_registry, Criterion, CriterionRegistry, EvalContext};
pub use disposer::{DispositionAction, DispositionMode, DispositionResult, FsDisposer, VERDICT_FILE};
pub use engine::{render_reason, PipelineEngine};
pub use events::{EventEmitter, PipelineEvent};
pub use executor::{CompiledStage, StageExecutor};
pub use gates::{check_gates, confidence_level, quality_score, GateResult};
pub use reproducibility::{agreement_level, summarize, ReproducibilityVerifier, TrialSummary};
pub use simulator::{SimulationResult, SimulationSpec, Simulator, SimulatorCriterion};
pub use source::{DataSource, FsDataSource};
pub use spec::{
    CriterionBinding, FailRoute, GateConfig, PipelineSpec, ReproducibilitySpec, Route, StageSpec,
    Transition,
};
pub use validation::{
    validate, validate_or_raise, validate_with_registry, Diagnostic, LintRule, Severity,
};
