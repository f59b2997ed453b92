//! Declarative pipeline configuration: stages, weighted criteria, thresholds,
//! and routing.
//!
//! A [`PipelineSpec`] is loaded once (usually from JSON) and is immutable for
//! the lifetime of the engine built from it.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use verdict_types::{FinalStatus, Result, VerdictError};

use crate::criteria::CriterionDef;

/// Tolerance for the per-stage weight sum and threshold comparisons.
pub const WEIGHT_TOLERANCE: f64 = 1e-9;

pub const DEFAULT_QUALITY_MIN: f64 = 0.75;
pub const DEFAULT_CONFIDENCE_MIN: f64 = 0.90;
pub const DEFAULT_SOFT_WARNING_THRESHOLD: f64 = 0.80;
pub const DEFAULT_WARNING_DECAY: f64 = 0.94;
pub const DEFAULT_AGREEMENT_THRESHOLD: f64 = 0.95;

pub const DEFAULT_FAIL_REASON: &str = "${stage}: ${criterion} scored ${score} (${detail})";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub name: String,
    #[serde(default)]
    pub gates: GateConfig,
    /// Built-in criteria instantiated from configuration.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub criteria: Vec<CriterionDef>,
    pub stages: Vec<StageSpec>,
}

/// Global gates applied when a passing stage routes to APPROVED.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default = "default_quality_min")]
    pub quality_min: f64,
    #[serde(default = "default_confidence_min")]
    pub confidence_min: f64,
    /// Stage scores below this count as soft warnings.
    #[serde(default = "default_soft_warning_threshold")]
    pub soft_warning_threshold: f64,
    /// Confidence multiplier applied per soft warning.
    #[serde(default = "default_warning_decay")]
    pub warning_decay: f64,
}

fn default_quality_min() -> f64 {
    DEFAULT_QUALITY_MIN
}
fn default_confidence_min() -> f64 {
    DEFAULT_CONFIDENCE_MIN
}
fn default_soft_warning_threshold() -> f64 {
    DEFAULT_SOFT_WARNING_THRESHOLD
}
fn default_warning_decay() -> f64 {
    DEFAULT_WARNING_DECAY
}
fn default_agreement_threshold() -> f64 {
    DEFAULT_AGREEMENT_THRESHOLD
}
fn default_fail_status() -> FinalStatus {
    FinalStatus::Rejected
}
fn default_fail_reason() -> String {
    DEFAULT_FAIL_REASON.to_string()
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            quality_min: DEFAULT_QUALITY_MIN,
            confidence_min: DEFAULT_CONFIDENCE_MIN,
            soft_warning_threshold: DEFAULT_SOFT_WARNING_THRESHOLD,
            warning_decay: DEFAULT_WARNING_DECAY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionBinding {
    /// Registered criterion name.
    pub criterion: String,
    pub weight: f64,
    /// Evaluations running longer than this are recorded as errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Where a passing stage goes next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Stage(String),
    Terminal(FinalStatus),
}

/// Where a failing stage goes, with the reason template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailRoute {
    #[serde(default = "default_fail_status")]
    pub status: FinalStatus,
    /// Supports `${stage}`, `${criterion}`, `${score}` and `${detail}`.
    #[serde(default = "default_fail_reason")]
    pub reason: String,
}

impl Default for FailRoute {
    fn default() -> Self {
        Self {
            status: default_fail_status(),
            reason: default_fail_reason(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReproducibilitySpec {
    pub n_trials: u32,
    #[serde(default = "default_agreement_threshold")]
    pub agreement_threshold: f64,
    /// Earlier stages re-executed in every trial ahead of this one. Trials
    /// replay everything the run executed from the earliest of them onward,
    /// so listing order does not matter.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub id: String,
    pub criteria: Vec<CriterionBinding>,
    /// Required; kept optional so a missing value surfaces as a lint error.
    #[serde(default)]
    pub pass_threshold: Option<f64>,
    /// Criteria whose individual failure fails the stage outright.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub hard_fail: BTreeSet<String>,
    /// Defaults to the next stage, or the final gates after the last stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_pass: Option<Route>,
    #[serde(default)]
    pub on_fail: FailRoute,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reproducibility: Option<ReproducibilitySpec>,
}

impl StageSpec {
    pub fn new(id: impl Into<String>, pass_threshold: f64) -> Self {
        Self {
            id: id.into(),
            criteria: Vec::new(),
            pass_threshold: Some(pass_threshold),
            hard_fail: BTreeSet::new(),
            on_pass: None,
            on_fail: FailRoute::default(),
            reproducibility: None,
        }
    }

    pub fn criterion(mut self, name: impl Into<String>, weight: f64) -> Self {
        self.criteria.push(CriterionBinding {
            criterion: name.into(),
            weight,
            timeout_ms: None,
        });
        self
    }

    pub fn timed_criterion(
        mut self,
        name: impl Into<String>,
        weight: f64,
        timeout_ms: u64,
    ) -> Self {
        self.criteria.push(CriterionBinding {
            criterion: name.into(),
            weight,
            timeout_ms: Some(timeout_ms),
        });
        self
    }

    pub fn hard_fail(mut self, name: impl Into<String>) -> Self {
        self.hard_fail.insert(name.into());
        self
    }

    pub fn on_pass(mut self, route: Route) -> Self {
        self.on_pass = Some(route);
        self
    }

    pub fn on_fail(mut self, status: FinalStatus, reason: impl Into<String>) -> Self {
        self.on_fail = FailRoute {
            status,
            reason: reason.into(),
        };
        self
    }

    pub fn reproducible(mut self, n_trials: u32, agreement_threshold: f64) -> Self {
        self.reproducibility = Some(ReproducibilitySpec {
            n_trials,
            agreement_threshold,
            include: Vec::new(),
        });
        self
    }

    /// Replay `id` ahead of this stage in reproducibility trials. No effect
    /// unless [`StageSpec::reproducible`] was called first.
    pub fn replaying(mut self, id: impl Into<String>) -> Self {
        if let Some(repro) = &mut self.reproducibility {
            repro.include.push(id.into());
        }
        self
    }

    pub fn weight_sum(&self) -> f64 {
        self.criteria.iter().map(|c| c.weight).sum()
    }
}

impl PipelineSpec {
    pub fn new(name: impl Into<String>, stages: Vec<StageSpec>) -> Self {
        Self {
            name: name.into(),
            gates: GateConfig::default(),
            criteria: Vec::new(),
            stages,
        }
    }

    pub fn with_gates(mut self, gates: GateConfig) -> Self {
        self.gates = gates;
        self
    }

    pub fn from_json_str(source: &str) -> Result<Self> {
        serde_json::from_str(source)
            .map_err(|e| VerdictError::Config(format!("cannot parse pipeline spec: {e}")))
    }

    /// Read and parse a JSON pipeline spec from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_json_str(&source)
    }

    pub fn stage(&self, id: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.id == id)
    }

    pub fn stage_index(&self, id: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.id == id)
    }

    /// Resolve the on-pass transition of the stage at `index`.
    ///
    /// `None` for a stage id that does not exist.
    pub fn pass_transition(&self, index: usize) -> Option<Transition> {
        let stage = self.stages.get(index)?;
        match &stage.on_pass {
            Some(Route::Stage(target)) => self.stage_index(target).map(Transition::Stage),
            Some(Route::Terminal(status)) => Some(Transition::Terminal(*status)),
            None if index + 1 < self.stages.len() => Some(Transition::Stage(index + 1)),
            None => Some(Transition::Terminal(FinalStatus::Approved)),
        }
    }
}

/// A resolved routing target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Stage(usize),
    Terminal(FinalStatus),
}
