//! Global quality and confidence gates checked before a run may be approved.

use verdict_types::StageOutcome;

use crate::spec::GateConfig;

/// Result of checking the global gates over a run's main outcome sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct GateResult {
    pub quality_score: f64,
    pub confidence_level: f64,
    /// Outcomes whose aggregate fell below the soft-warning threshold.
    pub soft_warnings: usize,
    pub quality_ok: bool,
    pub confidence_ok: bool,
}

impl GateResult {
    pub fn satisfied(&self) -> bool {
        self.quality_ok && self.confidence_ok
    }

    /// Reason code and message for the first unsatisfied gate.
    pub fn failure(&self, gates: &GateConfig) -> Option<(&'static str, String)> {
        if !self.quality_ok {
            Some((
                "quality_gate",
                format!(
                    "quality score {:.3} below minimum {:.3}",
                    self.quality_score, gates.quality_min
                ),
            ))
        } else if !self.confidence_ok {
            Some((
                "confidence_gate",
                format!(
                    "confidence level {:.3} below minimum {:.3} ({} soft warning(s))",
                    self.confidence_level, gates.confidence_min, self.soft_warnings
                ),
            ))
        } else {
            None
        }
    }
}

/// Mean aggregate score; 0 for an empty run.
pub fn quality_score(outcomes: &[StageOutcome]) -> f64 {
    if outcomes.is_empty() {
        return 0.0;
    }
    outcomes.iter().map(|o| o.aggregate_score).sum::<f64>() / outcomes.len() as f64
}

/// Pass fraction, decayed once per outcome below the soft-warning threshold.
pub fn confidence_level(outcomes: &[StageOutcome], gates: &GateConfig) -> f64 {
    if outcomes.is_empty() {
        return 0.0;
    }
    let passed = outcomes.iter().filter(|o| o.passed).count() as f64;
    let fraction = passed / outcomes.len() as f64;
    let warnings = soft_warnings(outcomes, gates);
    (fraction * gates.warning_decay.powi(warnings as i32)).clamp(0.0, 1.0)
}

fn soft_warnings(outcomes: &[StageOutcome], gates: &GateConfig) -> usize {
    outcomes
        .iter()
        .filter(|o| o.aggregate_score < gates.soft_warning_threshold)
        .count()
}

pub fn check_gates(outcomes: &[StageOutcome], gates: &GateConfig) -> GateResult {
    let quality_score = quality_score(outcomes);
    let confidence_level = confidence_level(outcomes, gates);
    GateResult {
        quality_score,
        confidence_level,
        soft_warnings: soft_warnings(outcomes, gates),
        quality_ok: quality_score >= gates.quality_min,
        confidence_ok: confidence_level >= gates.confidence_min,
    }
}
