//! Pipeline validation: lint rules and diagnostics.
//!
//! Checks the structural and numeric invariants of a [`PipelineSpec`] before
//! any artifact is processed. Call [`validate`] for advisory diagnostics or
//! [`validate_or_raise`] to fail on `Error`-severity issues.

use std::collections::{HashMap, HashSet};

use verdict_types::{FinalStatus, Result, VerdictError};

use crate::criterion::CriterionRegistry;
use crate::spec::{PipelineSpec, Route, Transition, WEIGHT_TOLERANCE};

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub stage_id: Option<String>,
    pub criterion: Option<String>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Diagnostic {
    fn error(rule: &str, message: String) -> Self {
        Self {
            rule: rule.into(),
            severity: Severity::Error,
            message,
            stage_id: None,
            criterion: None,
            fix: None,
        }
    }

    fn warning(rule: &str, message: String) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(rule, message)
        }
    }

    fn at(mut self, stage_id: &str) -> Self {
        self.stage_id = Some(stage_id.to_string());
        self
    }

    fn on(mut self, criterion: &str) -> Self {
        self.criterion = Some(criterion.to_string());
        self
    }

    fn fix(mut self, fix: impl Into<String>) -> Self {
        self.fix = Some(fix.into());
        self
    }
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, spec: &PipelineSpec) -> Vec<Diagnostic>;
}

fn in_unit_range(value: f64) -> bool {
    (0.0..=1.0).contains(&value)
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct NonEmptyPipelineRule;
impl LintRule for NonEmptyPipelineRule {
    fn name(&self) -> &str { "non_empty_pipeline" }
    fn apply(&self, spec: &PipelineSpec) -> Vec<Diagnostic> {
        if spec.stages.is_empty() {
            vec![Diagnostic::error(self.name(), format!("Pipeline '{}' has no stages", spec.name))
                .fix("Declare at least one stage")]
        } else {
            vec![]
        }
    }
}

struct UniqueStageIdsRule;
impl LintRule for UniqueStageIdsRule {
    fn name(&self) -> &str { "unique_stage_ids" }
    fn apply(&self, spec: &PipelineSpec) -> Vec<Diagnostic> {
        let mut seen = HashSet::new();
        spec.stages
            .iter()
            .filter(|s| !seen.insert(s.id.as_str()))
            .map(|s| {
                Diagnostic::error(self.name(), format!("Stage id '{}' is declared more than once", s.id))
                    .at(&s.id)
            })
            .collect()
    }
}

struct WeightSumRule;
impl LintRule for WeightSumRule {
    fn name(&self) -> &str { "weight_sum" }
    fn apply(&self, spec: &PipelineSpec) -> Vec<Diagnostic> {
        spec.stages
            .iter()
            .filter_map(|s| {
                if s.criteria.is_empty() {
                    return Some(
                        Diagnostic::error(self.name(), format!("Stage '{}' has no criteria", s.id))
                            .at(&s.id),
                    );
                }
                let sum = s.weight_sum();
                ((sum - 1.0).abs() > WEIGHT_TOLERANCE).then(|| {
                    Diagnostic::error(
                        self.name(),
                        format!("Stage '{}' criterion weights sum to {sum}, expected 1", s.id),
                    )
                    .at(&s.id)
                    .fix("Rescale the weights so they sum to 1")
                })
            })
            .collect()
    }
}

struct NonNegativeWeightRule;
impl LintRule for NonNegativeWeightRule {
    fn name(&self) -> &str { "non_negative_weight" }
    fn apply(&self, spec: &PipelineSpec) -> Vec<Diagnostic> {
        spec.stages
            .iter()
            .flat_map(|s| {
                s.criteria
                    .iter()
                    .filter(|c| !(c.weight >= 0.0 && c.weight.is_finite()))
                    .map(move |c| {
                        Diagnostic::error(
                            self.name(),
                            format!(
                                "Stage '{}' gives criterion '{}' invalid weight {}",
                                s.id, c.criterion, c.weight
                            ),
                        )
                        .at(&s.id)
                        .on(&c.criterion)
                    })
            })
            .collect()
    }
}

struct ThresholdRule;
impl LintRule for ThresholdRule {
    fn name(&self) -> &str { "pass_threshold" }
    fn apply(&self, spec: &PipelineSpec) -> Vec<Diagnostic> {
        spec.stages
            .iter()
            .filter_map(|s| match s.pass_threshold {
                None => Some(
                    Diagnostic::error(self.name(), format!("Stage '{}' has no pass_threshold", s.id))
                        .at(&s.id)
                        .fix("Add a pass_threshold between 0 and 1"),
                ),
                Some(t) if !in_unit_range(t) => Some(
                    Diagnostic::error(
                        self.name(),
                        format!("Stage '{}' pass_threshold {t} is outside [0, 1]", s.id),
                    )
                    .at(&s.id),
                ),
                Some(_) => None,
            })
            .collect()
    }
}

struct HardFailMembershipRule;
impl LintRule for HardFailMembershipRule {
    fn name(&self) -> &str { "hard_fail_membership" }
    fn apply(&self, spec: &PipelineSpec) -> Vec<Diagnostic> {
        spec.stages
            .iter()
            .flat_map(|s| {
                s.hard_fail
                    .iter()
                    .filter(move |name| !s.criteria.iter().any(|c| &c.criterion == *name))
                    .map(move |name| {
                        Diagnostic::error(
                            self.name(),
                            format!("Stage '{}' marks '{name}' hard-fail but does not evaluate it", s.id),
                        )
                        .at(&s.id)
                        .on(name)
                    })
            })
            .collect()
    }
}

struct DuplicateCriterionRule;
impl LintRule for DuplicateCriterionRule {
    fn name(&self) -> &str { "duplicate_criterion" }
    fn apply(&self, spec: &PipelineSpec) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for s in &spec.stages {
            let mut seen = HashSet::new();
            for c in &s.criteria {
                if !seen.insert(c.criterion.as_str()) {
                    out.push(
                        Diagnostic::warning(
                            self.name(),
                            format!("Stage '{}' evaluates '{}' more than once", s.id, c.criterion),
                        )
                        .at(&s.id)
                        .on(&c.criterion),
                    );
                }
            }
        }
        out
    }
}

struct RouteTargetExistsRule;
impl LintRule for RouteTargetExistsRule {
    fn name(&self) -> &str { "route_target_exists" }
    fn apply(&self, spec: &PipelineSpec) -> Vec<Diagnostic> {
        spec.stages
            .iter()
            .filter_map(|s| match &s.on_pass {
                Some(Route::Stage(target)) if spec.stage(target).is_none() => Some(
                    Diagnostic::error(
                        self.name(),
                        format!("Stage '{}' routes to non-existent stage '{target}'", s.id),
                    )
                    .at(&s.id)
                    .fix(format!("Add stage '{target}' or fix on_pass")),
                ),
                _ => None,
            })
            .collect()
    }
}

struct TerminalStatusRule;
impl LintRule for TerminalStatusRule {
    fn name(&self) -> &str { "terminal_status" }
    fn apply(&self, spec: &PipelineSpec) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for s in &spec.stages {
            if matches!(s.on_fail.status, FinalStatus::Approved | FinalStatus::Error) {
                out.push(
                    Diagnostic::error(
                        self.name(),
                        format!("Stage '{}' cannot route a failure to {}", s.id, s.on_fail.status),
                    )
                    .at(&s.id)
                    .fix("Use rejected, needs_revision or conditional"),
                );
            }
            if s.on_pass == Some(Route::Terminal(FinalStatus::Error)) {
                out.push(
                    Diagnostic::error(
                        self.name(),
                        format!("Stage '{}' cannot route a pass to error", s.id),
                    )
                    .at(&s.id),
                );
            }
        }
        out
    }
}

struct RoutingCycleRule;
impl LintRule for RoutingCycleRule {
    fn name(&self) -> &str { "routing_cycle" }
    fn apply(&self, spec: &PipelineSpec) -> Vec<Diagnostic> {
        (0..spec.stages.len())
            .filter(|&start| revisits(spec, start))
            .map(|start| {
                let id = &spec.stages[start].id;
                Diagnostic::error(self.name(), format!("Stage '{id}' is part of a routing cycle"))
                    .at(id)
                    .fix("Route forward to a later stage or a terminal status")
            })
            .collect()
    }
}

/// Whether following pass transitions from `start` leads back to it. Each
/// stage has exactly one pass transition, so the walk is a simple chain.
fn revisits(spec: &PipelineSpec, start: usize) -> bool {
    let mut visited = HashSet::new();
    let mut current = start;
    loop {
        match spec.pass_transition(current) {
            Some(Transition::Stage(next)) if next == start => return true,
            Some(Transition::Stage(next)) if visited.insert(next) => current = next,
            _ => return false,
        }
    }
}

struct ReachabilityRule;
impl LintRule for ReachabilityRule {
    fn name(&self) -> &str { "reachability" }
    fn apply(&self, spec: &PipelineSpec) -> Vec<Diagnostic> {
        if spec.stages.is_empty() {
            return vec![];
        }
        let mut reachable = HashSet::new();
        let mut current = 0;
        while reachable.insert(current) {
            match spec.pass_transition(current) {
                Some(Transition::Stage(next)) => current = next,
                _ => break,
            }
        }
        spec.stages
            .iter()
            .enumerate()
            .filter(|(i, _)| !reachable.contains(i))
            .map(|(_, s)| {
                Diagnostic::warning(
                    self.name(),
                    format!("Stage '{}' is not reachable from the first stage", s.id),
                )
                .at(&s.id)
                .fix(format!("Route to '{}' or remove it", s.id))
            })
            .collect()
    }
}

struct ReproducibilityRule;
impl LintRule for ReproducibilityRule {
    fn name(&self) -> &str { "reproducibility" }
    fn apply(&self, spec: &PipelineSpec) -> Vec<Diagnostic> {
        let positions: HashMap<&str, usize> = spec
            .stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();
        let mut out = Vec::new();
        for (index, s) in spec.stages.iter().enumerate() {
            let Some(repro) = &s.reproducibility else { continue };
            if repro.n_trials == 0 {
                out.push(
                    Diagnostic::error(self.name(), format!("Stage '{}' requests zero reproducibility trials", s.id))
                        .at(&s.id)
                        .fix("Set n_trials to at least 1"),
                );
            }
            if !in_unit_range(repro.agreement_threshold) {
                out.push(
                    Diagnostic::error(
                        self.name(),
                        format!(
                            "Stage '{}' agreement_threshold {} is outside [0, 1]",
                            s.id, repro.agreement_threshold
                        ),
                    )
                    .at(&s.id),
                );
            }
            for included in &repro.include {
                match positions.get(included.as_str()) {
                    Some(&pos) if pos < index => {}
                    Some(_) => out.push(
                        Diagnostic::error(
                            self.name(),
                            format!("Stage '{}' includes '{included}', which does not precede it", s.id),
                        )
                        .at(&s.id),
                    ),
                    None => out.push(
                        Diagnostic::error(
                            self.name(),
                            format!("Stage '{}' includes non-existent stage '{included}'", s.id),
                        )
                        .at(&s.id),
                    ),
                }
            }
        }
        out
    }
}

struct GateRangeRule;
impl LintRule for GateRangeRule {
    fn name(&self) -> &str { "gate_range" }
    fn apply(&self, spec: &PipelineSpec) -> Vec<Diagnostic> {
        let g = &spec.gates;
        let mut out = Vec::new();
        for (field, value) in [
            ("quality_min", g.quality_min),
            ("confidence_min", g.confidence_min),
            ("soft_warning_threshold", g.soft_warning_threshold),
        ] {
            if !in_unit_range(value) {
                out.push(Diagnostic::error(self.name(), format!("Gate {field} {value} is outside [0, 1]")));
            }
        }
        if !(g.warning_decay > 0.0 && g.warning_decay < 1.0) {
            out.push(
                Diagnostic::error(
                    self.name(),
                    format!("Gate warning_decay {} must be in (0, 1)", g.warning_decay),
                )
                .fix("Use a decay such as 0.94"),
            );
        }
        out
    }
}

struct RegisteredCriteriaRule<'a> {
    registry: &'a CriterionRegistry,
}
impl LintRule for RegisteredCriteriaRule<'_> {
    fn name(&self) -> &str { "registered_criteria" }
    fn apply(&self, spec: &PipelineSpec) -> Vec<Diagnostic> {
        spec.stages
            .iter()
            .flat_map(|s| {
                s.criteria
                    .iter()
                    .filter(move |c| !self.registry.has(&c.criterion))
                    .map(move |c| {
                        Diagnostic::error(
                            self.name(),
                            format!("Stage '{}' references unregistered criterion '{}'", s.id, c.criterion),
                        )
                        .at(&s.id)
                        .on(&c.criterion)
                        .fix("Register the criterion or declare it under \"criteria\"")
                    })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

fn structural_rules() -> Vec<Box<dyn LintRule>> {
    vec![
        Box::new(NonEmptyPipelineRule),
        Box::new(UniqueStageIdsRule),
        Box::new(WeightSumRule),
        Box::new(NonNegativeWeightRule),
        Box::new(ThresholdRule),
        Box::new(HardFailMembershipRule),
        Box::new(DuplicateCriterionRule),
        Box::new(RouteTargetExistsRule),
        Box::new(TerminalStatusRule),
        Box::new(RoutingCycleRule),
        Box::new(ReachabilityRule),
        Box::new(ReproducibilityRule),
        Box::new(GateRangeRule),
    ]
}

/// Run every structural rule. Criterion names are not checked.
pub fn validate(spec: &PipelineSpec) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for rule in structural_rules() {
        diagnostics.extend(rule.apply(spec));
    }
    diagnostics
}

/// Run every rule, including the check that each criterion is registered.
pub fn validate_with_registry(
    spec: &PipelineSpec,
    registry: &CriterionRegistry,
) -> Vec<Diagnostic> {
    let mut diagnostics = validate(spec);
    diagnostics.extend(RegisteredCriteriaRule { registry }.apply(spec));
    diagnostics
}

/// Fail on any `Error` diagnostic.
///
/// Errors are grouped by kind; the first non-empty group in the order
/// aggregation, routing, unknown criterion, other configuration becomes the
/// returned error.
pub fn validate_or_raise(
    spec: &PipelineSpec,
    registry: &CriterionRegistry,
) -> Result<Vec<Diagnostic>> {
    let diagnostics = validate_with_registry(spec, registry);
    let errors: Vec<&Diagnostic> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .collect();
    if errors.is_empty() {
        return Ok(diagnostics);
    }

    let joined = |rules: &[&str]| -> Option<String> {
        let messages: Vec<_> = errors
            .iter()
            .filter(|d| rules.contains(&d.rule.as_str()))
            .map(|d| d.message.clone())
            .collect();
        (!messages.is_empty()).then(|| messages.join("; "))
    };

    if let Some(msg) = joined(&["weight_sum", "non_negative_weight", "pass_threshold"]) {
        return Err(VerdictError::StageAggregation(msg));
    }
    if let Some(msg) = joined(&["route_target_exists", "routing_cycle", "terminal_status"]) {
        return Err(VerdictError::Routing(msg));
    }
    if let Some(d) = errors.iter().find(|d| d.rule == "registered_criteria") {
        return Err(VerdictError::UnknownCriterion {
            stage: d.stage_id.clone().unwrap_or_default(),
            criterion: d.criterion.clone().unwrap_or_default(),
        });
    }
    let messages: Vec<_> = errors.iter().map(|d| d.message.clone()).collect();
    Err(VerdictError::Config(messages.join("; ")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criterion::default_registry;
    use crate::spec::{GateConfig, StageSpec};

    fn stage(id: &str) -> StageSpec {
        StageSpec::new(id, 0.5).criterion("non_empty", 1.0)
    }

    fn has(diags: &[Diagnostic], rule: &str, severity: Severity) -> bool {
        diags.iter().any(|d| d.rule == rule && d.severity == severity)
    }

    #[test]
    fn valid_pipeline_passes() {
        let spec = PipelineSpec::new("p", vec![stage("a"), stage("b")]);
        let diags = validate_or_raise(&spec, &default_registry()).unwrap();
        assert!(diags.is_empty(), "unexpected diagnostics: {diags:?}");
    }

    #[test]
    fn empty_pipeline_is_error() {
        let spec = PipelineSpec::new("p", vec![]);
        assert!(has(&validate(&spec), "non_empty_pipeline", Severity::Error));
    }

    #[test]
    fn weights_must_sum_to_one() {
        let spec = PipelineSpec::new(
            "p",
            vec![StageSpec::new("s", 0.5).criterion("non_empty", 0.6).criterion("x", 0.3)],
        );
        assert!(has(&validate(&spec), "weight_sum", Severity::Error));
        let err = validate_or_raise(&spec, &default_registry()).unwrap_err();
        assert!(matches!(err, VerdictError::StageAggregation(_)), "got {err:?}");
    }

    #[test]
    fn weight_sum_within_tolerance_is_accepted() {
        let spec = PipelineSpec::new(
            "p",
            vec![StageSpec::new("s", 0.5)
                .criterion("non_empty", 0.1)
                .criterion("non_empty_2", 0.2)
                .criterion("non_empty_3", 0.7)],
        );
        assert!(!has(&validate(&spec), "weight_sum", Severity::Error));
    }

    #[test]
    fn missing_threshold_is_aggregation_error() {
        let mut s = stage("s");
        s.pass_threshold = None;
        let err = validate_or_raise(&PipelineSpec::new("p", vec![s]), &default_registry()).unwrap_err();
        assert!(matches!(err, VerdictError::StageAggregation(ref m) if m.contains("pass_threshold")));
    }

    #[test]
    fn hard_fail_must_name_stage_criterion() {
        let spec = PipelineSpec::new("p", vec![stage("s").hard_fail("energy")]);
        assert!(has(&validate(&spec), "hard_fail_membership", Severity::Error));
    }

    #[test]
    fn missing_route_target_is_routing_error() {
        let spec = PipelineSpec::new("p", vec![stage("a").on_pass(Route::Stage("ghost".into()))]);
        let err = validate_or_raise(&spec, &default_registry()).unwrap_err();
        assert!(matches!(err, VerdictError::Routing(ref m) if m.contains("ghost")));
    }

    #[test]
    fn backward_route_is_a_cycle() {
        let spec = PipelineSpec::new(
            "p",
            vec![stage("a"), stage("b").on_pass(Route::Stage("a".into()))],
        );
        let diags = validate(&spec);
        let cycles: Vec<_> = diags.iter().filter(|d| d.rule == "routing_cycle").collect();
        assert_eq!(cycles.len(), 2);
        assert!(matches!(
            validate_or_raise(&spec, &default_registry()),
            Err(VerdictError::Routing(_))
        ));
    }

    #[test]
    fn skipped_stage_is_unreachable_warning() {
        let spec = PipelineSpec::new(
            "p",
            vec![stage("a").on_pass(Route::Stage("c".into())), stage("b"), stage("c")],
        );
        let diags = validate(&spec);
        assert!(diags
            .iter()
            .any(|d| d.rule == "reachability" && d.severity == Severity::Warning && d.message.contains("'b'")));
        assert!(validate_or_raise(&spec, &default_registry()).is_ok());
    }

    #[test]
    fn failure_cannot_route_to_approved() {
        let spec = PipelineSpec::new("p", vec![stage("a").on_fail(FinalStatus::Approved, "x")]);
        assert!(has(&validate(&spec), "terminal_status", Severity::Error));
    }

    #[test]
    fn unknown_criterion_is_reported() {
        let spec = PipelineSpec::new("p", vec![StageSpec::new("s", 0.5).criterion("energy", 1.0)]);
        let err = validate_or_raise(&spec, &default_registry()).unwrap_err();
        match err {
            VerdictError::UnknownCriterion { stage, criterion } => {
                assert_eq!(stage, "s");
                assert_eq!(criterion, "energy");
            }
            other => panic!("expected UnknownCriterion, got: {other:?}"),
        }
    }

    #[test]
    fn reproducibility_include_must_precede() {
        let mut s = stage("b").reproducible(0, 0.95);
        if let Some(r) = s.reproducibility.as_mut() {
            r.include = vec!["c".into(), "ghost".into()];
        }
        let spec = PipelineSpec::new("p", vec![stage("a"), s, stage("c")]);
        let diags: Vec<_> = validate(&spec)
            .into_iter()
            .filter(|d| d.rule == "reproducibility")
            .collect();
        assert_eq!(diags.len(), 3);
        assert!(matches!(
            validate_or_raise(&spec, &default_registry()),
            Err(VerdictError::Config(_))
        ));
    }

    #[test]
    fn gate_values_must_be_in_range() {
        let spec = PipelineSpec::new("p", vec![stage("a")]).with_gates(GateConfig {
            warning_decay: 1.5,
            confidence_min: -0.1,
            ..GateConfig::default()
        });
        let diags: Vec<_> = validate(&spec).into_iter().filter(|d| d.rule == "gate_range").collect();
        assert_eq!(diags.len(), 2);
    }

    #[test]
    fn duplicate_criterion_is_warning() {
        let spec = PipelineSpec::new(
            "p",
            vec![StageSpec::new("s", 0.5).criterion("non_empty", 0.5).criterion("non_empty", 0.5)],
        );
        assert!(has(&validate(&spec), "duplicate_criterion", Severity::Warning));
    }
}
