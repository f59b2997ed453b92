//! Shared types, identities, and errors for the Verdict evaluation pipeline.
//!
//! This crate provides the foundational types used across all other Verdict crates:
//! - `VerdictError`: unified error taxonomy
//! - `Artifact`: the submitted item under review, with its accumulated metadata
//! - `ScoreResult` / `StageOutcome`: immutable per-criterion and per-stage results
//! - `PipelineRun`: the full record of one artifact's traversal

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Unified error type for all Verdict subsystems.
#[derive(Debug, thiserror::Error)]
pub enum VerdictError {
    // === Evaluation Errors ===
    #[error("Criterion '{criterion}' failed: {message}")]
    Criterion { criterion: String, message: String },

    #[error("Criterion '{criterion}' timed out after {timeout_ms}ms")]
    CriterionTimeout { criterion: String, timeout_ms: u64 },

    #[error("Metadata key '{key}' written with a conflicting value in stage '{stage}'")]
    MetadataConflict { key: String, stage: String },

    #[error("Reproducibility trial {trial} failed: {message}")]
    Trial { trial: u32, message: String },

    // === Configuration Errors ===
    #[error("Stage aggregation invalid: {0}")]
    StageAggregation(String),

    #[error("Routing invalid: {0}")]
    Routing(String),

    #[error("Stage '{stage}' references unregistered criterion '{criterion}'")]
    UnknownCriterion { stage: String, criterion: String },

    #[error("Pipeline configuration invalid: {0}")]
    Config(String),

    // === Persistence & Disposition Errors ===
    #[error("Artifact '{artifact_id}' is already disposed as {existing}; refusing to dispose it as {requested}")]
    DispositionConflict {
        artifact_id: String,
        existing: FinalStatus,
        requested: FinalStatus,
    },

    #[error("Audit store error: {0}")]
    Audit(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl VerdictError {
    /// Returns `true` for errors that must stop the engine before any artifact
    /// is processed.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            VerdictError::StageAggregation(_)
                | VerdictError::Routing(_)
                | VerdictError::UnknownCriterion { .. }
                | VerdictError::Config(_)
        )
    }

    /// Stable snake_case code persisted alongside ERROR runs.
    pub fn reason_code(&self) -> &'static str {
        match self {
            VerdictError::Criterion { .. } => "criterion_error",
            VerdictError::CriterionTimeout { .. } => "criterion_timeout",
            VerdictError::MetadataConflict { .. } => "metadata_conflict",
            VerdictError::Trial { .. } => "trial_failed",
            VerdictError::StageAggregation(_) => "stage_aggregation",
            VerdictError::Routing(_) => "routing",
            VerdictError::UnknownCriterion { .. } => "unknown_criterion",
            VerdictError::Config(_) => "config",
            VerdictError::DispositionConflict { .. } => "disposition_conflict",
            VerdictError::Audit(_) => "audit",
            VerdictError::NotFound(_) => "not_found",
            VerdictError::Io(_) => "io",
            VerdictError::Json(_) => "json",
            VerdictError::Other(_) => "internal",
        }
    }
}

/// A convenience alias for `Result<T, VerdictError>`.
pub type Result<T> = std::result::Result<T, VerdictError>;

// ---------------------------------------------------------------------------
// Artifact identity and metadata
// ---------------------------------------------------------------------------

/// Free-form facts accumulated about an artifact across stages.
///
/// Ordered map so serialized records are byte-stable.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Stable artifact identifier: a content hash, or a caller-chosen token.
///
/// Identifiers double as file names in the audit store and disposition
/// buckets, so only `[A-Za-z0-9._-]` is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(String);

impl ArtifactId {
    /// Validate and wrap a caller-supplied identifier.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let valid = !id.is_empty()
            && id != "."
            && id != ".."
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !valid {
            return Err(VerdictError::Other(format!(
                "Invalid artifact id '{id}': expected non-empty [A-Za-z0-9._-]"
            )));
        }
        Ok(Self(id))
    }

    /// SHA-256 of the content, hex-encoded.
    pub fn from_content(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, for log lines.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(12);
        &self.0[..end]
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The submitted item under review.
///
/// Content is shared and never mutated after intake; only the metadata bag
/// grows as stages extract facts from it.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub id: ArtifactId,
    /// Display name; also the file name used at the disposition destination.
    pub name: String,
    /// Where the artifact was loaded from, if it lives on disk.
    pub source: Option<PathBuf>,
    pub metadata: Metadata,
    content: Arc<[u8]>,
}

impl Artifact {
    /// Create an artifact whose id is the hash of its content.
    pub fn from_bytes(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        let content: Vec<u8> = content.into();
        Self {
            id: ArtifactId::from_content(&content),
            name: name.into(),
            source: None,
            metadata: Metadata::new(),
            content: content.into(),
        }
    }

    /// Read a file and create an artifact that remembers its source path.
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".to_string());
        Ok(Self::from_bytes(name, content).with_source(path))
    }

    /// Replace the content-derived id with an explicit one.
    pub fn with_id(mut self, id: ArtifactId) -> Self {
        self.id = id;
        self
    }

    pub fn with_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.source = Some(path.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Raw content bytes.
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Content decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }

    /// Merge `updates` into the metadata bag.
    ///
    /// Insertion order must not matter, so writing a *different* value to a
    /// key that already exists is a conflict. Re-writing an identical value
    /// is accepted.
    pub fn apply_updates(&mut self, updates: &Metadata, stage: &str) -> Result<()> {
        for (key, value) in updates {
            if let Some(existing) = self.metadata.get(key) {
                if existing != value {
                    return Err(VerdictError::MetadataConflict {
                        key: key.clone(),
                        stage: stage.to_string(),
                    });
                }
            }
        }
        self.metadata
            .extend(updates.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    /// Merge `updates`, last write wins. Used for throwaway trial copies.
    pub fn overwrite_updates(&mut self, updates: &Metadata) {
        self.metadata
            .extend(updates.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

// ---------------------------------------------------------------------------
// ScoreResult: output of one criterion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub criterion_name: String,
    /// Normalised to [0, 1].
    pub score: f64,
    pub passed: bool,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Facts the criterion extracted; merged into the artifact after the stage.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata_updates: Metadata,
}

impl ScoreResult {
    pub fn new(
        criterion_name: impl Into<String>,
        score: f64,
        passed: bool,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            criterion_name: criterion_name.into(),
            score,
            passed,
            detail: detail.into(),
            error: None,
            metadata_updates: Metadata::new(),
        }
    }

    /// A passing result.
    pub fn pass(criterion_name: impl Into<String>, score: f64, detail: impl Into<String>) -> Self {
        Self::new(criterion_name, score, true, detail)
    }

    /// A failing result.
    pub fn fail(criterion_name: impl Into<String>, score: f64, detail: impl Into<String>) -> Self {
        Self::new(criterion_name, score, false, detail)
    }

    /// A criterion that could not be evaluated: score 0, failed, with the error kept.
    pub fn errored(criterion_name: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            criterion_name: criterion_name.into(),
            score: 0.0,
            passed: false,
            detail: format!("evaluation error: {message}"),
            error: Some(message),
            metadata_updates: Metadata::new(),
        }
    }

    pub fn with_update(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata_updates.insert(key.into(), value);
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

// ---------------------------------------------------------------------------
// StageOutcome: aggregate of one stage on one artifact
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage_id: String,
    /// Per-criterion results in declared order.
    pub results: Vec<ScoreResult>,
    pub aggregate_score: f64,
    pub passed: bool,
    /// Hard-fail criteria that failed, forcing `passed = false`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hard_fail_triggered: Vec<String>,
    /// Set only for executions inside a reproducibility check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_index: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

impl StageOutcome {
    /// Lowest-scoring criterion; ties resolve to the first declared.
    pub fn lowest_scoring(&self) -> Option<&ScoreResult> {
        self.results.iter().fold(None, |lowest, r| match lowest {
            Some(l) if l.score <= r.score => Some(l),
            _ => Some(r),
        })
    }

    /// Criteria that raised instead of scoring.
    pub fn errors(&self) -> impl Iterator<Item = &ScoreResult> {
        self.results.iter().filter(|r| r.is_error())
    }

    pub fn result(&self, criterion: &str) -> Option<&ScoreResult> {
        self.results.iter().find(|r| r.criterion_name == criterion)
    }
}

// ---------------------------------------------------------------------------
// FinalStatus and disposition buckets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Approved,
    Rejected,
    NeedsRevision,
    Conditional,
    Error,
}

impl FinalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalStatus::Approved => "approved",
            FinalStatus::Rejected => "rejected",
            FinalStatus::NeedsRevision => "needs_revision",
            FinalStatus::Conditional => "conditional",
            FinalStatus::Error => "error",
        }
    }

    /// ERROR shares the rejected bucket; the run's reason code tells them apart.
    pub fn bucket(&self) -> Bucket {
        match self {
            FinalStatus::Approved => Bucket::Approved,
            FinalStatus::Rejected | FinalStatus::Error => Bucket::Rejected,
            FinalStatus::NeedsRevision => Bucket::NeedsRevision,
            FinalStatus::Conditional => Bucket::Conditional,
        }
    }
}

impl fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named destination an artifact is relocated into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Approved,
    Rejected,
    NeedsRevision,
    Conditional,
}

impl Bucket {
    pub const ALL: [Bucket; 4] = [
        Bucket::Approved,
        Bucket::Rejected,
        Bucket::NeedsRevision,
        Bucket::Conditional,
    ];

    /// Directory name on disk.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Bucket::Approved => "approved",
            Bucket::Rejected => "rejected",
            Bucket::NeedsRevision => "needs-revision",
            Bucket::Conditional => "conditional",
        }
    }
}

// ---------------------------------------------------------------------------
// ReproducibilityReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReproducibilityReport {
    /// The stage carrying the reproducibility check.
    pub stage_id: String,
    /// Stages re-executed in every trial, in order.
    pub stage_subset: Vec<String>,
    pub n_trials: u32,
    /// Per-trial mean aggregate score over the subset.
    pub trial_scores: Vec<f64>,
    /// Per-trial pass flag (every subset stage passed).
    pub trial_passed: Vec<bool>,
    pub majority_passed: bool,
    pub success_rate: f64,
    pub agreement_level: f64,
    pub agreement_threshold: f64,
    pub passed: bool,
    /// Every trial execution, tagged with its `trial_index`.
    pub trials: Vec<StageOutcome>,
}

// ---------------------------------------------------------------------------
// PipelineRun: one artifact's full traversal
// ---------------------------------------------------------------------------

/// Keys excluded from the decision digest: they vary between otherwise
/// identical runs.
const VOLATILE_KEYS: &[&str] = &["run_id", "timestamp", "started_at", "finished_at"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub artifact_id: ArtifactId,
    pub artifact_name: String,
    pub pipeline: String,
    /// Main stage sequence, one outcome per executed stage.
    pub outcomes: Vec<StageOutcome>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reproducibility: Vec<ReproducibilityReport>,
    pub final_status: FinalStatus,
    pub rejection_stage: Option<String>,
    pub rejection_reason: Option<String>,
    /// Machine-readable cause for ERROR and gate/reproducibility dispositions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
    pub quality_score: f64,
    pub confidence_level: f64,
    /// Artifact metadata as it stood when the run finished.
    #[serde(default)]
    pub final_metadata: Metadata,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn bucket(&self) -> Bucket {
        self.final_status.bucket()
    }

    pub fn passed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.passed).count()
    }

    pub fn outcome(&self, stage_id: &str) -> Option<&StageOutcome> {
        self.outcomes.iter().find(|o| o.stage_id == stage_id)
    }

    /// One-line human-readable summary.
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{} {} (quality {:.3}, confidence {:.3}, {}/{} stages passed)",
            self.artifact_id.short(),
            self.final_status,
            self.quality_score,
            self.confidence_level,
            self.passed_count(),
            self.outcomes.len()
        );
        if let Some(ref reason) = self.rejection_reason {
            line.push_str(": ");
            line.push_str(reason);
        }
        line
    }

    /// SHA-256 over the run's decision chain with run id and timestamps
    /// removed. Two runs over the same artifact and configuration produce the
    /// same digest.
    pub fn decision_digest(&self) -> Result<String> {
        let mut value = serde_json::to_value(self)?;
        strip_volatile(&mut value);
        let bytes = serde_json::to_vec(&value)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }
}

fn strip_volatile(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for key in VOLATILE_KEYS {
                map.remove(*key);
            }
            for v in map.values_mut() {
                strip_volatile(v);
            }
        }
        serde_json::Value::Array(items) => {
            for v in items {
                strip_volatile(v);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(stage: &str, results: Vec<ScoreResult>, score: f64, passed: bool) -> StageOutcome {
        StageOutcome {
            stage_id: stage.into(),
            results,
            aggregate_score: score,
            passed,
            hard_fail_triggered: vec![],
            trial_index: None,
            timestamp: Utc::now(),
        }
    }

    fn sample_run() -> PipelineRun {
        PipelineRun {
            run_id: "run-1".into(),
            artifact_id: ArtifactId::from_content(b"paper"),
            artifact_name: "paper.md".into(),
            pipeline: "review".into(),
            outcomes: vec![outcome(
                "intake",
                vec![ScoreResult::pass("non_empty", 1.0, "has content")],
                1.0,
                true,
            )],
            reproducibility: vec![],
            final_status: FinalStatus::Approved,
            rejection_stage: None,
            rejection_reason: None,
            reason_code: None,
            quality_score: 1.0,
            confidence_level: 1.0,
            final_metadata: Metadata::new(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    // --- Errors ---

    #[test]
    fn error_display_criterion() {
        let err = VerdictError::Criterion {
            criterion: "units".into(),
            message: "parser crashed".into(),
        };
        assert_eq!(err.to_string(), "Criterion 'units' failed: parser crashed");
    }

    #[test]
    fn error_display_disposition_conflict() {
        let err = VerdictError::DispositionConflict {
            artifact_id: "abc".into(),
            existing: FinalStatus::Approved,
            requested: FinalStatus::Rejected,
        };
        assert_eq!(
            err.to_string(),
            "Artifact 'abc' is already disposed as approved; refusing to dispose it as rejected"
        );
    }

    #[test]
    fn config_errors_are_classified() {
        assert!(VerdictError::StageAggregation("x".into()).is_config_error());
        assert!(VerdictError::Routing("x".into()).is_config_error());
        assert!(VerdictError::UnknownCriterion {
            stage: "s".into(),
            criterion: "c".into()
        }
        .is_config_error());
        assert!(!VerdictError::Audit("x".into()).is_config_error());
        assert!(!VerdictError::MetadataConflict {
            key: "k".into(),
            stage: "s".into()
        }
        .is_config_error());
    }

    #[test]
    fn reason_codes_are_stable() {
        let err = VerdictError::MetadataConflict {
            key: "claims".into(),
            stage: "extract".into(),
        };
        assert_eq!(err.reason_code(), "metadata_conflict");
        assert_eq!(VerdictError::Other("boom".into()).reason_code(), "internal");
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: VerdictError = io_err.into();
        assert!(matches!(err, VerdictError::Io(_)));
    }

    // --- ArtifactId ---

    #[test]
    fn artifact_id_from_content_is_sha256_hex() {
        let id = ArtifactId::from_content(b"hello");
        assert_eq!(
            id.as_str(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(id.short(), "2cf24dba5fb0");
    }

    #[test]
    fn artifact_id_rejects_path_separators() {
        assert!(ArtifactId::new("paper-01.v2").is_ok());
        assert!(ArtifactId::new("../etc").is_err());
        assert!(ArtifactId::new("a/b").is_err());
        assert!(ArtifactId::new("").is_err());
        assert!(ArtifactId::new("..").is_err());
    }

    // --- Artifact ---

    #[test]
    fn artifact_from_path_keeps_source_and_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        std::fs::write(&path, "energy is conserved").unwrap();

        let artifact = Artifact::from_path(&path).unwrap();
        assert_eq!(artifact.name, "note.txt");
        assert_eq!(artifact.source.as_deref(), Some(path.as_path()));
        assert_eq!(artifact.text(), "energy is conserved");
        assert_eq!(artifact.id, ArtifactId::from_content(b"energy is conserved"));
    }

    #[test]
    fn apply_updates_accepts_identical_rewrites() {
        let mut artifact = Artifact::from_bytes("a", "x")
            .with_metadata("claims", serde_json::json!(["c1"]));
        let mut updates = Metadata::new();
        updates.insert("claims".into(), serde_json::json!(["c1"]));
        updates.insert("equations".into(), serde_json::json!(2));

        artifact.apply_updates(&updates, "extract").unwrap();
        assert_eq!(artifact.metadata.get("equations"), Some(&serde_json::json!(2)));
    }

    #[test]
    fn apply_updates_rejects_conflicting_values() {
        let mut artifact =
            Artifact::from_bytes("a", "x").with_metadata("claims", serde_json::json!(1));
        let mut updates = Metadata::new();
        updates.insert("claims".into(), serde_json::json!(2));

        let err = artifact.apply_updates(&updates, "extract").unwrap_err();
        match err {
            VerdictError::MetadataConflict { key, stage } => {
                assert_eq!(key, "claims");
                assert_eq!(stage, "extract");
            }
            other => panic!("expected MetadataConflict, got: {other:?}"),
        }
        // Nothing is partially applied
        assert_eq!(artifact.metadata.get("claims"), Some(&serde_json::json!(1)));
    }

    // --- ScoreResult / StageOutcome ---

    #[test]
    fn errored_result_scores_zero_and_fails() {
        let r = ScoreResult::errored("fft", "no data");
        assert_eq!(r.score, 0.0);
        assert!(!r.passed);
        assert!(r.is_error());
        assert_eq!(r.error.as_deref(), Some("no data"));
    }

    #[test]
    fn lowest_scoring_prefers_first_on_tie() {
        let o = outcome(
            "s",
            vec![
                ScoreResult::pass("a", 0.9, ""),
                ScoreResult::fail("b", 0.2, ""),
                ScoreResult::fail("c", 0.2, ""),
            ],
            0.5,
            false,
        );
        assert_eq!(o.lowest_scoring().unwrap().criterion_name, "b");
    }

    #[test]
    fn final_status_buckets() {
        assert_eq!(FinalStatus::Error.bucket(), Bucket::Rejected);
        assert_eq!(FinalStatus::Rejected.bucket(), Bucket::Rejected);
        assert_eq!(FinalStatus::NeedsRevision.bucket().dir_name(), "needs-revision");
        assert_eq!(
            serde_json::to_string(&FinalStatus::NeedsRevision).unwrap(),
            "\"needs_revision\""
        );
    }

    // --- PipelineRun ---

    #[test]
    fn decision_digest_ignores_ids_and_timestamps() {
        let a = sample_run();
        let mut b = a.clone();
        b.run_id = "run-2".into();
        b.started_at = a.started_at + chrono::Duration::seconds(30);
        b.outcomes[0].timestamp = a.outcomes[0].timestamp + chrono::Duration::seconds(5);

        assert_eq!(a.decision_digest().unwrap(), b.decision_digest().unwrap());
    }

    #[test]
    fn decision_digest_tracks_decisions() {
        let a = sample_run();
        let mut b = a.clone();
        b.final_status = FinalStatus::NeedsRevision;
        assert_ne!(a.decision_digest().unwrap(), b.decision_digest().unwrap());
    }

    #[test]
    fn run_serialization_preserves_detail() {
        let run = sample_run();
        let json = serde_json::to_string(&run).unwrap();
        let restored: PipelineRun = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, run);
        assert!(run.summary().contains("approved"));
    }
}
