//! Built-in, content-agnostic criteria.
//!
//! Domain scorers are supplied by callers through [`Criterion`]; these cover
//! the generic checks most pipelines need and can be declared directly in
//! the pipeline configuration via [`CriterionDef`].

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use verdict_types::{Artifact, Result, ScoreResult, VerdictError};

use crate::criterion::{Criterion, EvalContext};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}
fn default_min_fraction() -> f64 {
    0.5
}
fn default_min_matches() -> usize {
    1
}

/// A built-in criterion declared in the pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CriterionDef {
    NonEmpty {
        name: String,
    },
    MinLength {
        name: String,
        min_chars: usize,
    },
    Pattern {
        name: String,
        pattern: String,
        #[serde(default = "default_true")]
        must_match: bool,
    },
    KeywordCoverage {
        name: String,
        keywords: Vec<String>,
        #[serde(default = "default_min_fraction")]
        min_fraction: f64,
    },
    MetadataPresent {
        name: String,
        key: String,
    },
    Extract {
        name: String,
        pattern: String,
        /// Metadata key receiving the list of matches.
        key: String,
        #[serde(default = "default_min_matches")]
        min_matches: usize,
    },
}

impl CriterionDef {
    pub fn name(&self) -> &str {
        match self {
            CriterionDef::NonEmpty { name }
            | CriterionDef::MinLength { name, .. }
            | CriterionDef::Pattern { name, .. }
            | CriterionDef::KeywordCoverage { name, .. }
            | CriterionDef::MetadataPresent { name, .. }
            | CriterionDef::Extract { name, .. } => name,
        }
    }

    /// Instantiate the criterion. Invalid regexes are configuration errors.
    pub fn build(&self) -> Result<Arc<dyn Criterion>> {
        let criterion: Arc<dyn Criterion> = match self {
            CriterionDef::NonEmpty { name } => Arc::new(NonEmpty::new(name)),
            CriterionDef::MinLength { name, min_chars } => Arc::new(MinLength {
                name: name.clone(),
                min_chars: *min_chars,
            }),
            CriterionDef::Pattern {
                name,
                pattern,
                must_match,
            } => Arc::new(PatternMatch {
                name: name.clone(),
                regex: compile(name, pattern)?,
                must_match: *must_match,
            }),
            CriterionDef::KeywordCoverage {
                name,
                keywords,
                min_fraction,
            } => Arc::new(KeywordCoverage {
                name: name.clone(),
                keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
                min_fraction: *min_fraction,
            }),
            CriterionDef::MetadataPresent { name, key } => Arc::new(MetadataPresent {
                name: name.clone(),
                key: key.clone(),
            }),
            CriterionDef::Extract {
                name,
                pattern,
                key,
                min_matches,
            } => Arc::new(Extract {
                name: name.clone(),
                regex: compile(name, pattern)?,
                key: key.clone(),
                min_matches: *min_matches,
            }),
        };
        Ok(criterion)
    }
}

fn compile(name: &str, pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| {
        VerdictError::Config(format!("criterion '{name}' has an invalid pattern: {e}"))
    })
}

// ---------------------------------------------------------------------------
// Criteria
// ---------------------------------------------------------------------------

/// Passes when the artifact has any non-whitespace content.
pub struct NonEmpty {
    name: String,
}

impl NonEmpty {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Criterion for NonEmpty {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, artifact: &Artifact, _ctx: &EvalContext) -> Result<ScoreResult> {
        if artifact.text().trim().is_empty() {
            Ok(ScoreResult::fail(&self.name, 0.0, "artifact is empty"))
        } else {
            Ok(ScoreResult::pass(&self.name, 1.0, "artifact has content"))
        }
    }
}

/// Scores length linearly up to `min_chars`.
pub struct MinLength {
    name: String,
    min_chars: usize,
}

#[async_trait]
impl Criterion for MinLength {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, artifact: &Artifact, _ctx: &EvalContext) -> Result<ScoreResult> {
        let chars = artifact.text().chars().count();
        let score = if self.min_chars == 0 {
            1.0
        } else {
            (chars as f64 / self.min_chars as f64).min(1.0)
        };
        Ok(ScoreResult::new(
            &self.name,
            score,
            chars >= self.min_chars,
            format!("{chars} characters (minimum {})", self.min_chars),
        ))
    }
}

pub struct PatternMatch {
    name: String,
    regex: Regex,
    must_match: bool,
}

#[async_trait]
impl Criterion for PatternMatch {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, artifact: &Artifact, _ctx: &EvalContext) -> Result<ScoreResult> {
        let found = self.regex.is_match(&artifact.text());
        let ok = found == self.must_match;
        let detail = match (found, self.must_match) {
            (true, true) => format!("found /{}/", self.regex),
            (false, true) => format!("missing /{}/", self.regex),
            (true, false) => format!("forbidden /{}/ present", self.regex),
            (false, false) => format!("no /{}/", self.regex),
        };
        Ok(ScoreResult::new(
            &self.name,
            if ok { 1.0 } else { 0.0 },
            ok,
            detail,
        ))
    }
}

/// Fraction of keywords present, case-insensitive.
pub struct KeywordCoverage {
    name: String,
    keywords: Vec<String>,
    min_fraction: f64,
}

#[async_trait]
impl Criterion for KeywordCoverage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, artifact: &Artifact, _ctx: &EvalContext) -> Result<ScoreResult> {
        if self.keywords.is_empty() {
            return Ok(ScoreResult::pass(&self.name, 1.0, "no keywords configured"));
        }
        let text = artifact.text().to_lowercase();
        let missing: Vec<&str> = self
            .keywords
            .iter()
            .filter(|k| !text.contains(k.as_str()))
            .map(String::as_str)
            .collect();
        let fraction = 1.0 - missing.len() as f64 / self.keywords.len() as f64;
        let detail = if missing.is_empty() {
            "all keywords present".to_string()
        } else {
            format!("missing: {}", missing.join(", "))
        };
        Ok(ScoreResult::new(
            &self.name,
            fraction,
            fraction >= self.min_fraction,
            detail,
        ))
    }
}

/// Passes when an earlier stage recorded a non-null `key`.
pub struct MetadataPresent {
    name: String,
    key: String,
}

#[async_trait]
impl Criterion for MetadataPresent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, artifact: &Artifact, _ctx: &EvalContext) -> Result<ScoreResult> {
        match artifact.metadata.get(&self.key) {
            Some(v) if !v.is_null() => Ok(ScoreResult::pass(
                &self.name,
                1.0,
                format!("metadata '{}' present", self.key),
            )),
            _ => Ok(ScoreResult::fail(
                &self.name,
                0.0,
                format!("metadata '{}' missing", self.key),
            )),
        }
    }
}

/// Collects regex matches (first capture group if present) into metadata.
pub struct Extract {
    name: String,
    regex: Regex,
    key: String,
    min_matches: usize,
}

#[async_trait]
impl Criterion for Extract {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, artifact: &Artifact, _ctx: &EvalContext) -> Result<ScoreResult> {
        let text = artifact.text();
        let matches: Vec<String> = self
            .regex
            .captures_iter(&text)
            .filter_map(|caps| caps.get(1).or_else(|| caps.get(0)))
            .map(|m| m.as_str().trim().to_string())
            .collect();
        let count = matches.len();
        let score = if self.min_matches == 0 {
            1.0
        } else {
            (count as f64 / self.min_matches as f64).min(1.0)
        };
        Ok(ScoreResult::new(
            &self.name,
            score,
            count >= self.min_matches,
            format!("extracted {count} match(es) into '{}'", self.key),
        )
        .with_update(self.key.clone(), serde_json::json!(matches)))
    }
}
