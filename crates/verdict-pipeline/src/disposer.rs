//! Filesystem disposition: relocate an artifact into the bucket matching its
//! final status, with its verdict report alongside.
//!
//! Layout: `<root>/<bucket>/<artifact_id>/{<artifact name>, verdict.json}`.
//! Disposition is idempotent. A second call for the same run status is a
//! no-op, and an artifact already disposed differently is a reported
//! conflict that leaves everything where it is.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use verdict_types::{Artifact, Bucket, FinalStatus, PipelineRun, Result, VerdictError};

pub const VERDICT_FILE: &str = "verdict.json";
const STAGING_DIR: &str = ".staging";

/// Whether the source file is kept after disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispositionMode {
    #[default]
    Copy,
    Move,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispositionAction {
    Relocated,
    /// The artifact was already at its destination with the same status.
    AlreadyPresent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispositionResult {
    pub artifact_id: String,
    pub bucket: Bucket,
    pub destination: PathBuf,
    pub action: DispositionAction,
}

pub struct FsDisposer {
    root: PathBuf,
    mode: DispositionMode,
}

impl FsDisposer {
    pub fn new(root: impl Into<PathBuf>, mode: DispositionMode) -> Self {
        Self {
            root: root.into(),
            mode,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mode(&self) -> DispositionMode {
        self.mode
    }

    fn destination(&self, bucket: Bucket, run: &PipelineRun) -> PathBuf {
        self.root
            .join(bucket.dir_name())
            .join(run.artifact_id.as_str())
    }

    /// Relocate `artifact` according to `run.final_status`.
    ///
    /// Reads the run, never modifies it.
    pub async fn dispose(
        &self,
        run: &PipelineRun,
        artifact: &Artifact,
    ) -> Result<DispositionResult> {
        if artifact.id != run.artifact_id {
            return Err(VerdictError::Other(format!(
                "run is for artifact '{}' but artifact '{}' was given",
                run.artifact_id, artifact.id
            )));
        }

        let bucket = run.bucket();
        let destination = self.destination(bucket, run);

        if let Some(result) = self.check_existing(run, bucket).await? {
            self.remove_source(artifact).await?;
            return Ok(result);
        }

        let staging = self.stage(run, artifact).await?;
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if let Err(e) = tokio::fs::rename(&staging, &destination).await {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            // Lost a race with a concurrent disposition of the same artifact.
            if let Some(result) = self.check_existing(run, bucket).await? {
                return Ok(result);
            }
            return Err(e.into());
        }

        self.remove_source(artifact).await?;
        tracing::info!(
            artifact = %run.artifact_id.short(),
            bucket = bucket.dir_name(),
            destination = %destination.display(),
            "Artifact disposed"
        );

        Ok(DispositionResult {
            artifact_id: run.artifact_id.to_string(),
            bucket,
            destination,
            action: DispositionAction::Relocated,
        })
    }

    /// Look for an earlier disposition in every bucket.
    async fn check_existing(
        &self,
        run: &PipelineRun,
        bucket: Bucket,
    ) -> Result<Option<DispositionResult>> {
        for candidate in Bucket::ALL {
            let dir = self.destination(candidate, run);
            if !tokio::fs::try_exists(&dir).await? {
                continue;
            }
            let existing = read_status(&dir).await?;
            if candidate == bucket && existing == run.final_status {
                tracing::debug!(
                    artifact = %run.artifact_id.short(),
                    bucket = bucket.dir_name(),
                    "Artifact already disposed"
                );
                return Ok(Some(DispositionResult {
                    artifact_id: run.artifact_id.to_string(),
                    bucket,
                    destination: dir,
                    action: DispositionAction::AlreadyPresent,
                }));
            }
            tracing::warn!(
                artifact = %run.artifact_id.short(),
                existing = %existing,
                requested = %run.final_status,
                "Disposition conflict"
            );
            return Err(VerdictError::DispositionConflict {
                artifact_id: run.artifact_id.to_string(),
                existing,
                requested: run.final_status,
            });
        }
        Ok(None)
    }

    /// Write content and verdict into a private staging directory.
    async fn stage(&self, run: &PipelineRun, artifact: &Artifact) -> Result<PathBuf> {
        let staging = self
            .root
            .join(STAGING_DIR)
            .join(format!("{}-{}", run.artifact_id, uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&staging).await?;

        let written = async {
            tokio::fs::write(staging.join(file_name(artifact)), artifact.content()).await?;
            let report = serde_json::to_vec_pretty(run)?;
            tokio::fs::write(staging.join(VERDICT_FILE), report).await?;
            Ok::<_, VerdictError>(())
        }
        .await;

        if let Err(e) = written {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(e);
        }
        Ok(staging)
    }

    async fn remove_source(&self, artifact: &Artifact) -> Result<()> {
        if self.mode != DispositionMode::Move {
            return Ok(());
        }
        let Some(source) = &artifact.source else {
            return Ok(());
        };
        match tokio::fs::remove_file(source).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Final component of the artifact name, so a name never escapes the
/// destination directory.
fn file_name(artifact: &Artifact) -> String {
    Path::new(&artifact.name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| n != VERDICT_FILE)
        .unwrap_or_else(|| "artifact".to_string())
}

async fn read_status(dir: &Path) -> Result<FinalStatus> {
    let bytes = tokio::fs::read(dir.join(VERDICT_FILE)).await?;
    let value: serde_json::Value = serde_json::from_slice(&bytes)?;
    let status = value.get("final_status").cloned().ok_or_else(|| {
        VerdictError::Other(format!("{} has no final_status", dir.join(VERDICT_FILE).display()))
    })?;
    Ok(serde_json::from_value(status)?)
}
