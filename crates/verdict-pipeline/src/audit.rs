//! Append-only audit trail of pipeline runs, keyed by artifact id.
//!
//! A stored run is never rewritten. Re-submitting an artifact appends a new
//! run (new `run_id`, new timestamps) next to the earlier ones.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use verdict_types::{ArtifactId, PipelineRun, Result, VerdictError};

#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Persist a finished run. Appending a `run_id` that is already stored
    /// for the artifact is an error; history is never overwritten.
    async fn append(&self, run: &PipelineRun) -> Result<()>;

    /// Every run for the artifact, oldest first. Empty when none exist.
    async fn history(&self, artifact_id: &ArtifactId) -> Result<Vec<PipelineRun>>;

    /// The most recent run for the artifact.
    async fn get(&self, artifact_id: &ArtifactId) -> Result<PipelineRun> {
        self.history(artifact_id)
            .await?
            .pop()
            .ok_or_else(|| VerdictError::NotFound(format!("no audit record for artifact '{artifact_id}'")))
    }
}

fn duplicate_run(run: &PipelineRun) -> VerdictError {
    VerdictError::Audit(format!(
        "run '{}' for artifact '{}' is already recorded",
        run.run_id, run.artifact_id
    ))
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Process-local store, mainly for tests and dry runs.
#[derive(Default)]
pub struct MemoryAuditStore {
    runs: tokio::sync::RwLock<HashMap<ArtifactId, Vec<PipelineRun>>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, run: &PipelineRun) -> Result<()> {
        let mut runs = self.runs.write().await;
        let entry = runs.entry(run.artifact_id.clone()).or_default();
        if entry.iter().any(|r| r.run_id == run.run_id) {
            return Err(duplicate_run(run));
        }
        entry.push(run.clone());
        Ok(())
    }

    async fn history(&self, artifact_id: &ArtifactId) -> Result<Vec<PipelineRun>> {
        Ok(self.runs.read().await.get(artifact_id).cloned().unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Filesystem store
// ---------------------------------------------------------------------------

/// One JSON Lines file per artifact: `<root>/<artifact_id>.jsonl`.
///
/// Appends to the same artifact are serialised by a per-artifact lock;
/// different artifacts append concurrently.
pub struct FsAuditStore {
    root: PathBuf,
    locks: Mutex<HashMap<ArtifactId, Arc<tokio::sync::Mutex<()>>>>,
}

impl FsAuditStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, artifact_id: &ArtifactId) -> PathBuf {
        self.root.join(format!("{artifact_id}.jsonl"))
    }

    fn lock_for(&self, artifact_id: &ArtifactId) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| VerdictError::Audit("audit lock table poisoned".into()))?;
        Ok(Arc::clone(locks.entry(artifact_id.clone()).or_default()))
    }

    /// Give back a lock from [`Self::lock_for`], dropping its table entry
    /// once no other caller holds it.
    fn release(&self, artifact_id: &ArtifactId, lock: Arc<tokio::sync::Mutex<()>>) {
        drop(lock);
        if let Ok(mut locks) = self.locks.lock() {
            if locks.get(artifact_id).is_some_and(|l| Arc::strong_count(l) == 1) {
                locks.remove(artifact_id);
            }
        }
    }

    async fn append_locked(&self, run: &PipelineRun) -> Result<()> {
        let path = self.path_for(&run.artifact_id);
        if Self::read_runs(&path).await?.iter().any(|r| r.run_id == run.run_id) {
            return Err(duplicate_run(run));
        }

        let mut line = serde_json::to_string(run)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn read_runs(path: &Path) -> Result<Vec<PipelineRun>> {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        text.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line).map_err(|e| {
                    VerdictError::Audit(format!("{}: corrupt record on line {}: {e}", path.display(), n + 1))
                })
            })
            .collect()
    }

    /// Artifact ids with at least one stored run, sorted.
    pub async fn artifacts(&self) -> Result<Vec<ArtifactId>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if let Ok(id) = ArtifactId::new(stem) {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl AuditStore for FsAuditStore {
    async fn append(&self, run: &PipelineRun) -> Result<()> {
        let lock = self.lock_for(&run.artifact_id)?;
        let result = {
            let _guard = lock.lock().await;
            self.append_locked(run).await
        };
        self.release(&run.artifact_id, lock);
        result?;

        tracing::debug!(
            artifact = %run.artifact_id.short(),
            run_id = %run.run_id,
            status = %run.final_status,
            "Audit record appended"
        );
        Ok(())
    }

    async fn history(&self, artifact_id: &ArtifactId) -> Result<Vec<PipelineRun>> {
        let lock = self.lock_for(artifact_id)?;
        let result = {
            let _guard = lock.lock().await;
            Self::read_runs(&self.path_for(artifact_id)).await
        };
        self.release(artifact_id, lock);
        result
    }
}
