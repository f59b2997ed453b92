//! Concurrent processing of many artifacts.
//!
//! Each artifact's traversal is sequential; different artifacts run in
//! parallel up to `max_concurrent`. Every finished run is appended to the
//! audit store before disposition is attempted, and a failed disposition
//! never affects the stored record.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use verdict_types::{Artifact, ArtifactId, FinalStatus, Metadata, PipelineRun, VerdictError};

use crate::audit::AuditStore;
use crate::disposer::{DispositionResult, FsDisposer};
use crate::engine::PipelineEngine;

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum number of artifacts in flight.
    pub max_concurrent: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { max_concurrent: 4 }
    }
}

/// What happened to one artifact.
#[derive(Debug)]
pub struct BatchItem {
    pub run: PipelineRun,
    /// `Err` holds the message of a failed audit append.
    pub audit: Result<(), String>,
    /// `None` when no disposer is configured or the audit append failed.
    pub disposition: Option<Result<DispositionResult, String>>,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    /// One item per input artifact, in input order.
    pub items: Vec<BatchItem>,
}

impl BatchReport {
    pub fn count(&self, status: FinalStatus) -> usize {
        self.items.iter().filter(|i| i.run.final_status == status).count()
    }

    /// Items whose audit append or disposition failed.
    pub fn failures(&self) -> impl Iterator<Item = &BatchItem> {
        self.items.iter().filter(|i| {
            i.audit.is_err() || matches!(i.disposition, Some(Err(_)))
        })
    }
}

pub struct BatchRunner {
    engine: PipelineEngine,
    audit: Arc<dyn AuditStore>,
    disposer: Option<Arc<FsDisposer>>,
    config: BatchConfig,
}

impl BatchRunner {
    pub fn new(engine: PipelineEngine, audit: Arc<dyn AuditStore>) -> Self {
        Self {
            engine,
            audit,
            disposer: None,
            config: BatchConfig::default(),
        }
    }

    pub fn with_disposer(mut self, disposer: FsDisposer) -> Self {
        self.disposer = Some(Arc::new(disposer));
        self
    }

    pub fn with_config(mut self, config: BatchConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn run(&self, artifacts: Vec<Artifact>) -> BatchReport {
        let sem = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut tasks = Vec::with_capacity(artifacts.len());

        for artifact in artifacts {
            let origin = (artifact.id.clone(), artifact.name.clone());
            let sem = Arc::clone(&sem);
            let engine = self.engine.clone();
            let audit = Arc::clone(&self.audit);
            let disposer = self.disposer.clone();

            let task = tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                process(engine, audit, disposer, artifact).await
            });
            tasks.push((origin, task));
        }

        let mut items = Vec::with_capacity(tasks.len());
        for ((artifact_id, artifact_name), task) in tasks {
            let item = match task.await {
                Ok(item) => item,
                Err(e) => {
                    tracing::error!(
                        artifact = %artifact_id.short(),
                        error = %e,
                        "Batch task failed"
                    );
                    aborted(artifact_id, artifact_name, &self.engine.spec().name, e)
                }
            };
            items.push(item);
        }
        BatchReport { items }
    }
}

/// An ERROR item for an artifact whose task died before reporting. Nothing
/// was recorded or disposed for it.
fn aborted(
    artifact_id: ArtifactId,
    artifact_name: String,
    pipeline: &str,
    error: JoinError,
) -> BatchItem {
    let error = VerdictError::Other(format!("run task failed: {error}"));
    let now = Utc::now();
    let run = PipelineRun {
        run_id: uuid::Uuid::new_v4().to_string(),
        artifact_id,
        artifact_name,
        pipeline: pipeline.to_string(),
        outcomes: Vec::new(),
        reproducibility: Vec::new(),
        final_status: FinalStatus::Error,
        rejection_stage: None,
        rejection_reason: Some(error.to_string()),
        reason_code: Some(error.reason_code().to_string()),
        quality_score: 0.0,
        confidence_level: 0.0,
        final_metadata: Metadata::new(),
        started_at: now,
        finished_at: now,
    };
    BatchItem {
        run,
        audit: Err(format!("not recorded: {error}")),
        disposition: None,
    }
}

async fn process(
    engine: PipelineEngine,
    audit: Arc<dyn AuditStore>,
    disposer: Option<Arc<FsDisposer>>,
    artifact: Artifact,
) -> BatchItem {
    let run = engine.run(artifact.clone()).await;

    let audited = audit.append(&run).await.map_err(|e| {
        tracing::error!(run_id = %run.run_id, error = %e, "Audit append failed");
        e.to_string()
    });

    let disposition = match (&audited, disposer) {
        (Ok(()), Some(disposer)) => Some(disposer.dispose(&run, &artifact).await.map_err(|e| {
            tracing::warn!(run_id = %run.run_id, error = %e, "Disposition failed");
            e.to_string()
        })),
        _ => None,
    };

    BatchItem {
        run,
        audit: audited,
        disposition,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditStore;
    use crate::disposer::{DispositionAction, DispositionMode};
    use crate::spec::{PipelineSpec, StageSpec};
    use async_trait::async_trait;
    use verdict_types::Result;

    fn engine() -> PipelineEngine {
        let spec = PipelineSpec::new(
            "batch",
            vec![StageSpec::new("intake", 0.5).criterion("non_empty", 1.0)],
        );
        PipelineEngine::from_spec(spec).unwrap()
    }

    fn artifacts() -> Vec<Artifact> {
        vec![
            Artifact::from_bytes("a.md", "alpha"),
            Artifact::from_bytes("empty.md", "   "),
            Artifact::from_bytes("b.md", "beta"),
        ]
    }

    #[tokio::test]
    async fn runs_audits_and_disposes_in_input_order() {
        let out = tempfile::tempdir().unwrap();
        let audit = Arc::new(MemoryAuditStore::new());
        let runner = BatchRunner::new(engine(), audit.clone())
            .with_disposer(FsDisposer::new(out.path(), DispositionMode::Copy))
            .with_config(BatchConfig { max_concurrent: 2 });

        let report = runner.run(artifacts()).await;
        let names: Vec<_> = report.items.iter().map(|i| i.run.artifact_name.as_str()).collect();
        assert_eq!(names, vec!["a.md", "empty.md", "b.md"]);
        assert_eq!(report.count(FinalStatus::Approved), 2);
        assert_eq!(report.count(FinalStatus::Rejected), 1);
        assert_eq!(report.failures().count(), 0);

        for item in &report.items {
            assert_eq!(audit.history(&item.run.artifact_id).await.unwrap().len(), 1);
            let disposed = item.disposition.as_ref().unwrap().as_ref().unwrap();
            assert_eq!(disposed.action, DispositionAction::Relocated);
        }
        assert!(out.path().join("rejected").exists());
    }

    struct BrokenAudit;

    #[async_trait]
    impl AuditStore for BrokenAudit {
        async fn append(&self, _run: &PipelineRun) -> Result<()> {
            Err(VerdictError::Audit("disk full".into()))
        }
        async fn history(&self, _id: &verdict_types::ArtifactId) -> Result<Vec<PipelineRun>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn failed_audit_skips_disposition() {
        let out = tempfile::tempdir().unwrap();
        let runner = BatchRunner::new(engine(), Arc::new(BrokenAudit))
            .with_disposer(FsDisposer::new(out.path(), DispositionMode::Copy));

        let report = runner.run(vec![Artifact::from_bytes("a.md", "alpha")]).await;
        let item = &report.items[0];
        assert!(item.audit.as_ref().unwrap_err().contains("disk full"));
        assert!(item.disposition.is_none());
        assert!(!out.path().join("approved").exists());
        assert_eq!(report.failures().count(), 1);
    }

    #[tokio::test]
    async fn disposition_conflict_keeps_audit_record() {
        let out = tempfile::tempdir().unwrap();
        let audit = Arc::new(MemoryAuditStore::new());
        let artifact = Artifact::from_bytes("a.md", "alpha");

        // A stale disposition of the same artifact under another status.
        let mut stale = engine().run(artifact.clone()).await;
        stale.final_status = FinalStatus::Conditional;
        FsDisposer::new(out.path(), DispositionMode::Copy)
            .dispose(&stale, &artifact)
            .await
            .unwrap();

        let runner = BatchRunner::new(engine(), audit.clone())
            .with_disposer(FsDisposer::new(out.path(), DispositionMode::Copy));
        let report = runner.run(vec![artifact.clone()]).await;

        let item = &report.items[0];
        assert!(item.audit.is_ok());
        assert!(matches!(item.disposition, Some(Err(_))));
        assert_eq!(audit.history(&artifact.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dead_task_becomes_an_error_item() {
        let artifact = Artifact::from_bytes("a.md", "alpha");
        let join_error = tokio::spawn(async { panic!("worker blew up") })
            .await
            .unwrap_err();

        let item = aborted(artifact.id.clone(), artifact.name.clone(), "batch", join_error);
        assert_eq!(item.run.final_status, FinalStatus::Error);
        assert_eq!(item.run.artifact_id, artifact.id);
        assert_eq!(item.run.reason_code.as_deref(), Some("internal"));
        assert!(item.run.rejection_reason.as_deref().unwrap().contains("run task failed"));
        assert!(item.disposition.is_none());

        let report = BatchReport { items: vec![item] };
        assert_eq!(report.count(FinalStatus::Error), 1);
        assert_eq!(report.failures().count(), 1);
    }
}
