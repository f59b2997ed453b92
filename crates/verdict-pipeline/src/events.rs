//! Progress events for artifact runs.
//!
//! The engine publishes on a broadcast channel shared by every clone of a
//! [`PipelineEngine`](crate::PipelineEngine). Events carry the run id, so one
//! subscriber can follow a whole batch.

use serde::{Deserialize, Serialize};
use verdict_types::FinalStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    RunStarted {
        run_id: String,
        artifact_id: String,
        pipeline: String,
    },
    StageStarted {
        run_id: String,
        stage_id: String,
    },
    StageCompleted {
        run_id: String,
        stage_id: String,
        aggregate_score: f64,
        passed: bool,
    },
    /// A criterion errored, panicked or timed out. Not emitted for an
    /// ordinary failing score.
    CriterionFailed {
        run_id: String,
        stage_id: String,
        criterion: String,
        error: String,
    },
    /// `passed` is false when the trials disagree with each other or with
    /// the main run.
    ReproducibilityChecked {
        run_id: String,
        stage_id: String,
        success_rate: f64,
        agreement_level: f64,
        passed: bool,
    },
    RunFinished {
        run_id: String,
        artifact_id: String,
        status: FinalStatus,
        duration_ms: u64,
    },
}

#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// No subscribers is not an error; the event is dropped.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
