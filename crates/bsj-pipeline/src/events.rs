//! Pipeline event system for observability.
//!
//! Emits [`PipelineEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! observers (the CLI progress printer, tests, a future UI) can follow a run
//! without coupling to the orchestrator internals.

use serde::{Deserialize, Serialize};

use bsj_types::RunStatus;

/// Events emitted while a run advances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    RunStarted {
        run_id: String,
        topic: String,
        stage_count: usize,
    },
    StageStarted {
        stage: String,
        attempt: usize,
    },
    StageCompleted {
        stage: String,
        attempt: usize,
        duration_ms: u64,
    },
    StageRetrying {
        stage: String,
        attempt: usize,
        diagnostic: String,
    },
    ToolFallback {
        stage: String,
        tool: String,
    },
    CapabilityDegraded {
        tool: String,
        reason: String,
    },
    ReviewPending {
        gate: String,
        artifact_key: String,
        round: usize,
    },
    ReviewResolved {
        gate: String,
        approved: bool,
    },
    StateMerged {
        stage: String,
        keys: Vec<String>,
    },
    CheckpointSaved {
        run_id: String,
    },
    RunFinished {
        run_id: String,
        status: RunStatus,
        duration_ms: u64,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers. Dropped silently when
    /// nobody listens.
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
