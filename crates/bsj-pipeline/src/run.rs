//! The persistent record of one pipeline run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::CapabilityPlan;
use crate::review::ReviewRequest;
use bsj_types::{AttemptMetadata, RunStatus, SessionState};

/// State key the run topic is seeded under.
pub const TOPIC_KEY: &str = "topic";

/// Where a run currently stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum RunPhase {
    Running,
    AwaitingReview { gate: String },
    Finished { status: RunStatus },
}

/// One topic's trip through the topology. Serializable so a run suspended at
/// a review gate can be resumed by another process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: String,
    pub topology: String,
    pub topic: String,
    /// Index of the step to execute next (or the gate being waited on).
    pub cursor: usize,
    pub phase: RunPhase,
    pub state: SessionState,
    /// Every agent invocation made so far, in order.
    #[serde(default)]
    pub attempts: Vec<AttemptMetadata>,
    /// Gate name -> number of rejections received.
    #[serde(default)]
    pub rejections: BTreeMap<String, usize>,
    /// Stage name -> reviewer notes carried into its next execution.
    #[serde(default)]
    pub guidance: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub degraded_tools: Vec<String>,
    /// Tool attachment decided when the run started.
    #[serde(default)]
    pub capabilities: Option<CapabilityPlan>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new(topology: impl Into<String>, topic: impl Into<String>) -> Self {
        let topic = topic.into();
        let mut state = SessionState::new();
        state.seed(TOPIC_KEY, Value::String(topic.clone()));
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            topology: topology.into(),
            topic,
            cursor: 0,
            phase: RunPhase::Running,
            state,
            attempts: Vec::new(),
            rejections: BTreeMap::new(),
            guidance: BTreeMap::new(),
            degraded_tools: Vec::new(),
            capabilities: None,
            reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> Option<RunStatus> {
        match self.phase {
            RunPhase::Finished { status } => Some(status),
            _ => None,
        }
    }

    pub fn pending_gate(&self) -> Option<&str> {
        match &self.phase {
            RunPhase::AwaitingReview { gate } => Some(gate),
            _ => None,
        }
    }

    /// Attempts recorded for `stage`, oldest first.
    pub fn attempts_for<'a>(&'a self, stage: &'a str) -> impl Iterator<Item = &'a AttemptMetadata> {
        self.attempts.iter().filter(move |a| a.stage == stage)
    }

    pub fn elapsed_ms(&self) -> u64 {
        (Utc::now() - self.created_at).num_milliseconds().max(0) as u64
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Snapshot handed back to callers. Only finished runs carry a status.
    pub fn report(&self) -> RunReport {
        RunReport {
            run_id: self.id.clone(),
            topic: self.topic.clone(),
            status: self.status(),
            reason: self.reason.clone(),
            state: self.state.clone(),
            attempts: self.attempts.clone(),
            degraded_tools: self.degraded_tools.clone(),
        }
    }
}

/// Outcome of a run as seen by a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub topic: String,
    pub status: Option<RunStatus>,
    pub reason: Option<String>,
    pub state: SessionState,
    pub attempts: Vec<AttemptMetadata>,
    pub degraded_tools: Vec<String>,
}

/// What [`advance`](crate::Orchestrator::advance) stopped on.
#[derive(Debug, Clone)]
pub enum RunStep {
    Suspended(ReviewRequest),
    Finished(RunReport),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_run_is_seeded() {
        let run = PipelineRun::new("bsj", "AI in African fintech");
        assert_eq!(run.state.get_str("topic"), Some("AI in African fintech"));
        assert_eq!(run.phase, RunPhase::Running);
        assert!(run.status().is_none());
        assert!(run.pending_gate().is_none());
    }

    #[test]
    fn phase_serializes_with_tag() {
        let phase = RunPhase::AwaitingReview {
            gate: "script_review".into(),
        };
        let json = serde_json::to_value(&phase).unwrap();
        assert_eq!(json["phase"], "awaiting_review");
        assert_eq!(json["gate"], "script_review");

        let finished = RunPhase::Finished {
            status: RunStatus::ProviderError,
        };
        let json = serde_json::to_value(&finished).unwrap();
        assert_eq!(json["status"], "provider_error");
    }

    #[test]
    fn report_carries_status_only_when_finished() {
        let mut run = PipelineRun::new("bsj", "topic");
        assert!(run.report().status.is_none());
        run.phase = RunPhase::Finished {
            status: RunStatus::Completed,
        };
        assert_eq!(run.report().status, Some(RunStatus::Completed));
    }
}
