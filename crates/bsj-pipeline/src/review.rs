//! Review gates and the channels that deliver decisions to them.
//!
//! A gate never blocks by itself. [`ReviewGate::enter`] writes a pending
//! marker into session state and the orchestrator suspends the run; whoever
//! holds the run later calls [`ReviewGate::resolve`] with a decision. The
//! [`ReviewChannel`] implementations are just different ways of obtaining that
//! decision while a process waits.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

use crate::stage::{StageDescriptor, StageKind};
use bsj_types::{BsjError, MergePolicy, Result, ReviewDecision, SessionState};

/// What a reviewer is asked to judge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub gate: String,
    /// Stage that produced the artifact.
    pub reviews: String,
    pub artifact_key: String,
    pub artifact: Value,
    /// 1 on first entry, incremented after every rejection.
    pub round: usize,
}

impl ReviewRequest {
    /// The artifact as display text: strings verbatim, anything else as
    /// pretty JSON.
    pub fn artifact_text(&self) -> String {
        match &self.artifact {
            Value::String(s) => s.clone(),
            Value::Null => "(no artifact)".to_string(),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    Pending,
    Approved,
    Rejected,
}

// ---------------------------------------------------------------------------
// ReviewGate
// ---------------------------------------------------------------------------

/// Protocol for one gate stage. Borrowed from its descriptor; holds no state
/// of its own, everything lives in the session state.
#[derive(Debug, Clone, Copy)]
pub struct ReviewGate<'a> {
    name: &'a str,
    reviews: &'a str,
    artifact_key: &'a str,
    review_key: &'a str,
}

impl<'a> ReviewGate<'a> {
    pub fn for_stage(stage: &'a StageDescriptor) -> Result<Self> {
        match (&stage.kind, stage.outputs.first()) {
            (
                StageKind::ReviewGate {
                    reviews,
                    artifact_key,
                },
                Some(review_key),
            ) => Ok(Self {
                name: &stage.name,
                reviews,
                artifact_key,
                review_key,
            }),
            _ => Err(BsjError::ConfigurationError(format!(
                "stage '{}' is not a review gate",
                stage.name
            ))),
        }
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn reviews(&self) -> &str {
        self.reviews
    }

    /// State key of the pending marker, e.g. `research_review_pending`.
    pub fn marker_key(&self) -> String {
        format!("{}_pending", self.review_key)
    }

    /// Freeze the artifact, write the pending marker and build the request.
    pub fn enter(&self, state: &mut SessionState, round: usize) -> Result<ReviewRequest> {
        let view = state.view(&[self.artifact_key.to_string()]);
        let artifact = view.get(self.artifact_key).cloned().unwrap_or(Value::Null);
        let marker = json!({
            "status": "pending",
            "gate": self.name,
            "reviews": self.reviews,
            "artifact_key": self.artifact_key,
            "artifact": artifact,
            "has_artifact": !artifact.is_null(),
            "round": round,
            "created_at": chrono::Utc::now().to_rfc3339(),
        });
        state.merge(
            self.name,
            BTreeMap::from([(self.marker_key(), marker)]),
            MergePolicy::Replace,
        )?;
        tracing::info!(gate = %self.name, artifact = %self.artifact_key, round, "Awaiting review");
        Ok(self.request(state, round))
    }

    /// Rebuild the request for a gate that is already pending.
    pub fn request(&self, state: &SessionState, round: usize) -> ReviewRequest {
        ReviewRequest {
            gate: self.name.to_string(),
            reviews: self.reviews.to_string(),
            artifact_key: self.artifact_key.to_string(),
            artifact: state.get(self.artifact_key).cloned().unwrap_or(Value::Null),
            round,
        }
    }

    pub fn status(&self, state: &SessionState) -> Option<GateState> {
        if state.contains(&self.marker_key()) {
            return Some(GateState::Pending);
        }
        state
            .get(self.review_key)
            .and_then(|r| r.get("approved"))
            .and_then(Value::as_bool)
            .map(|approved| if approved { GateState::Approved } else { GateState::Rejected })
    }

    /// Consume `decision`. The marker is removed either way; an approval is
    /// recorded under the gate's review key, a rejection leaves the state as
    /// it was before the gate was entered.
    pub fn resolve(
        &self,
        state: &mut SessionState,
        decision: &ReviewDecision,
        round: usize,
    ) -> Result<GateState> {
        if self.status(state) != Some(GateState::Pending) {
            return Err(BsjError::InvariantViolation(format!(
                "gate '{}' has no pending review",
                self.name
            )));
        }
        state.remove(&self.marker_key())?;
        tracing::info!(gate = %self.name, approved = decision.approved, round, "Review resolved");

        if !decision.approved {
            return Ok(GateState::Rejected);
        }
        let record = json!({
            "status": "approved",
            "approved": true,
            "notes": decision.notes,
            "round": round,
            "decided_at": chrono::Utc::now().to_rfc3339(),
        });
        state.merge(
            self.name,
            BTreeMap::from([(self.review_key.to_string(), record)]),
            MergePolicy::Replace,
        )?;
        Ok(GateState::Approved)
    }
}

// ---------------------------------------------------------------------------
// ReviewChannel
// ---------------------------------------------------------------------------

/// A source of review decisions.
#[async_trait]
pub trait ReviewChannel: Send + Sync {
    async fn decide(&self, request: &ReviewRequest) -> Result<ReviewDecision>;
}

/// Approves everything without notes.
pub struct AutoApprove;

#[async_trait]
impl ReviewChannel for AutoApprove {
    async fn decide(&self, request: &ReviewRequest) -> Result<ReviewDecision> {
        tracing::debug!(gate = %request.gate, "Auto-approving");
        Ok(ReviewDecision::approve())
    }
}

// ---------------------------------------------------------------------------
// ConsoleReviewer
// ---------------------------------------------------------------------------

/// Prints the artifact and reads `y`/`n` plus notes from stdin.
pub struct ConsoleReviewer;

fn read_line() -> std::io::Result<String> {
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

#[async_trait]
impl ReviewChannel for ConsoleReviewer {
    async fn decide(&self, request: &ReviewRequest) -> Result<ReviewDecision> {
        println!(
            "\n=== Review: {} (round {}) ===\n\n{}\n",
            request.gate,
            request.round,
            request.artifact_text()
        );
        println!("Approve? [y/N]");
        let answer = tokio::task::spawn_blocking(read_line)
            .await
            .map_err(|e| BsjError::Other(format!("stdin reader failed: {e}")))??;
        println!("Notes (optional):");
        let notes = tokio::task::spawn_blocking(read_line)
            .await
            .map_err(|e| BsjError::Other(format!("stdin reader failed: {e}")))??;

        let approved = matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes");
        Ok(ReviewDecision { approved, notes })
    }
}

// ---------------------------------------------------------------------------
// ScriptedReviewer
// ---------------------------------------------------------------------------

/// Replays pre-seeded decisions in order and records every request. Approves
/// once the script runs out.
pub struct ScriptedReviewer {
    decisions: std::sync::Mutex<Vec<ReviewDecision>>,
    requests: std::sync::Mutex<Vec<ReviewRequest>>,
}

impl ScriptedReviewer {
    pub fn new(decisions: Vec<ReviewDecision>) -> Self {
        let mut reversed = decisions;
        reversed.reverse();
        Self {
            decisions: std::sync::Mutex::new(reversed),
            requests: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ReviewRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl ReviewChannel for ScriptedReviewer {
    async fn decide(&self, request: &ReviewRequest) -> Result<ReviewDecision> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        let decision = self
            .decisions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .unwrap_or_else(ReviewDecision::approve);
        Ok(decision)
    }
}

// ---------------------------------------------------------------------------
// ChannelReviewer
// ---------------------------------------------------------------------------

/// Forwards requests to a [`ReviewHandle`] held elsewhere (a UI task, an API
/// handler) and waits for its answer.
pub struct ChannelReviewer {
    requests: mpsc::UnboundedSender<ReviewRequest>,
    decisions: Mutex<mpsc::Receiver<ReviewDecision>>,
}

/// The external end of a [`ChannelReviewer`].
pub struct ReviewHandle {
    requests: mpsc::UnboundedReceiver<ReviewRequest>,
    decisions: mpsc::Sender<ReviewDecision>,
}

impl ChannelReviewer {
    pub fn new() -> (Self, ReviewHandle) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (decision_tx, decision_rx) = mpsc::channel(1);
        (
            Self {
                requests: request_tx,
                decisions: Mutex::new(decision_rx),
            },
            ReviewHandle {
                requests: request_rx,
                decisions: decision_tx,
            },
        )
    }
}

#[async_trait]
impl ReviewChannel for ChannelReviewer {
    async fn decide(&self, request: &ReviewRequest) -> Result<ReviewDecision> {
        // A dropped handle surfaces below as a closed decision channel.
        let _ = self.requests.send(request.clone());
        self.decisions
            .lock()
            .await
            .recv()
            .await
            .ok_or(BsjError::Cancelled)
    }
}

impl ReviewHandle {
    /// Next gate waiting for a decision. `None` once the reviewer is gone.
    pub async fn next_request(&mut self) -> Option<ReviewRequest> {
        self.requests.recv().await
    }

    pub async fn submit(&self, decision: ReviewDecision) -> Result<()> {
        self.decisions
            .send(decision)
            .await
            .map_err(|_| BsjError::Other("review channel closed".into()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn gate_stage() -> StageDescriptor {
        StageDescriptor::review_gate(
            "research_review",
            "researcher",
            "research_markdown",
            "research_review",
        )
    }

    fn state_with_artifact() -> SessionState {
        let mut state = SessionState::new();
        state.seed("topic", json!("AI in African fintech"));
        state
            .merge(
                "researcher",
                BTreeMap::from([("research_markdown".to_string(), json!("# Research Findings"))]),
                MergePolicy::Replace,
            )
            .unwrap();
        state
    }

    #[test]
    fn enter_writes_marker_and_freezes_artifact() {
        let stage = gate_stage();
        let gate = ReviewGate::for_stage(&stage).unwrap();
        let mut state = state_with_artifact();

        let request = gate.enter(&mut state, 1).unwrap();
        assert_eq!(request.artifact, json!("# Research Findings"));
        assert_eq!(gate.marker_key(), "research_review_pending");

        let marker = state.get("research_review_pending").unwrap();
        assert_eq!(marker["status"], "pending");
        assert_eq!(marker["artifact"], "# Research Findings");
        assert_eq!(marker["has_artifact"], true);
        assert!(state.is_frozen("research_markdown"));
        assert_eq!(gate.status(&state), Some(GateState::Pending));
    }

    #[test]
    fn approval_records_decision_and_clears_marker() {
        let stage = gate_stage();
        let gate = ReviewGate::for_stage(&stage).unwrap();
        let mut state = state_with_artifact();
        gate.enter(&mut state, 1).unwrap();

        let outcome = gate
            .resolve(&mut state, &ReviewDecision::approve_with_notes("ship it"), 1)
            .unwrap();
        assert_eq!(outcome, GateState::Approved);
        assert!(!state.contains("research_review_pending"));
        assert_eq!(state.get("research_review").unwrap()["notes"], "ship it");
        assert_eq!(gate.status(&state), Some(GateState::Approved));
    }

    #[test]
    fn rejection_restores_pre_gate_values() {
        let stage = gate_stage();
        let gate = ReviewGate::for_stage(&stage).unwrap();
        let mut state = state_with_artifact();
        let before = state.values().clone();
        gate.enter(&mut state, 1).unwrap();

        let outcome = gate
            .resolve(&mut state, &ReviewDecision::reject("need more sources"), 1)
            .unwrap();
        assert_eq!(outcome, GateState::Rejected);
        assert_eq!(state.values(), &before);
    }

    #[test]
    fn decision_is_consumed_once() {
        let stage = gate_stage();
        let gate = ReviewGate::for_stage(&stage).unwrap();
        let mut state = state_with_artifact();
        gate.enter(&mut state, 1).unwrap();
        gate.resolve(&mut state, &ReviewDecision::approve(), 1).unwrap();

        let err = gate
            .resolve(&mut state, &ReviewDecision::approve(), 1)
            .unwrap_err();
        assert!(matches!(err, BsjError::InvariantViolation(_)));
    }

    #[test]
    fn agent_stage_is_not_a_gate() {
        let stage = StageDescriptor::agent("researcher", "x").writes(["research"]);
        assert!(ReviewGate::for_stage(&stage).is_err());
    }

    #[tokio::test]
    async fn scripted_reviewer_replays_then_approves() {
        let reviewer = ScriptedReviewer::new(vec![ReviewDecision::reject("too short")]);
        let request = ReviewRequest {
            gate: "script_review".into(),
            reviews: "scriptwriter".into(),
            artifact_key: "script_markdown".into(),
            artifact: json!("# Script"),
            round: 1,
        };
        assert!(!reviewer.decide(&request).await.unwrap().approved);
        assert!(reviewer.decide(&request).await.unwrap().approved);
        assert_eq!(reviewer.requests().len(), 2);
    }

    #[tokio::test]
    async fn channel_reviewer_round_trip() {
        let (reviewer, mut handle) = ChannelReviewer::new();
        let request = ReviewRequest {
            gate: "research_review".into(),
            reviews: "researcher".into(),
            artifact_key: "research_markdown".into(),
            artifact: Value::Null,
            round: 2,
        };

        let responder = tokio::spawn(async move {
            let seen = handle.next_request().await.unwrap();
            handle
                .submit(ReviewDecision::reject(format!("round {} no good", seen.round)))
                .await
                .unwrap();
            handle
        });
        let decision = reviewer.decide(&request).await.unwrap();
        assert_eq!(decision.notes, "round 2 no good");

        drop(responder.await.unwrap());
        let err = reviewer.decide(&request).await.unwrap_err();
        assert!(matches!(err, BsjError::Cancelled));
    }
}
