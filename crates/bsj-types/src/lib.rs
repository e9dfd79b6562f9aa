//! Shared types for the BSJ content pipeline.
//!
//! This crate provides the foundational types used across the other BSJ crates:
//! - `BsjError` — unified error taxonomy
//! - `SessionState` — the key-value store threaded through every stage
//! - `RunStatus` — terminal status of a pipeline run
//! - `ReviewDecision` / `AttemptMetadata` — records produced while a run advances

use serde::{Deserialize, Serialize};

mod state;

pub use state::{MergePolicy, SessionState, StateView};

/// Unified error type for all BSJ subsystems.
#[derive(Debug, thiserror::Error)]
pub enum BsjError {
    // === Provider / capability errors ===
    #[error("Provider {provider} unavailable{}: {message}", http_suffix(.status))]
    ProviderUnavailable {
        provider: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Tool '{tool}' unavailable: {message}")]
    ToolUnavailable { tool: String, message: String },

    #[error("Tool '{tool}' error: {message}")]
    ToolError { tool: String, message: String },

    // === Stage output errors ===
    #[error("Stage '{stage}' returned an empty response")]
    EmptyResponse { stage: String },

    #[error("Stage '{stage}' returned a malformed response: {diagnostic}")]
    MalformedResponse { stage: String, diagnostic: String },

    // === Review ===
    #[error("Gate '{gate}' rejected by reviewer: {notes}")]
    RejectedByReviewer { gate: String, notes: String },

    // === Pipeline errors ===
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Run cancelled")]
    Cancelled,

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl BsjError {
    /// Returns `true` if a fresh attempt of the same stage may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BsjError::EmptyResponse { .. } | BsjError::MalformedResponse { .. }
        )
    }

    /// Returns `true` if the error must end the run immediately.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BsjError::ProviderUnavailable { .. }
                | BsjError::ConfigurationError(_)
                | BsjError::InvariantViolation(_)
        )
    }
}

fn http_suffix(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" (HTTP {code})"),
        None => String::new(),
    }
}

/// A convenience alias for `Result<T, BsjError>`.
pub type Result<T> = std::result::Result<T, BsjError>;

// ---------------------------------------------------------------------------
// RunStatus — terminal status of a pipeline run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Rejected,
    ValidationFailed,
    ProviderError,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Rejected => "rejected",
            RunStatus::ValidationFailed => "validation_failed",
            RunStatus::ProviderError => "provider_error",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// Process exit code used by the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Completed => 0,
            RunStatus::Rejected => 2,
            RunStatus::ValidationFailed => 3,
            RunStatus::ProviderError => 4,
            RunStatus::Cancelled => 130,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ReviewDecision
// ---------------------------------------------------------------------------

/// A human (or proxy) verdict on a pending review gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub approved: bool,
    #[serde(default)]
    pub notes: String,
}

impl ReviewDecision {
    pub fn approve() -> Self {
        Self {
            approved: true,
            notes: String::new(),
        }
    }

    pub fn approve_with_notes(notes: impl Into<String>) -> Self {
        Self {
            approved: true,
            notes: notes.into(),
        }
    }

    pub fn reject(notes: impl Into<String>) -> Self {
        Self {
            approved: false,
            notes: notes.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// AttemptMetadata
// ---------------------------------------------------------------------------

/// How a single stage attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Passed,
    Malformed,
    Empty,
    ProviderError,
    Cancelled,
}

/// Record of one invocation of an agent stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptMetadata {
    pub stage: String,
    /// 1-based attempt number within the current stage execution.
    pub attempt: usize,
    pub model: String,
    /// `true` when an optional tool failed and the stage fell back to a
    /// model-only invocation.
    pub tool_fallback: bool,
    /// Optional capabilities that were unreachable at run start.
    #[serde(default)]
    pub degraded_tools: Vec<String>,
    #[serde(default)]
    pub tool_calls: usize,
    pub outcome: Option<AttemptOutcome>,
    pub diagnostic: Option<String>,
    pub duration_ms: u64,
    pub started_at: String,
}

impl AttemptMetadata {
    pub fn new(stage: impl Into<String>, attempt: usize, model: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            attempt,
            model: model.into(),
            tool_fallback: false,
            degraded_tools: Vec::new(),
            tool_calls: 0,
            outcome: None,
            diagnostic: None,
            duration_ms: 0,
            started_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn finish(&mut self, outcome: AttemptOutcome, diagnostic: Option<String>) {
        self.outcome = Some(outcome);
        self.diagnostic = diagnostic;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
