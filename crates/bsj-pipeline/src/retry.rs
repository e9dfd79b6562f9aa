//! Retry bounds and backoff between agent attempts.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use bsj_types::{BsjError, Result};

/// Backoff policy controlling the delay between attempts of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Fixed delay between attempts.
    Fixed { ms: u64 },
    /// `base_ms * 2^attempt`, capped at `max_ms`.
    Exponential { base_ms: u64, max_ms: u64 },
    /// Retry immediately.
    None,
}

impl BackoffPolicy {
    /// Delay after the given failed attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            BackoffPolicy::Fixed { ms } => Duration::from_millis(*ms),
            BackoffPolicy::Exponential { base_ms, max_ms } => {
                let factor = 2u64.saturating_pow(attempt.min(32) as u32);
                Duration::from_millis(base_ms.saturating_mul(factor).min(*max_ms))
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base_ms: 500,
            max_ms: 30_000,
        }
    }
}

/// What a reviewer rejection does to the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionPolicy {
    /// Send the reviewed stage back with the notes, until the attempt budget
    /// for that gate is spent.
    #[default]
    Rerun,
    /// End the run as `rejected` on the first rejection.
    Terminate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per stage execution, and reruns per gate. Always >= 1.
    pub max_attempts: usize,
    pub backoff: BackoffPolicy,
    pub on_rejection: RejectionPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            on_rejection: RejectionPolicy::default(),
        }
    }
}

/// Sleep out the backoff after `attempt`, returning early with
/// [`BsjError::Cancelled`] if the run is cancelled meanwhile.
pub async fn pause(policy: &BackoffPolicy, attempt: usize, cancel: &CancellationToken) -> Result<()> {
    let delay = policy.delay_for_attempt(attempt);
    if delay.is_zero() {
        return if cancel.is_cancelled() {
            Err(BsjError::Cancelled)
        } else {
            Ok(())
        };
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BsjError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
