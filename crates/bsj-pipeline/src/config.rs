//! Pipeline configuration, loaded once before a run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::retry::{BackoffPolicy, RejectionPolicy, RetryPolicy};
use crate::schema::UnknownKeyPolicy;
use bsj_types::{BsjError, MergePolicy, Result};

/// Every field has a default, so `{}` is a valid config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Attempts per agent stage, and reruns allowed per review gate.
    pub max_attempts: usize,
    pub rejection_policy: RejectionPolicy,
    pub backoff: BackoffPolicy,
    pub unknown_keys: UnknownKeyPolicy,
    pub merge_policy: MergePolicy,
    pub include_newsletter: bool,
    pub default_model: String,
    pub research_model: String,
    /// Stage name -> tool names, replacing the built-in attachment.
    pub stage_tools: BTreeMap<String, Vec<String>>,
    pub max_tool_rounds: usize,
    /// Where synthesized audio is written. Defaults to `<state dir>/audio`.
    pub audio_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            rejection_policy: RejectionPolicy::default(),
            backoff: BackoffPolicy::default(),
            unknown_keys: UnknownKeyPolicy::default(),
            merge_policy: MergePolicy::default(),
            include_newsletter: false,
            default_model: "gemini-2.5-flash".to_string(),
            research_model: "gemini-2.5-pro".to_string(),
            stage_tools: BTreeMap::new(),
            max_tool_rounds: 6,
            audio_dir: None,
        }
    }
}

impl PipelineConfig {
    /// Read a JSON config file.
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            BsjError::ConfigurationError(format!("invalid config {}: {e}", path.display()))
        })?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "Config loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(BsjError::ConfigurationError(
                "max_attempts must be at least 1".into(),
            ));
        }
        if self.default_model.trim().is_empty() {
            return Err(BsjError::ConfigurationError(
                "default_model must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff.clone(),
            on_rejection: self.rejection_policy,
        }
    }
}
