//! Run persistence.
//!
//! A run is saved after every step, when it suspends at a gate, and when it
//! finishes. The file is `<dir>/run.json`; a later process can load it and
//! resume a pending review.

use std::path::{Path, PathBuf};

use crate::run::PipelineRun;
use bsj_types::Result;

const FILE_NAME: &str = "run.json";

/// Save `run` to `<dir>/run.json`, creating `dir` if needed.
pub async fn save_run(run: &PipelineRun, dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(FILE_NAME);
    let tmp = dir.join(format!("{FILE_NAME}.tmp"));
    let json = serde_json::to_string_pretty(run)?;
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, &path).await?;
    tracing::debug!(path = %path.display(), run_id = %run.id, "Run saved");
    Ok(path)
}

/// `Ok(None)` when no run has been saved in `dir`.
pub async fn load_run(dir: &Path) -> Result<Option<PipelineRun>> {
    let path = dir.join(FILE_NAME);
    if !tokio::fs::try_exists(&path).await? {
        return Ok(None);
    }
    let json = tokio::fs::read_to_string(&path).await?;
    Ok(Some(serde_json::from_str(&json)?))
}

pub async fn clear_run(dir: &Path) -> Result<()> {
    let path = dir.join(FILE_NAME);
    if tokio::fs::try_exists(&path).await? {
        tokio::fs::remove_file(&path).await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
