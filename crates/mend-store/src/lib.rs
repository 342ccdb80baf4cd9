use std::fs;
use std::path::Path;

use serde::Serialize;
use thiserror::Error;

pub mod backup;
pub mod evaluation;
pub mod metrics;

pub use backup::{BackupError, BackupFile, BackupHandle, BackupManager, BackupRecord};
pub use evaluation::{
    EvaluationRecord, EvaluationStore, JsonlEvaluationStore, SqliteEvaluationStore,
};
pub use metrics::{MetricEntry, MetricStage, MetricsCollector, MetricsSummary, StageSummary};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to lock shared resource: {0}")]
    LockPoisoned(String),
}

/// Replaces `path` with the pretty JSON rendering of `value` through a
/// sibling temp file, so readers never observe a half-written document.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_vec_pretty(value).map_err(std::io::Error::other)?;
    let staging = path.with_extension("json.tmp");
    fs::write(&staging, content)?;
    fs::rename(staging, path)
}
