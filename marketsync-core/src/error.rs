//! Engine error taxonomy.
//!
//! Caller errors (`MissingParameter`, `InvalidParameter`, `UnknownCollection`)
//! surface before any work starts. Per-task failures are recovered inside a
//! batch run and only show up in the `RunOutcome` counts; the variants still
//! exist here so the messages are formatted in one place.

use thiserror::Error;

use crate::frame::FrameError;
use crate::source::SourceError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("missing required parameters: {}", .0.join(", "))]
    MissingParameter(Vec<String>),

    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    #[error("source collection '{0}' is empty, sync it first")]
    EmptySourceCollection(String),

    #[error("fetch failed for {task}: {source}")]
    SourceCallFailure {
        task: String,
        #[source]
        source: SourceError,
    },

    #[error("flush of {rows} rows failed: {reason}")]
    FlushFailure { rows: usize, reason: String },

    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("worker pool error: {0}")]
    Pool(String),
}

impl SyncError {
    /// True for errors caused by the caller's input rather than the run itself.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            SyncError::MissingParameter(_)
                | SyncError::InvalidParameter { .. }
                | SyncError::UnknownCollection(_)
        )
    }
}
