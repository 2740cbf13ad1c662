//! Error taxonomy for indexing runs.
//!
//! Errors fall into three tiers: file-level (recovered locally, the run
//! continues), batch-level (provider failures that went through the
//! shrink/retry policy and fail one batch), and run-level (store, checkpoint or
//! lock failures that halt the run).

use std::path::PathBuf;

use thiserror::Error;

use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, IndexError>;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Embedding provider failed after retries: {0}")]
    TransientProvider(String),

    #[error("Provider rejected batch of {batch_size} entities: {reason}")]
    ProviderRejectedBatch { batch_size: usize, reason: String },

    #[error("Failed to read {path:?}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Vector store write failed: {0}")]
    StoreWrite(#[from] StoreError),

    #[error("Checkpoint state at {path:?} is corrupt: {reason}")]
    CheckpointCorrupt { path: PathBuf, reason: String },

    #[error("Another run holds the index lock at {path:?}")]
    LockConflict { path: PathBuf },

    #[error("Extraction failed for {path}: {reason}")]
    Extract { path: String, reason: String },

    #[error("Git error: {0}")]
    Git(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl IndexError {
    /// Whether this error halts the whole run instead of a single file or batch.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::StoreWrite(_)
                | Self::CheckpointCorrupt { .. }
                | Self::LockConflict { .. }
                | Self::Io(_)
                | Self::Json(_)
        )
    }
}
