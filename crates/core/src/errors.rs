//! Error types shared across the core crate.

use thiserror::Error;

use crate::sync::remote::RemoteError;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the local store and sync logic.
#[derive(Debug, Error)]
pub enum Error {
    /// Local storage failure (SQLite, poisoned lock, missing row).
    #[error("storage error: {0}")]
    Storage(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Remote backend failure, classified for retry policy.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Invariant violation in sync bookkeeping.
    #[error("sync error: {0}")]
    Sync(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Create a sync bookkeeping error
    pub fn sync(message: impl Into<String>) -> Self {
        Self::Sync(message.into())
    }
}
