//! Remote backend contracts and the shared failure taxonomy.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::model::{EntityKind, JsonMap};

/// Retry policy class for remote failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Retryable,
    Permanent,
    ReauthRequired,
}

/// Errors raised by remote backends, classified per the sync error policy.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Missing/expired credentials or a `401`/`403` response. Terminal for
    /// the current attempt; queued entries are retried after login.
    #[error("authentication required")]
    Unauthorized,

    /// Network failure, timeout, or 5xx. Expected during offline operation;
    /// the entry is re-queued and the failure is never fatal to the user.
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// The remote rejected the payload shape. Re-queued until the attempts
    /// cap moves the entry to the dead-letter list.
    #[error("remote rejected payload: {0}")]
    Validation(String),

    /// The secondary store is not configured; the operation is a no-op.
    #[error("secondary store is not configured")]
    Unavailable,
}

impl RemoteError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Classify an HTTP response status into an error.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            401 | 403 => Self::Unauthorized,
            408 | 429 | 500..=599 => Self::Transient(format!("HTTP {}: {}", status, message.into())),
            _ => Self::Validation(format!("HTTP {}: {}", status, message.into())),
        }
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Unauthorized => RetryClass::ReauthRequired,
            Self::Transient(_) => RetryClass::Retryable,
            Self::Validation(_) => RetryClass::Permanent,
            Self::Unavailable => RetryClass::Permanent,
        }
    }
}

/// Exponential backoff in seconds with cap, applied between drain passes.
pub fn backoff_seconds(consecutive_failures: u32) -> u64 {
    const MAX_EXPONENT: u32 = 8;
    const BASE_DELAY_SECONDS: u64 = 5;

    let capped = consecutive_failures.min(MAX_EXPONENT);
    2_u64.pow(capped) * BASE_DELAY_SECONDS
}

/// A record as returned by the primary REST API.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    /// Server-assigned opaque id.
    pub id: String,
    /// Business fields; foreign keys hold remote ids of the referenced kind.
    pub fields: JsonMap,
}

/// Full local dataset for the bulk migration endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetExport {
    #[serde(flatten)]
    pub collections: BTreeMap<String, Vec<JsonMap>>,
}

/// Per-kind imported counts reported by the migration endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationCounts {
    #[serde(flatten)]
    pub imported: BTreeMap<String, u64>,
}

impl MigrationCounts {
    pub fn total(&self) -> u64 {
        self.imported.values().sum()
    }
}

/// Thin typed client over the primary HTTP CRUD endpoints.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Fetch the complete remote collection for a kind.
    async fn list(&self, kind: EntityKind) -> Result<Vec<RemoteRecord>, RemoteError>;

    /// Create a record; returns the server-assigned id.
    async fn create(&self, kind: EntityKind, payload: &JsonMap) -> Result<String, RemoteError>;

    /// Update a record in place.
    async fn update(
        &self,
        kind: EntityKind,
        remote_id: &str,
        payload: &JsonMap,
    ) -> Result<(), RemoteError>;

    /// Delete a record.
    async fn delete(&self, kind: EntityKind, remote_id: &str) -> Result<(), RemoteError>;

    /// Submit the full local dataset for first-time server-side ingestion.
    async fn migrate(&self, dataset: &DatasetExport) -> Result<MigrationCounts, RemoteError>;
}

/// Result of a secondary-store write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecondaryWrite {
    /// Row inserted; carries the UUID the store assigned.
    Created(String),
    /// Row updated under its existing UUID.
    Updated(String),
    /// Row deleted.
    Deleted,
    /// Nothing to do (e.g., delete of a record never synced there).
    Skipped,
    /// The store is not configured; no network I/O happened.
    Unavailable,
}

/// A row as returned by the secondary store.
#[derive(Debug, Clone, PartialEq)]
pub struct SecondaryRow {
    pub id: String,
    pub fields: JsonMap,
}

/// Optional row-based backup store, UUID-keyed and user-scoped.
///
/// Implementations re-validate the stored id format before choosing
/// update vs. insert, enforce the per-kind field allow-list, and scope
/// every query to the authenticated user.
#[async_trait]
pub trait SecondaryStore: Send + Sync {
    /// Whether endpoint URL and API key are both present.
    fn is_configured(&self) -> bool;

    async fn fetch_all(&self, kind: EntityKind) -> Result<Vec<SecondaryRow>, RemoteError>;

    /// Insert or update depending on whether `secondary_id` is a valid UUID.
    /// `fields` are the local camelCase fields; shaping happens inside.
    async fn upsert(
        &self,
        kind: EntityKind,
        secondary_id: Option<&str>,
        fields: &JsonMap,
    ) -> Result<SecondaryWrite, RemoteError>;

    /// Delete the row; a missing/invalid id is vacuously successful.
    async fn delete(
        &self,
        kind: EntityKind,
        secondary_id: Option<&str>,
    ) -> Result<SecondaryWrite, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_for_retry_policy() {
        assert_eq!(
            RemoteError::from_status(500, "oops").retry_class(),
            RetryClass::Retryable
        );
        assert_eq!(
            RemoteError::from_status(429, "slow down").retry_class(),
            RetryClass::Retryable
        );
        assert_eq!(
            RemoteError::from_status(401, "nope").retry_class(),
            RetryClass::ReauthRequired
        );
        assert_eq!(
            RemoteError::from_status(400, "bad shape").retry_class(),
            RetryClass::Permanent
        );
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        assert_eq!(backoff_seconds(0), 5);
        assert_eq!(backoff_seconds(1), 10);
        assert_eq!(backoff_seconds(2), 20);
        assert_eq!(backoff_seconds(9), backoff_seconds(8));
    }
}
