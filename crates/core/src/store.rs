//! Local store contract.
//!
//! The local store is the single source of truth for rendering: UI writes
//! land here first (optimistic), remote identifiers are back-filled
//! asynchronously. Implementations must make [`LocalStore::replace_all`]
//! transactional so readers never observe a half-cleared collection.

use crate::errors::Result;
use crate::model::{EntityKind, EntityRecord, NewRecord, RemoteKind};

/// Meta key holding the persisted mutation queue (JSON array).
pub const META_QUEUE: &str = "sync.queue";
/// Meta key holding dead-lettered queue entries (JSON array).
pub const META_DEAD_LETTERS: &str = "sync.dead_letters";
/// Meta key holding the RFC3339 timestamp of the last successful sync.
pub const META_LAST_SYNC_AT: &str = "sync.last_sync_at";
/// Meta key holding records with foreign keys awaiting a repair push.
pub const META_PENDING_REPAIRS: &str = "sync.pending_repairs";

/// Embedded, transactional document store keyed by local integer ids.
pub trait LocalStore: Send + Sync {
    /// Insert a record, returning the assigned local id. When
    /// `record.local_id` is `Some`, the row is inserted under that exact id.
    fn insert(&self, kind: EntityKind, record: NewRecord) -> Result<i64>;

    /// Overwrite the business fields of an existing record.
    fn update_fields(
        &self,
        kind: EntityKind,
        local_id: i64,
        fields: &crate::model::JsonMap,
    ) -> Result<()>;

    fn get(&self, kind: EntityKind, local_id: i64) -> Result<Option<EntityRecord>>;

    fn list(&self, kind: EntityKind) -> Result<Vec<EntityRecord>>;

    fn delete(&self, kind: EntityKind, local_id: i64) -> Result<()>;

    /// Replace the whole collection in one transaction: clear, then insert
    /// the given records. Returns assigned local ids in input order.
    fn replace_all(&self, kind: EntityKind, records: Vec<NewRecord>) -> Result<Vec<i64>>;

    /// Look up a record by the id a remote backend assigned to it.
    fn find_by_remote_id(
        &self,
        kind: EntityKind,
        remote: RemoteKind,
        remote_id: &str,
    ) -> Result<Option<EntityRecord>>;

    /// Persist a remote-assigned id onto a local record.
    fn set_remote_id(
        &self,
        kind: EntityKind,
        local_id: i64,
        remote: RemoteKind,
        remote_id: &str,
    ) -> Result<()>;

    /// Durable key-value storage for sync bookkeeping (queue, timestamps).
    fn get_meta(&self, key: &str) -> Result<Option<String>>;

    fn set_meta(&self, key: &str, value: &str) -> Result<()>;
}
