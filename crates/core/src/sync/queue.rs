//! Durable FIFO queue of pending mutations.
//!
//! Entries are created when a mutation cannot be confirmed by a remote and
//! removed only after the remote operation succeeds. A failed entry is
//! re-appended at the tail so one poison entry cannot block the rest of a
//! pass; past [`MAX_ATTEMPTS`] it moves to the dead-letter list instead of
//! re-queuing forever. The full queue is persisted after every mutation so
//! a restart mid-sync loses no pending work.

use async_trait::async_trait;
use chrono::Utc;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::errors::Result;
use crate::model::{EntityKind, EntityRecord, JsonMap};
use crate::store::{LocalStore, META_DEAD_LETTERS, META_QUEUE};
use crate::sync::remote::RemoteError;

/// Attempts before an entry is dead-lettered.
pub const MAX_ATTEMPTS: u32 = 5;

/// Supported mutation operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

/// A pending mutation awaiting remote confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub kind: EntityKind,
    pub op: SyncOperation,
    pub local_id: i64,
    /// Remote ids snapshotted at enqueue time, so a delete can still be
    /// dispatched after the local row is gone.
    pub remote_id: Option<String>,
    pub secondary_id: Option<String>,
    /// Field snapshot at enqueue time; creates/updates prefer the live
    /// record at dispatch time and fall back to this.
    pub payload: JsonMap,
    pub enqueued_at: String,
    pub attempts: u32,
}

impl QueueEntry {
    /// Snapshot a record into a queue entry.
    pub fn from_record(kind: EntityKind, op: SyncOperation, record: &EntityRecord) -> Self {
        Self {
            kind,
            op,
            local_id: record.local_id,
            remote_id: record.remote_id.clone(),
            secondary_id: record.secondary_id.clone(),
            payload: record.fields.clone(),
            enqueued_at: Utc::now().to_rfc3339(),
            attempts: 0,
        }
    }
}

/// Executes one queue entry against the remote backends.
#[async_trait]
pub trait QueueDispatcher: Send + Sync {
    async fn dispatch(&self, entry: &QueueEntry) -> std::result::Result<(), RemoteError>;
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// A drain was already in flight; nothing was processed.
    AlreadyRunning,
    Completed {
        succeeded: usize,
        requeued: usize,
        dead_lettered: usize,
        /// True when the pass stopped early on an authentication failure;
        /// the failing entry and everything behind it stay queued.
        halted_on_auth: bool,
    },
}

/// Ordered, durable mutation queue.
pub struct MutationQueue {
    store: Arc<dyn LocalStore>,
    entries: Mutex<VecDeque<QueueEntry>>,
    dead: Mutex<Vec<QueueEntry>>,
    draining: AtomicBool,
}

impl MutationQueue {
    /// Reload persisted queue state from the store's meta keys.
    pub fn load(store: Arc<dyn LocalStore>) -> Result<Self> {
        let entries: VecDeque<QueueEntry> = match store.get_meta(META_QUEUE)? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => VecDeque::new(),
        };
        let dead: Vec<QueueEntry> = match store.get_meta(META_DEAD_LETTERS)? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Vec::new(),
        };

        Ok(Self {
            store,
            entries: Mutex::new(entries),
            dead: Mutex::new(dead),
            draining: AtomicBool::new(false),
        })
    }

    fn lock_entries(&self) -> MutexGuard<'_, VecDeque<QueueEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_dead(&self) -> MutexGuard<'_, Vec<QueueEntry>> {
        self.dead.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append to the tail and persist.
    pub fn enqueue(&self, entry: QueueEntry) -> Result<()> {
        self.lock_entries().push_back(entry);
        self.persist()
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    pub fn entries(&self) -> Vec<QueueEntry> {
        self.lock_entries().iter().cloned().collect()
    }

    pub fn dead_letters(&self) -> Vec<QueueEntry> {
        self.lock_dead().clone()
    }

    fn persist(&self) -> Result<()> {
        let entries = self.lock_entries().iter().cloned().collect::<Vec<_>>();
        let dead = self.lock_dead().clone();
        self.store
            .set_meta(META_QUEUE, &serde_json::to_string(&entries)?)?;
        self.store
            .set_meta(META_DEAD_LETTERS, &serde_json::to_string(&dead)?)
    }

    /// Process one FIFO pass over the entries present when the pass starts.
    ///
    /// Per-entry failures are caught and logged, never propagated: the entry
    /// re-queues at the tail (or dead-letters past the cap) and the pass
    /// continues. After one pass, surviving entries are exactly the ones
    /// that failed at least once; callers apply backoff between passes.
    pub async fn drain(&self, dispatcher: &dyn QueueDispatcher) -> Result<DrainOutcome> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(DrainOutcome::AlreadyRunning);
        }

        let result = self.drain_pass(dispatcher).await;
        self.draining.store(false, Ordering::SeqCst);
        result
    }

    async fn drain_pass(&self, dispatcher: &dyn QueueDispatcher) -> Result<DrainOutcome> {
        let pass_len = self.lock_entries().len();
        let mut succeeded = 0;
        let mut requeued = 0;
        let mut dead_lettered = 0;
        let mut halted_on_auth = false;

        for _ in 0..pass_len {
            let Some(mut entry) = self.lock_entries().pop_front() else {
                break;
            };

            match dispatcher.dispatch(&entry).await {
                Ok(()) => {
                    succeeded += 1;
                    self.persist()?;
                }
                Err(RemoteError::Unauthorized) => {
                    // Terminal for the session: stop calling out, keep
                    // everything queued for after re-authentication.
                    warn!(
                        "queue drain halted: authentication failed on {:?} {:?} {}",
                        entry.kind, entry.op, entry.local_id
                    );
                    self.lock_entries().push_front(entry);
                    halted_on_auth = true;
                    break;
                }
                Err(err) => {
                    entry.attempts += 1;
                    warn!(
                        "queued {:?} {:?} for {:?} {} failed (attempt {}): {}",
                        entry.op, entry.kind, entry.kind, entry.local_id, entry.attempts, err
                    );
                    if entry.attempts >= MAX_ATTEMPTS {
                        dead_lettered += 1;
                        warn!(
                            "dead-lettering {:?} {:?} {} after {} attempts",
                            entry.kind, entry.op, entry.local_id, entry.attempts
                        );
                        self.lock_dead().push(entry);
                    } else {
                        requeued += 1;
                        self.lock_entries().push_back(entry);
                    }
                    self.persist()?;
                }
            }
        }

        Ok(DrainOutcome::Completed {
            succeeded,
            requeued,
            dead_lettered,
            halted_on_auth,
        })
    }
}
