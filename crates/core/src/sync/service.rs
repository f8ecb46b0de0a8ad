//! Sync orchestration.
//!
//! [`SyncService`] is constructed once at application startup with its
//! store, remotes, and session injected, and is passed by reference
//! wherever sync entry points are needed. All bulk operations share one
//! "sync in progress" flag; a call made while another is active returns an
//! immediate `AlreadyRunning` result without side effects.

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::errors::{Error, Result};
use crate::model::{EntityKind, EntityRecord, JsonMap, NewRecord, RemoteKind};
use crate::store::{LocalStore, META_LAST_SYNC_AT, META_PENDING_REPAIRS};
use crate::sync::queue::{
    DrainOutcome, MutationQueue, QueueDispatcher, QueueEntry, SyncOperation,
};
use crate::sync::reconciler::{
    plan_remote_op, record_remote_id, resolve_remote_id, translate_fks_for_pull,
    translate_fks_for_push, RemoteOpPlan,
};
use crate::sync::remote::{
    DatasetExport, MigrationCounts, RemoteApi, RemoteError, SecondaryStore, SecondaryWrite,
};
use crate::sync::session::AuthSession;

/// Outcome of one bulk sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    /// Some entity kinds failed while others succeeded. Succeeded kinds are
    /// not rolled back; there is no cross-entity atomicity.
    PartialFailure,
    Failure,
    /// Another sync run held the flag; treated as a successful no-op by UI.
    AlreadyRunning,
}

/// Result of a bulk pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullReport {
    pub status: SyncStatus,
    /// Kinds replaced from the remote, with record counts.
    pub pulled: Vec<(EntityKind, usize)>,
    /// Kinds whose fetch failed; their local data is left untouched.
    pub failed: Vec<EntityKind>,
}

impl PullReport {
    fn already_running() -> Self {
        Self {
            status: SyncStatus::AlreadyRunning,
            pulled: Vec::new(),
            failed: Vec::new(),
        }
    }
}

/// Result of a bulk migration push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReport {
    pub status: SyncStatus,
    pub counts: MigrationCounts,
}

/// Combined result of push-then-pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullSyncReport {
    pub status: SyncStatus,
    pub push: Option<PushReport>,
    pub pull: Option<PullReport>,
}

/// How an optimistic UI mutation was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Confirmed by the primary remote immediately.
    Synced,
    /// Queued for later replay (offline, unauthenticated, or failed).
    Queued,
}

/// Per-kind divergence between the local store and the secondary store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindAudit {
    pub kind: EntityKind,
    /// Local records with no matching secondary row.
    pub local_only: usize,
    /// Secondary rows unknown locally.
    pub remote_only: usize,
}

/// Result of the explicit secondary divergence audit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditReport {
    /// False when the secondary store is not configured.
    pub available: bool,
    pub kinds: Vec<KindAudit>,
    pub failed: Vec<EntityKind>,
}

/// A record whose push omitted foreign-key references, awaiting repair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRepair {
    pub kind: EntityKind,
    pub local_id: i64,
}

fn local_err(err: Error) -> RemoteError {
    RemoteError::transient(format!("local store: {}", err))
}

/// Orchestrates pulls, pushes, queue replay, and repair passes.
pub struct SyncService {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteApi>,
    secondary: Arc<dyn SecondaryStore>,
    session: Arc<AuthSession>,
    queue: MutationQueue,
    pending_repairs: Mutex<Vec<PendingRepair>>,
    syncing: AtomicBool,
}

impl SyncService {
    /// Build the service, reloading the persisted queue and repair list.
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteApi>,
        secondary: Arc<dyn SecondaryStore>,
        session: Arc<AuthSession>,
    ) -> Result<Self> {
        let queue = MutationQueue::load(Arc::clone(&store))?;
        let pending_repairs: Vec<PendingRepair> = match store.get_meta(META_PENDING_REPAIRS)? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Vec::new(),
        };

        Ok(Self {
            store,
            remote,
            secondary,
            session,
            queue,
            pending_repairs: Mutex::new(pending_repairs),
            syncing: AtomicBool::new(false),
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Observability
    // ─────────────────────────────────────────────────────────────────────

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn queue_entries(&self) -> Vec<QueueEntry> {
        self.queue.entries()
    }

    pub fn dead_letters(&self) -> Vec<QueueEntry> {
        self.queue.dead_letters()
    }

    pub fn pending_repairs(&self) -> Vec<PendingRepair> {
        self.pending_repairs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    pub fn last_sync_at(&self) -> Result<Option<String>> {
        self.store.get_meta(META_LAST_SYNC_AT)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Entry points
    // ─────────────────────────────────────────────────────────────────────

    /// Run once at startup, after construction: replay the persisted queue
    /// if it is non-empty. Callers await this before considering startup
    /// initialization finished.
    pub async fn startup(&self) -> Result<DrainOutcome> {
        if self.queue.is_empty() {
            debug!("startup: mutation queue empty, nothing to replay");
            return Ok(DrainOutcome::Completed {
                succeeded: 0,
                requeued: 0,
                dead_lettered: 0,
                halted_on_auth: false,
            });
        }
        info!("startup: replaying {} queued mutations", self.queue.len());
        self.process_queue().await
    }

    /// Handle an optimistic UI mutation: the local store has already been
    /// written; confirm it remotely now or queue it for later.
    pub async fn submit(
        &self,
        kind: EntityKind,
        op: SyncOperation,
        record: &EntityRecord,
    ) -> Result<SubmitOutcome> {
        let entry = QueueEntry::from_record(kind, op, record);

        if !self.session.is_authenticated() {
            self.queue.enqueue(entry)?;
            return Ok(SubmitOutcome::Queued);
        }

        match self.dispatch(&entry).await {
            Ok(()) => Ok(SubmitOutcome::Synced),
            Err(err) => {
                debug!(
                    "immediate {:?} {:?} {} failed, queueing: {}",
                    op, kind, record.local_id, err
                );
                self.queue.enqueue(entry)?;
                Ok(SubmitOutcome::Queued)
            }
        }
    }

    /// Drain the mutation queue, then run the foreign-key repair pass.
    /// No-op when the user is not authenticated.
    pub async fn process_queue(&self) -> Result<DrainOutcome> {
        if !self.session.is_authenticated() {
            debug!("process_queue skipped: not authenticated");
            return Ok(DrainOutcome::Completed {
                succeeded: 0,
                requeued: 0,
                dead_lettered: 0,
                halted_on_auth: true,
            });
        }
        if !self.try_begin_sync() {
            return Ok(DrainOutcome::AlreadyRunning);
        }

        let result = self.process_queue_locked().await;
        self.end_sync();
        result
    }

    async fn process_queue_locked(&self) -> Result<DrainOutcome> {
        let outcome = self.queue.drain(self).await?;
        if let DrainOutcome::Completed {
            halted_on_auth: false,
            ..
        } = outcome
        {
            let repaired = self.repair_references().await?;
            if repaired > 0 {
                info!("repaired {} deferred foreign-key references", repaired);
            }
        }
        Ok(outcome)
    }

    /// Full remote → local replace, one entity kind at a time.
    pub async fn pull_all(&self) -> Result<PullReport> {
        if !self.try_begin_sync() {
            return Ok(PullReport::already_running());
        }
        let result = self.pull_all_locked().await;
        self.end_sync();
        result
    }

    /// Export the entire local dataset to the bulk migration endpoint.
    pub async fn push_all(&self) -> Result<PushReport> {
        if !self.try_begin_sync() {
            return Ok(PushReport {
                status: SyncStatus::AlreadyRunning,
                counts: MigrationCounts::default(),
            });
        }
        let result = self.push_all_locked().await;
        self.end_sync();
        result
    }

    /// Push, then pull, so locally-originated changes are not clobbered by
    /// the subsequent pull. Overall success requires both halves.
    pub async fn full_sync(&self) -> Result<FullSyncReport> {
        if !self.try_begin_sync() {
            return Ok(FullSyncReport {
                status: SyncStatus::AlreadyRunning,
                push: None,
                pull: None,
            });
        }
        let result = self.full_sync_locked().await;
        self.end_sync();
        result
    }

    // ─────────────────────────────────────────────────────────────────────
    // Pull
    // ─────────────────────────────────────────────────────────────────────

    async fn pull_all_locked(&self) -> Result<PullReport> {
        if !self.session.is_authenticated() {
            warn!("pull_all skipped: not authenticated");
            return Ok(PullReport {
                status: SyncStatus::Failure,
                pulled: Vec::new(),
                failed: EntityKind::ALL.to_vec(),
            });
        }

        let mut pulled = Vec::new();
        let mut failed = Vec::new();

        for kind in EntityKind::ALL {
            match self.remote.list(kind).await {
                Ok(records) => {
                    let count = records.len();
                    self.replace_kind_from_remote(kind, records)?;
                    pulled.push((kind, count));
                }
                Err(RemoteError::Unauthorized) => {
                    warn!("pull halted on {:?}: authentication failed", kind);
                    failed.push(kind);
                    break;
                }
                Err(err) => {
                    // Each kind's pull is independent: old local data for
                    // this kind is kept, the others continue.
                    warn!("pull of {:?} failed, keeping local data: {}", kind, err);
                    failed.push(kind);
                }
            }
        }

        let status = if failed.is_empty() {
            self.store
                .set_meta(META_LAST_SYNC_AT, &Utc::now().to_rfc3339())?;
            SyncStatus::Success
        } else if pulled.is_empty() {
            SyncStatus::Failure
        } else {
            SyncStatus::PartialFailure
        };

        info!(
            "pull_all finished: {:?}, {} kinds pulled, {} failed",
            status,
            pulled.len(),
            failed.len()
        );
        Ok(PullReport {
            status,
            pulled,
            failed,
        })
    }

    /// Replace one kind's collection with the fetched remote state, inside
    /// a single storage transaction. Records matched by primary remote id
    /// keep their local id (and secondary id), so foreign keys held by
    /// other kinds stay valid across the replace.
    fn replace_kind_from_remote(
        &self,
        kind: EntityKind,
        records: Vec<crate::sync::remote::RemoteRecord>,
    ) -> Result<()> {
        let existing = self.store.list(kind)?;
        let mut by_remote_id: HashMap<String, (i64, Option<String>)> = existing
            .into_iter()
            .filter_map(|rec| {
                rec.remote_id
                    .clone()
                    .map(|id| (id, (rec.local_id, rec.secondary_id)))
            })
            .collect();

        let mut replacements = Vec::with_capacity(records.len());
        for remote_record in records {
            let fields = translate_fks_for_pull(
                self.store.as_ref(),
                kind,
                remote_record.fields,
                RemoteKind::Primary,
            )?;
            let (local_id, secondary_id) = match by_remote_id.remove(&remote_record.id) {
                Some((local_id, secondary_id)) => (Some(local_id), secondary_id),
                None => (None, None),
            };
            replacements.push(NewRecord {
                local_id,
                remote_id: Some(remote_record.id),
                secondary_id,
                fields,
            });
        }

        self.store.replace_all(kind, replacements)?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Push
    // ─────────────────────────────────────────────────────────────────────

    async fn push_all_locked(&self) -> Result<PushReport> {
        if !self.session.is_authenticated() {
            warn!("push_all skipped: not authenticated");
            return Ok(PushReport {
                status: SyncStatus::Failure,
                counts: MigrationCounts::default(),
            });
        }

        let mut collections = BTreeMap::new();
        for kind in EntityKind::ALL {
            let rows = self
                .store
                .list(kind)?
                .into_iter()
                .map(|record| {
                    let mut row = record.fields;
                    row.insert("localId".to_string(), serde_json::Value::from(record.local_id));
                    if let Some(remote_id) = record.remote_id {
                        row.insert("remoteId".to_string(), serde_json::Value::String(remote_id));
                    }
                    row
                })
                .collect::<Vec<JsonMap>>();
            collections.insert(kind.export_key().to_string(), rows);
        }

        match self.remote.migrate(&DatasetExport { collections }).await {
            Ok(counts) => {
                info!("push_all migrated {} records", counts.total());
                Ok(PushReport {
                    status: SyncStatus::Success,
                    counts,
                })
            }
            Err(err) => {
                warn!("push_all failed: {}", err);
                Ok(PushReport {
                    status: SyncStatus::Failure,
                    counts: MigrationCounts::default(),
                })
            }
        }
    }

    async fn full_sync_locked(&self) -> Result<FullSyncReport> {
        let push = self.push_all_locked().await?;
        let pull = self.pull_all_locked().await?;

        let status = match (push.status, pull.status) {
            (SyncStatus::Success, SyncStatus::Success) => SyncStatus::Success,
            (SyncStatus::Failure, SyncStatus::Failure) => SyncStatus::Failure,
            _ => SyncStatus::PartialFailure,
        };

        Ok(FullSyncReport {
            status,
            push: Some(push),
            pull: Some(pull),
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Foreign-key repair (phase 2 of the two-phase push)
    // ─────────────────────────────────────────────────────────────────────

    /// Re-resolve and push foreign keys that earlier pushes had to omit.
    /// Returns how many records were repaired.
    pub async fn repair_references(&self) -> Result<usize> {
        let pending = self.pending_repairs();
        if pending.is_empty() {
            return Ok(0);
        }

        let mut repaired = 0;
        let mut remaining = Vec::new();

        for (index, repair) in pending.iter().enumerate() {
            let Some(record) = self.store.get(repair.kind, repair.local_id)? else {
                // Record deleted locally; nothing left to repair.
                continue;
            };
            let Some(remote_id) =
                resolve_remote_id(&record, RemoteKind::Primary).map(str::to_string)
            else {
                // Its own create has not flushed yet; try again next pass.
                remaining.push(repair.clone());
                continue;
            };

            let translation = translate_fks_for_push(
                self.store.as_ref(),
                repair.kind,
                &record.fields,
                RemoteKind::Primary,
            )?;
            if !translation.omitted.is_empty() {
                remaining.push(repair.clone());
                continue;
            }

            match self
                .remote
                .update(repair.kind, &remote_id, &translation.fields)
                .await
            {
                Ok(()) => repaired += 1,
                Err(RemoteError::Unauthorized) => {
                    remaining.push(repair.clone());
                    remaining.extend(pending[index + 1..].iter().cloned());
                    break;
                }
                Err(err) => {
                    warn!(
                        "repair of {:?} {} failed: {}",
                        repair.kind, repair.local_id, err
                    );
                    remaining.push(repair.clone());
                }
            }
        }

        self.set_pending_repairs(remaining)?;
        Ok(repaired)
    }

    fn note_pending_repair(&self, kind: EntityKind, local_id: i64) -> Result<()> {
        let mut pending = self
            .pending_repairs
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let repair = PendingRepair { kind, local_id };
        if !pending.contains(&repair) {
            pending.push(repair);
        }
        let snapshot = pending.clone();
        drop(pending);
        self.store
            .set_meta(META_PENDING_REPAIRS, &serde_json::to_string(&snapshot)?)
    }

    fn set_pending_repairs(&self, repairs: Vec<PendingRepair>) -> Result<()> {
        let serialized = serde_json::to_string(&repairs)?;
        *self
            .pending_repairs
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = repairs;
        self.store.set_meta(META_PENDING_REPAIRS, &serialized)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Secondary store
    // ─────────────────────────────────────────────────────────────────────

    /// Mirror the current state of a record to the secondary store.
    /// Best-effort: the backends are independent, so a secondary failure
    /// never fails the primary dispatch; `audit_secondary` catches drift.
    async fn mirror_secondary(&self, kind: EntityKind, local_id: i64) {
        if !self.secondary.is_configured() {
            return;
        }
        let record = match self.store.get(kind, local_id) {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(err) => {
                warn!("secondary mirror read failed for {:?} {}: {}", kind, local_id, err);
                return;
            }
        };

        let translation = match translate_fks_for_push(
            self.store.as_ref(),
            kind,
            &record.fields,
            RemoteKind::Secondary,
        ) {
            Ok(translation) => translation,
            Err(err) => {
                warn!("secondary translation failed for {:?} {}: {}", kind, local_id, err);
                return;
            }
        };

        match self
            .secondary
            .upsert(kind, record.secondary_id.as_deref(), &translation.fields)
            .await
        {
            Ok(SecondaryWrite::Created(id)) => {
                if let Err(err) = record_remote_id(
                    self.store.as_ref(),
                    kind,
                    local_id,
                    RemoteKind::Secondary,
                    &id,
                ) {
                    warn!("failed to record secondary id for {:?} {}: {}", kind, local_id, err);
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!("secondary mirror of {:?} {} failed: {}", kind, local_id, err);
            }
        }
    }

    /// Explicit divergence audit between the local store and the secondary
    /// store. The two backends share no cross-consistency guarantee, so
    /// drift is reported rather than assumed away.
    pub async fn audit_secondary(&self) -> Result<AuditReport> {
        if !self.secondary.is_configured() {
            return Ok(AuditReport {
                available: false,
                kinds: Vec::new(),
                failed: Vec::new(),
            });
        }

        let mut kinds = Vec::new();
        let mut failed = Vec::new();

        for kind in EntityKind::ALL {
            let rows = match self.secondary.fetch_all(kind).await {
                Ok(rows) => rows,
                Err(err) => {
                    warn!("audit fetch of {:?} failed: {}", kind, err);
                    failed.push(kind);
                    continue;
                }
            };

            let remote_ids: HashSet<&str> = rows.iter().map(|row| row.id.as_str()).collect();
            let locals = self.store.list(kind)?;
            let local_ids: HashSet<&str> = locals
                .iter()
                .filter_map(|rec| resolve_remote_id(rec, RemoteKind::Secondary))
                .collect();

            let local_only = locals
                .iter()
                .filter(|rec| {
                    resolve_remote_id(rec, RemoteKind::Secondary)
                        .map_or(true, |id| !remote_ids.contains(id))
                })
                .count();
            let remote_only = rows
                .iter()
                .filter(|row| !local_ids.contains(row.id.as_str()))
                .count();

            kinds.push(KindAudit {
                kind,
                local_only,
                remote_only,
            });
        }

        Ok(AuditReport {
            available: true,
            kinds,
            failed,
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Dispatch internals
    // ─────────────────────────────────────────────────────────────────────

    async fn dispatch_upsert(&self, entry: &QueueEntry) -> std::result::Result<(), RemoteError> {
        // Prefer the live record: it carries the freshest fields and any
        // remote id back-filled since the entry was queued.
        let Some(record) = self
            .store
            .get(entry.kind, entry.local_id)
            .map_err(local_err)?
        else {
            // Deleted locally since; nothing left to sync.
            debug!(
                "dropping queued {:?} for {:?} {}: record gone locally",
                entry.op, entry.kind, entry.local_id
            );
            return Ok(());
        };

        let translation = translate_fks_for_push(
            self.store.as_ref(),
            entry.kind,
            &record.fields,
            RemoteKind::Primary,
        )
        .map_err(local_err)?;

        match plan_remote_op(&record, entry.op, RemoteKind::Primary) {
            RemoteOpPlan::Create => {
                let remote_id = self.remote.create(entry.kind, &translation.fields).await?;
                record_remote_id(
                    self.store.as_ref(),
                    entry.kind,
                    entry.local_id,
                    RemoteKind::Primary,
                    &remote_id,
                )
                .map_err(local_err)?;
            }
            RemoteOpPlan::Update(remote_id) => {
                self.remote
                    .update(entry.kind, &remote_id, &translation.fields)
                    .await?;
            }
            RemoteOpPlan::Delete(_) | RemoteOpPlan::SkipDelete => return Ok(()),
        }

        if !translation.omitted.is_empty() {
            if let Err(err) = self.note_pending_repair(entry.kind, entry.local_id) {
                warn!(
                    "failed to persist pending repair for {:?} {}: {}",
                    entry.kind, entry.local_id, err
                );
            }
        }

        self.mirror_secondary(entry.kind, entry.local_id).await;
        Ok(())
    }

    async fn dispatch_delete(&self, entry: &QueueEntry) -> std::result::Result<(), RemoteError> {
        // The local row is usually gone by now; fall back to the ids
        // snapshotted at enqueue time.
        let (remote_id, secondary_id) = match self
            .store
            .get(entry.kind, entry.local_id)
            .map_err(local_err)?
        {
            Some(record) => (record.remote_id, record.secondary_id),
            None => (entry.remote_id.clone(), entry.secondary_id.clone()),
        };

        let probe = EntityRecord {
            local_id: entry.local_id,
            remote_id,
            secondary_id: secondary_id.clone(),
            fields: JsonMap::new(),
        };

        match plan_remote_op(&probe, SyncOperation::Delete, RemoteKind::Primary) {
            RemoteOpPlan::Delete(remote_id) => {
                self.remote.delete(entry.kind, &remote_id).await?;
            }
            _ => {
                debug!(
                    "skipping remote delete for {:?} {}: never synced to primary",
                    entry.kind, entry.local_id
                );
            }
        }

        if self.secondary.is_configured() {
            if let Err(err) = self
                .secondary
                .delete(entry.kind, secondary_id.as_deref())
                .await
            {
                warn!(
                    "secondary delete of {:?} {} failed: {}",
                    entry.kind, entry.local_id, err
                );
            }
        }

        Ok(())
    }

    fn try_begin_sync(&self) -> bool {
        self.syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn end_sync(&self) {
        self.syncing.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl QueueDispatcher for SyncService {
    async fn dispatch(&self, entry: &QueueEntry) -> std::result::Result<(), RemoteError> {
        match entry.op {
            SyncOperation::Create | SyncOperation::Update => self.dispatch_upsert(entry).await,
            SyncOperation::Delete => self.dispatch_delete(entry).await,
        }
    }
}
