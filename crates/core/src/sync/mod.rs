//! Synchronization layer: reconciler, mutation queue, orchestrator.

pub mod queue;
pub mod reconciler;
pub mod remote;
pub mod service;
pub mod session;

pub use queue::{DrainOutcome, MutationQueue, QueueDispatcher, QueueEntry, SyncOperation};
pub use reconciler::{
    is_valid_id, plan_remote_op, record_remote_id, resolve_remote_id, translate_fks_for_pull,
    translate_fks_for_push, PushTranslation, RemoteOpPlan,
};
pub use remote::{
    backoff_seconds, DatasetExport, MigrationCounts, RemoteApi, RemoteError, RemoteRecord,
    RetryClass, SecondaryRow, SecondaryStore, SecondaryWrite,
};
pub use service::{
    AuditReport, FullSyncReport, KindAudit, PullReport, PushReport, SubmitOutcome, SyncService,
    SyncStatus,
};
pub use session::AuthSession;
