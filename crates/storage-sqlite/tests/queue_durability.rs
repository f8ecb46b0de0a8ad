//! Mutation-queue durability against the real SQLite store.

use std::sync::Arc;

use tallybook_core::model::{EntityKind, JsonMap};
use tallybook_core::store::{LocalStore, META_QUEUE};
use tallybook_core::sync::queue::{MutationQueue, QueueEntry, SyncOperation};

fn entry(kind: EntityKind, op: SyncOperation, local_id: i64) -> QueueEntry {
    QueueEntry {
        kind,
        op,
        local_id,
        remote_id: None,
        secondary_id: None,
        payload: JsonMap::new(),
        enqueued_at: "2026-03-01T12:00:00+00:00".to_string(),
        attempts: 0,
    }
}

#[test]
fn queued_entries_survive_a_reload() {
    let store: Arc<dyn LocalStore> =
        Arc::new(tallybook_storage_sqlite::SqliteLocalStore::open_in_memory().expect("open"));

    let queue = MutationQueue::load(Arc::clone(&store)).expect("load");
    queue
        .enqueue(entry(EntityKind::Expense, SyncOperation::Create, 1))
        .expect("enqueue");
    queue
        .enqueue(entry(EntityKind::Goal, SyncOperation::Delete, 7))
        .expect("enqueue");

    // Simulate a restart: build a fresh queue over the same database.
    let reloaded = MutationQueue::load(Arc::clone(&store)).expect("reload");
    let entries = reloaded.entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].kind, EntityKind::Expense);
    assert_eq!(entries[0].op, SyncOperation::Create);
    assert_eq!(entries[1].local_id, 7);
}

#[test]
fn persisted_queue_is_plain_json() {
    let store: Arc<dyn LocalStore> =
        Arc::new(tallybook_storage_sqlite::SqliteLocalStore::open_in_memory().expect("open"));

    let queue = MutationQueue::load(Arc::clone(&store)).expect("load");
    queue
        .enqueue(entry(EntityKind::Invoice, SyncOperation::Update, 3))
        .expect("enqueue");

    let raw = store
        .get_meta(META_QUEUE)
        .expect("meta")
        .expect("queue persisted");
    let parsed: serde_json::Value = serde_json::from_str(&raw).expect("valid json");
    assert_eq!(parsed[0]["kind"], "invoice");
    assert_eq!(parsed[0]["op"], "update");
    assert_eq!(parsed[0]["localId"], 3);
}
