//! [`LocalStore`] backed by rusqlite.

use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Mutex, MutexGuard};

use tallybook_core::model::{EntityKind, EntityRecord, JsonMap, NewRecord, RemoteKind};
use tallybook_core::store::LocalStore;
use tallybook_core::{Error, Result};

use crate::db::{self, db_err};

/// SQLite-backed document store. A single connection guarded by a mutex is
/// enough here: writes are short and the sync layer serializes its own
/// heavy passes anyway.
pub struct SqliteLocalStore {
    conn: Mutex<Connection>,
}

impl SqliteLocalStore {
    pub fn open(path: &str) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(db::open(path)?),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(db::open_in_memory()?),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

type RawRow = (i64, Option<String>, Option<String>, String);

fn parse_record(raw: RawRow) -> Result<EntityRecord> {
    let (local_id, remote_id, secondary_id, fields) = raw;
    Ok(EntityRecord {
        local_id,
        remote_id,
        secondary_id,
        fields: serde_json::from_str::<JsonMap>(&fields)?,
    })
}

fn insert_record(conn: &Connection, kind: EntityKind, record: NewRecord) -> Result<i64> {
    let table = kind.table_name();
    let fields = serde_json::to_string(&record.fields)?;

    match record.local_id {
        Some(local_id) => {
            conn.execute(
                &format!(
                    "INSERT INTO {table} (local_id, remote_id, secondary_id, fields)
                     VALUES (?1, ?2, ?3, ?4)"
                ),
                params![local_id, record.remote_id, record.secondary_id, fields],
            )
            .map_err(db_err)?;
            Ok(local_id)
        }
        None => {
            conn.execute(
                &format!(
                    "INSERT INTO {table} (remote_id, secondary_id, fields)
                     VALUES (?1, ?2, ?3)"
                ),
                params![record.remote_id, record.secondary_id, fields],
            )
            .map_err(db_err)?;
            Ok(conn.last_insert_rowid())
        }
    }
}

impl LocalStore for SqliteLocalStore {
    fn insert(&self, kind: EntityKind, record: NewRecord) -> Result<i64> {
        insert_record(&self.conn(), kind, record)
    }

    fn update_fields(&self, kind: EntityKind, local_id: i64, fields: &JsonMap) -> Result<()> {
        let payload = serde_json::to_string(fields)?;
        let changed = self
            .conn()
            .execute(
                &format!(
                    "UPDATE {} SET fields = ?1 WHERE local_id = ?2",
                    kind.table_name()
                ),
                params![payload, local_id],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(Error::storage(format!(
                "no {} record with local id {}",
                kind.table_name(),
                local_id
            )));
        }
        Ok(())
    }

    fn get(&self, kind: EntityKind, local_id: i64) -> Result<Option<EntityRecord>> {
        let raw: Option<RawRow> = self
            .conn()
            .query_row(
                &format!(
                    "SELECT local_id, remote_id, secondary_id, fields
                     FROM {} WHERE local_id = ?1",
                    kind.table_name()
                ),
                params![local_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .map_err(db_err)?;

        raw.map(parse_record).transpose()
    }

    fn list(&self, kind: EntityKind) -> Result<Vec<EntityRecord>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT local_id, remote_id, secondary_id, fields
                 FROM {} ORDER BY local_id",
                kind.table_name()
            ))
            .map_err(db_err)?;

        let raw = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<RawRow>>>()
            .map_err(db_err)?;

        raw.into_iter().map(parse_record).collect()
    }

    fn delete(&self, kind: EntityKind, local_id: i64) -> Result<()> {
        self.conn()
            .execute(
                &format!("DELETE FROM {} WHERE local_id = ?1", kind.table_name()),
                params![local_id],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn replace_all(&self, kind: EntityKind, records: Vec<NewRecord>) -> Result<Vec<i64>> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(db_err)?;

        tx.execute(&format!("DELETE FROM {}", kind.table_name()), [])
            .map_err(db_err)?;

        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            ids.push(insert_record(&tx, kind, record)?);
        }

        tx.commit().map_err(db_err)?;
        Ok(ids)
    }

    fn find_by_remote_id(
        &self,
        kind: EntityKind,
        remote: RemoteKind,
        remote_id: &str,
    ) -> Result<Option<EntityRecord>> {
        let column = match remote {
            RemoteKind::Primary => "remote_id",
            RemoteKind::Secondary => "secondary_id",
        };

        let raw: Option<RawRow> = self
            .conn()
            .query_row(
                &format!(
                    "SELECT local_id, remote_id, secondary_id, fields
                     FROM {} WHERE {} = ?1 LIMIT 1",
                    kind.table_name(),
                    column
                ),
                params![remote_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .map_err(db_err)?;

        raw.map(parse_record).transpose()
    }

    fn set_remote_id(
        &self,
        kind: EntityKind,
        local_id: i64,
        remote: RemoteKind,
        remote_id: &str,
    ) -> Result<()> {
        let column = match remote {
            RemoteKind::Primary => "remote_id",
            RemoteKind::Secondary => "secondary_id",
        };

        let changed = self
            .conn()
            .execute(
                &format!(
                    "UPDATE {} SET {} = ?1 WHERE local_id = ?2",
                    kind.table_name(),
                    column
                ),
                params![remote_id, local_id],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(Error::storage(format!(
                "no {} record with local id {}",
                kind.table_name(),
                local_id
            )));
        }
        Ok(())
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        self.conn()
            .query_row(
                "SELECT value FROM sync_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO sync_meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(pairs: &[(&str, serde_json::Value)]) -> JsonMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn insert_assigns_monotonic_local_ids() {
        let store = SqliteLocalStore::open_in_memory().expect("open");

        let a = store
            .insert(
                EntityKind::Expense,
                NewRecord::with_fields(fields(&[("name", json!("rent"))])),
            )
            .expect("insert");
        let b = store
            .insert(
                EntityKind::Expense,
                NewRecord::with_fields(fields(&[("name", json!("power"))])),
            )
            .expect("insert");

        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[test]
    fn local_ids_survive_delete_without_reuse() {
        let store = SqliteLocalStore::open_in_memory().expect("open");

        let a = store
            .insert(EntityKind::Goal, NewRecord::default())
            .expect("insert");
        store.delete(EntityKind::Goal, a).expect("delete");
        let b = store
            .insert(EntityKind::Goal, NewRecord::default())
            .expect("insert");

        assert!(b > a, "deleted id {} must not be reused (got {})", a, b);
    }

    #[test]
    fn replace_all_honors_explicit_local_ids() {
        let store = SqliteLocalStore::open_in_memory().expect("open");

        for name in ["alpha", "beta", "gamma"] {
            store
                .insert(
                    EntityKind::Client,
                    NewRecord::with_fields(fields(&[("name", json!(name))])),
                )
                .expect("insert");
        }

        // Keep record 2 under its old id, give the others fresh ids.
        let mut keep = NewRecord::with_fields(fields(&[("name", json!("beta"))]));
        keep.local_id = Some(2);
        keep.remote_id = Some("srv-2".to_string());
        let fresh = NewRecord::with_fields(fields(&[("name", json!("delta"))]));

        let ids = store
            .replace_all(EntityKind::Client, vec![keep, fresh])
            .expect("replace");

        assert_eq!(ids[0], 2);
        assert!(ids[1] > 3, "fresh id must not collide with any prior id");

        let all = store.list(EntityKind::Client).expect("list");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].local_id, 2);
        assert_eq!(all[0].remote_id.as_deref(), Some("srv-2"));
    }

    #[test]
    fn find_by_remote_id_distinguishes_backends() {
        let store = SqliteLocalStore::open_in_memory().expect("open");

        let mut record = NewRecord::with_fields(fields(&[("name", json!("acme"))]));
        record.remote_id = Some("srv-9".to_string());
        record.secondary_id = Some("550e8400-e29b-41d4-a716-446655440000".to_string());
        store.insert(EntityKind::Client, record).expect("insert");

        let by_primary = store
            .find_by_remote_id(EntityKind::Client, RemoteKind::Primary, "srv-9")
            .expect("find");
        assert!(by_primary.is_some());

        let wrong_backend = store
            .find_by_remote_id(EntityKind::Client, RemoteKind::Secondary, "srv-9")
            .expect("find");
        assert!(wrong_backend.is_none());
    }

    #[test]
    fn set_remote_id_rejects_unknown_records() {
        let store = SqliteLocalStore::open_in_memory().expect("open");
        let err = store
            .set_remote_id(EntityKind::Todo, 42, RemoteKind::Primary, "srv-1")
            .unwrap_err();
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn update_fields_overwrites_the_document() {
        let store = SqliteLocalStore::open_in_memory().expect("open");
        let id = store
            .insert(
                EntityKind::Saving,
                NewRecord::with_fields(fields(&[("amount", json!(100))])),
            )
            .expect("insert");

        store
            .update_fields(EntityKind::Saving, id, &fields(&[("amount", json!(250))]))
            .expect("update");

        let record = store.get(EntityKind::Saving, id).expect("get").expect("some");
        assert_eq!(record.fields["amount"], json!(250));
    }

    #[test]
    fn meta_upserts_by_key() {
        let store = SqliteLocalStore::open_in_memory().expect("open");
        assert_eq!(store.get_meta("sync.last_sync_at").expect("get"), None);

        store.set_meta("sync.last_sync_at", "2026-01-01T00:00:00Z").expect("set");
        store.set_meta("sync.last_sync_at", "2026-02-01T00:00:00Z").expect("set");

        assert_eq!(
            store.get_meta("sync.last_sync_at").expect("get").as_deref(),
            Some("2026-02-01T00:00:00Z")
        );
    }
}
