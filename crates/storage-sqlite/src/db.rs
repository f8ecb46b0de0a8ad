//! Connection setup and schema initialization.
//!
//! Every entity collection gets the same four-column shape: an
//! auto-incrementing local id, the two remote ids, and the business fields
//! as a JSON document. `AUTOINCREMENT` keeps local ids monotonic even
//! across deletes and full-collection replaces, so an id handed to a remote
//! is never silently reused for a different record.

use rusqlite::Connection;

use tallybook_core::model::EntityKind;
use tallybook_core::{Error, Result};

pub(crate) fn db_err(err: rusqlite::Error) -> Error {
    Error::storage(err.to_string())
}

/// Open (and initialize) a database at the given path.
pub fn open(path: &str) -> Result<Connection> {
    let conn = Connection::open(path).map_err(db_err)?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Open an in-memory database, mainly for tests.
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory().map_err(db_err)?;
    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;",
    )
    .map_err(db_err)?;

    for kind in EntityKind::ALL {
        let table = kind.table_name();
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                 local_id     INTEGER PRIMARY KEY AUTOINCREMENT,
                 remote_id    TEXT,
                 secondary_id TEXT,
                 fields       TEXT NOT NULL DEFAULT '{{}}'
             );
             CREATE INDEX IF NOT EXISTS idx_{table}_remote_id
                 ON {table}(remote_id);
             CREATE INDEX IF NOT EXISTS idx_{table}_secondary_id
                 ON {table}(secondary_id);"
        ))
        .map_err(db_err)?;
    }

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sync_meta (
             key   TEXT PRIMARY KEY,
             value TEXT NOT NULL
         );",
    )
    .map_err(db_err)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_a_table_per_entity_kind() {
        let conn = open_in_memory().expect("open");
        for kind in EntityKind::ALL {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [kind.table_name()],
                    |row| row.get(0),
                )
                .expect("count");
            assert_eq!(count, 1, "missing table {}", kind.table_name());
        }
    }

    #[test]
    fn schema_init_is_idempotent() {
        let conn = open_in_memory().expect("open");
        init_schema(&conn).expect("second init");
    }
}
