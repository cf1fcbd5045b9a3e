//! Connection management and rusqlite error mapping shared by every store.

use crate::migration::run_migrations;
use chrono::{DateTime, Utc};
use mnemo_types::error::{MnemoError, MnemoResult};
use rusqlite::{Connection, ErrorCode};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

/// One SQLite connection shared by all stores.
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Largest number of bound parameters used in a single `IN (...)` list.
pub(crate) const IN_CHUNK: usize = 500;

/// Open (or create) a file-backed ledger database and migrate it.
pub fn open_database(path: &Path) -> MnemoResult<SharedConnection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path).map_err(storage_err)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )
    .map_err(storage_err)?;
    run_migrations(&conn).map_err(storage_err)?;
    info!(path = %path.display(), "Opened ledger database");
    Ok(Arc::new(Mutex::new(conn)))
}

/// Open a migrated in-memory database.
pub fn open_in_memory() -> MnemoResult<SharedConnection> {
    let conn = Connection::open_in_memory().map_err(storage_err)?;
    run_migrations(&conn).map_err(storage_err)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// Lock the shared connection.
pub(crate) fn lock(conn: &SharedConnection) -> MnemoResult<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|e| MnemoError::Internal(e.to_string()))
}

/// Map a rusqlite error; contention becomes a retryable write conflict.
pub(crate) fn storage_err(e: rusqlite::Error) -> MnemoError {
    if is_contention(&e) {
        MnemoError::WriteConflict {
            attempts: 1,
            reason: e.to_string(),
        }
    } else {
        MnemoError::Storage(e.to_string())
    }
}

fn is_contention(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// `?1, ?2, ... ?n` for an `IN` list.
pub(crate) fn placeholders(n: usize) -> String {
    (1..=n)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse a stored RFC 3339 timestamp.
pub(crate) fn parse_timestamp(s: &str) -> MnemoResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MnemoError::Serialization(format!("bad timestamp {s:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(1), "?1");
        assert_eq!(placeholders(3), "?1, ?2, ?3");
    }

    #[test]
    fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.db");
        let conn = open_database(&path).unwrap();
        assert!(path.exists());
        let guard = lock(&conn).unwrap();
        let n: i64 = guard
            .query_row("SELECT COUNT(*) FROM blocks", [], |row| row.get(0))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_storage_err_mapping() {
        let err = storage_err(rusqlite::Error::QueryReturnedNoRows);
        assert!(matches!(err, MnemoError::Storage(_)));
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(storage_err(busy).is_transient());
    }
}
