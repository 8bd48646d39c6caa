//! SQLite utilities for snapshots and staging stores.
//!
//! Two connection profiles exist:
//! - staging stores use `journal_mode = WAL`, `synchronous = NORMAL`,
//!   `foreign_keys = ON` and a 5s busy timeout; they are private to one
//!   writer and live outside the bundle
//! - snapshots are opened read-only and carry `journal_mode = DELETE`, so a
//!   published file is self-contained and never grows `-wal`/`-shm` siblings

pub mod migrations;
pub mod mutation;
pub mod query;
pub mod schema;

use rusqlite::backup::Backup;
use rusqlite::{Connection, ErrorCode, OpenFlags};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, StorageError};

/// Busy timeout used for staging connections.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// First 16 bytes of every SQLite database file.
pub const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Apply the staging pragmas to a writable connection.
///
/// # Errors
///
/// Returns an error if any pragma fails.
pub fn configure_staging(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    Ok(())
}

/// Open a database file without write access.
///
/// # Errors
///
/// Returns an error if the file is missing or cannot be opened.
pub fn open_read_only(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| StorageError::sqlite(path, e))?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    Ok(conn)
}

/// Whether the file starts with the SQLite header.
#[must_use]
pub fn has_sqlite_header(path: &Path) -> bool {
    let mut header = [0_u8; 16];
    let read = File::open(path).and_then(|mut f| f.read_exact(&mut header));
    read.is_ok() && &header == SQLITE_MAGIC
}

/// Cheap validity check used by recovery and pruning: the file must carry
/// the SQLite header, open read-only and pass `PRAGMA quick_check`.
///
/// # Errors
///
/// Returns a human-readable reason when the file is not a valid database.
pub fn quick_check(path: &Path) -> Result<(), String> {
    if !has_sqlite_header(path) {
        return Err("missing or truncated sqlite header".to_string());
    }
    let conn = open_read_only(path).map_err(|e| e.to_string())?;
    let verdict: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .map_err(|e| e.to_string())?;
    if verdict.eq_ignore_ascii_case("ok") {
        Ok(())
    } else {
        Err(verdict)
    }
}

/// Run the full `PRAGMA integrity_check`. Returns `None` when the database
/// is sound, otherwise the joined diagnostic lines.
///
/// # Errors
///
/// Returns an error if the pragma itself cannot run.
pub fn integrity_check(conn: &Connection) -> rusqlite::Result<Option<String>> {
    let mut stmt = conn.prepare("PRAGMA integrity_check")?;
    let lines: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    if lines.len() == 1 && lines[0].eq_ignore_ascii_case("ok") {
        Ok(None)
    } else {
        Ok(Some(lines.join("; ")))
    }
}

/// Whether a SQLite error means the file itself is damaged.
#[must_use]
pub fn is_corruption(error: &rusqlite::Error) -> bool {
    matches!(
        error.sqlite_error_code(),
        Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase)
    )
}

/// Reject databases written by a newer schema.
///
/// # Errors
///
/// Returns [`StorageError::UnsupportedSchemaVersion`] when the stored
/// version exceeds [`migrations::LATEST_SCHEMA_VERSION`].
pub fn ensure_supported(conn: &Connection) -> Result<u32> {
    let found = migrations::current_schema_version(conn)?;
    if found > migrations::LATEST_SCHEMA_VERSION {
        return Err(StorageError::UnsupportedSchemaVersion {
            found,
            supported: migrations::LATEST_SCHEMA_VERSION,
        });
    }
    Ok(found)
}

/// Open a published snapshot for reading.
///
/// Snapshots at the latest schema are opened directly. Older ones are copied
/// into an in-memory database and migrated there, so the file on disk is
/// never modified.
///
/// # Errors
///
/// Returns an error if the snapshot cannot be opened, is too new, or the
/// in-memory upgrade fails.
pub fn open_snapshot_view(path: &Path) -> Result<Connection> {
    let conn = open_read_only(path)?;
    let version = ensure_supported(&conn)?;
    if version == migrations::LATEST_SCHEMA_VERSION {
        return Ok(conn);
    }

    let mut view = Connection::open_in_memory()?;
    {
        let backup = Backup::new(&conn, &mut view)?;
        backup.run_to_completion(256, Duration::ZERO, None)?;
    }
    migrations::migrate(&mut view)?;
    tracing::debug!(
        path = %path.display(),
        from = version,
        "opened snapshot through in-memory upgrade"
    );
    Ok(view)
}

/// Create a fresh database at `path` with the latest schema in
/// `journal_mode = DELETE`.
///
/// # Errors
///
/// Returns an error if the file cannot be created or migrated.
pub fn create_empty_database(path: &Path) -> Result<()> {
    let mut conn = Connection::open(path).map_err(|e| StorageError::sqlite(path, e))?;
    let _journal_mode: String = conn.query_row("PRAGMA journal_mode = DELETE", [], |row| row.get(0))?;
    migrations::migrate(&mut conn).map_err(|e| StorageError::sqlite(path, e))?;
    conn.close().map_err(|(_, e)| StorageError::sqlite(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::query::{GetMeta, Query};
    use tempfile::TempDir;

    fn temp_db_path() -> (TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("000001.sqlite");
        (dir, path)
    }

    #[test]
    fn staging_profile_sets_wal_busy_timeout_and_fk() {
        let (_dir, path) = temp_db_path();
        let conn = Connection::open(&path).expect("open db");
        configure_staging(&conn).expect("configure");

        let journal_mode: String = conn
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .expect("query journal_mode");
        assert_eq!(journal_mode.to_ascii_lowercase(), "wal");

        let busy_timeout_ms: u64 = conn
            .pragma_query_value(None, "busy_timeout", |row| row.get(0))
            .expect("query busy_timeout");
        assert_eq!(u128::from(busy_timeout_ms), DEFAULT_BUSY_TIMEOUT.as_millis());

        let foreign_keys: i64 = conn
            .pragma_query_value(None, "foreign_keys", |row| row.get(0))
            .expect("query foreign_keys");
        assert_eq!(foreign_keys, 1);
    }

    #[test]
    fn created_database_is_valid_and_current() {
        let (_dir, path) = temp_db_path();
        create_empty_database(&path).expect("create");

        assert!(quick_check(&path).is_ok());
        let conn = open_read_only(&path).expect("open");
        assert_eq!(
            ensure_supported(&conn).expect("version"),
            migrations::LATEST_SCHEMA_VERSION
        );
        assert_eq!(integrity_check(&conn).expect("integrity"), None);
    }

    #[test]
    fn quick_check_rejects_garbage_and_truncation() {
        let (dir, path) = temp_db_path();
        std::fs::write(&path, b"definitely not sqlite").unwrap();
        assert!(quick_check(&path).is_err());

        let empty = dir.path().join("empty.sqlite");
        std::fs::write(&empty, b"").unwrap();
        assert!(quick_check(&empty).is_err());

        assert!(quick_check(&dir.path().join("missing.sqlite")).is_err());
    }

    #[test]
    fn newer_schema_is_rejected() {
        let (_dir, path) = temp_db_path();
        create_empty_database(&path).unwrap();
        {
            let conn = Connection::open(&path).unwrap();
            conn.pragma_update(None, "user_version", 99_i64).unwrap();
        }
        let err = open_snapshot_view(&path).unwrap_err();
        assert!(matches!(
            err,
            StorageError::UnsupportedSchemaVersion { found: 99, .. }
        ));
    }

    #[test]
    fn older_snapshot_is_upgraded_in_memory_only() {
        let (_dir, path) = temp_db_path();
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(schema::MIGRATION_V1_SQL).unwrap();
            conn.execute_batch("INSERT INTO meta (key, value) VALUES ('title', 'old')")
                .unwrap();
            conn.pragma_update(None, "user_version", 1_i64).unwrap();
        }
        let before = std::fs::read(&path).unwrap();

        let view = open_snapshot_view(&path).unwrap();
        assert_eq!(
            migrations::current_schema_version(&view).unwrap(),
            migrations::LATEST_SCHEMA_VERSION
        );
        assert_eq!(
            GetMeta("title".into()).run(&view).unwrap().as_deref(),
            Some("old")
        );
        drop(view);

        assert_eq!(std::fs::read(&path).unwrap(), before);
    }
}
