//! Schema migrations for project databases.
//!
//! Migrations only ever run against private copies (staging stores or
//! in-memory views). Published snapshots are never migrated in place.

use super::schema;
use rusqlite::{Connection, OptionalExtension, Transaction, types::Type};

/// Latest schema version understood by this binary.
pub const LATEST_SCHEMA_VERSION: u32 = 2;

type MigrationFn = fn(&Transaction<'_>) -> rusqlite::Result<()>;

const MIGRATIONS: &[(u32, MigrationFn)] = &[(1, migrate_v1), (2, migrate_v2)];

fn migrate_v1(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(schema::MIGRATION_V1_SQL)?;
    let now = chrono::Utc::now().to_rfc3339();
    tx.execute(
        "INSERT OR IGNORE INTO meta (key, value) VALUES ('created_utc', ?1)",
        [&now],
    )?;
    Ok(())
}

fn migrate_v2(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(schema::MIGRATION_V2_SQL)?;
    if !column_exists(tx, "event", "note")? {
        tx.execute_batch("ALTER TABLE event ADD COLUMN note TEXT")?;
    }
    Ok(())
}

/// Read `PRAGMA user_version` and convert it to a Rust `u32`.
///
/// # Errors
///
/// Returns an error if querying SQLite fails or the version value cannot be
/// represented as `u32`.
pub fn current_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    u32::try_from(version).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(0, Type::Integer, Box::new(error))
    })
}

/// Apply all pending migrations in ascending order, each in its own
/// transaction together with its `user_version` bump.
///
/// Callers must reject versions above [`LATEST_SCHEMA_VERSION`] first;
/// this function leaves such databases untouched.
///
/// # Errors
///
/// Returns an error if any migration fails; earlier steps stay committed.
pub fn migrate(conn: &mut Connection) -> rusqlite::Result<u32> {
    let mut current = current_schema_version(conn)?;

    for (version, step) in MIGRATIONS {
        if *version <= current {
            continue;
        }

        let tx = conn.transaction()?;
        step(&tx)?;
        tx.pragma_update(None, "user_version", i64::from(*version))?;
        tx.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)",
            [version.to_string()],
        )?;
        tx.commit()?;
        tracing::debug!(from = current, to = version, "applied schema migration");
        current = *version;
    }

    Ok(current)
}

/// Whether `table` exists in the main schema.
///
/// # Errors
///
/// Returns an error if querying `sqlite_master` fails.
pub fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        [table],
        |row| row.get(0),
    )
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let found: Option<String> = conn
        .query_row(
            &format!("SELECT name FROM pragma_table_info('{table}') WHERE name = ?1"),
            [column],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn migrate_empty_db_to_latest() -> rusqlite::Result<()> {
        let mut conn = Connection::open_in_memory()?;

        let applied = migrate(&mut conn)?;
        assert_eq!(applied, LATEST_SCHEMA_VERSION);
        assert_eq!(current_schema_version(&conn)?, LATEST_SCHEMA_VERSION);

        for table in schema::REQUIRED_TABLES {
            assert!(table_exists(&conn, table)?, "missing table {table}");
        }
        assert!(column_exists(&conn, "event", "note")?);
        Ok(())
    }

    #[test]
    fn migrate_is_idempotent() -> rusqlite::Result<()> {
        let mut conn = Connection::open_in_memory()?;

        assert_eq!(migrate(&mut conn)?, LATEST_SCHEMA_VERSION);
        assert_eq!(migrate(&mut conn)?, LATEST_SCHEMA_VERSION);

        let version: String = conn.query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(version, LATEST_SCHEMA_VERSION.to_string());
        Ok(())
    }

    #[test]
    fn migrate_upgrades_v1_rows_in_place() -> rusqlite::Result<()> {
        let mut conn = Connection::open_in_memory()?;
        conn.execute_batch(schema::MIGRATION_V1_SQL)?;
        conn.pragma_update(None, "user_version", 1_i64)?;
        conn.execute_batch(
            "INSERT INTO dataset (id, name, created_utc) VALUES (1, 'vessel 1', '2024-01-01');
             INSERT INTO event (id, dataset_id, t_seconds, label) VALUES (1, 1, 2.5, 'KCl');",
        )?;

        assert_eq!(migrate(&mut conn)?, LATEST_SCHEMA_VERSION);

        let (label, note): (String, Option<String>) = conn.query_row(
            "SELECT label, note FROM event WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        assert_eq!(label, "KCl");
        assert_eq!(note, None);
        assert!(table_exists(&conn, "ui_state")?);
        Ok(())
    }

    #[test]
    fn migrate_repairs_v1_database_that_already_has_note_column() -> rusqlite::Result<()> {
        let mut conn = Connection::open_in_memory()?;
        conn.execute_batch(schema::MIGRATION_V1_SQL)?;
        conn.execute_batch("ALTER TABLE event ADD COLUMN note TEXT")?;
        conn.pragma_update(None, "user_version", 1_i64)?;

        assert_eq!(migrate(&mut conn)?, LATEST_SCHEMA_VERSION);
        Ok(())
    }
}
