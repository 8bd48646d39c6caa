//! Canonical SQLite schema for project snapshots.
//!
//! The tables are the persistence contract shared by snapshots, staging
//! stores and legacy single-file projects:
//! - `meta` holds project-level key/value metadata
//! - `dataset` is one recorded experiment; `trace` and `event` hang off it
//! - `ui_state` (v2) keeps layout and settings documents as JSON

/// Migration v1: the layout used by legacy single-file projects.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS dataset (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    created_utc TEXT NOT NULL,
    notes TEXT,
    fps REAL,
    pixel_size_um REAL
);

CREATE TABLE IF NOT EXISTS trace (
    dataset_id INTEGER NOT NULL REFERENCES dataset(id) ON DELETE CASCADE,
    t_seconds REAL NOT NULL,
    inner_diam REAL,
    outer_diam REAL,
    pressure REAL,
    PRIMARY KEY (dataset_id, t_seconds)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS event (
    id INTEGER PRIMARY KEY,
    dataset_id INTEGER NOT NULL REFERENCES dataset(id) ON DELETE CASCADE,
    t_seconds REAL NOT NULL,
    label TEXT NOT NULL,
    frame INTEGER
);

CREATE INDEX IF NOT EXISTS event_ds_t ON event(dataset_id, t_seconds);
";

/// Migration v2 DDL: layout/settings documents. The `event.note` column is
/// added separately because `ALTER TABLE` has no `IF NOT EXISTS` form.
pub const MIGRATION_V2_SQL: &str = r"
CREATE TABLE IF NOT EXISTS ui_state (
    key TEXT PRIMARY KEY,
    value_json TEXT NOT NULL,
    updated_ts INTEGER NOT NULL
);
";

/// Tables every valid project database must contain at the latest version.
pub const REQUIRED_TABLES: &[&str] = &["meta", "dataset", "trace", "event", "ui_state"];

/// Tables whose presence identifies a single-file project of any version.
pub const LEGACY_SIGNATURE_TABLES: &[&str] = &["dataset", "event"];
