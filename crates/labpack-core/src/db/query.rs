//! Typed read queries.
//!
//! Every read issued by the application is a value implementing [`Query`],
//! so the same query runs unchanged against a writer's staging store or a
//! viewer's snapshot.

use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::model::{Dataset, EventRecord, Setting, TraceSample};

/// A read against a project database.
pub trait Query {
    type Output;

    /// Execute against `conn`.
    ///
    /// # Errors
    ///
    /// Returns an error if the SQL fails or a row does not decode.
    fn run(&self, conn: &Connection) -> rusqlite::Result<Self::Output>;
}

/// All datasets ordered by id.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListDatasets;

/// A single dataset by id.
#[derive(Debug, Clone, Copy)]
pub struct GetDataset(pub i64);

/// Events of one dataset, in time order.
#[derive(Debug, Clone, Copy)]
pub struct ListEvents {
    pub dataset_id: i64,
}

/// A single event by id.
#[derive(Debug, Clone, Copy)]
pub struct GetEvent(pub i64);

/// Trace samples of one dataset in `[from, to]` seconds; `None` bounds are
/// open.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceWindow {
    pub dataset_id: i64,
    pub from: Option<f64>,
    pub to: Option<f64>,
}

/// A layout/settings document by key.
#[derive(Debug, Clone)]
pub struct GetSetting(pub String);

/// A project metadata value by key.
#[derive(Debug, Clone)]
pub struct GetMeta(pub String);

/// Row counts per table, used for cheap equality checks between copies.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableCounts;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counts {
    pub datasets: u64,
    pub trace_samples: u64,
    pub events: u64,
    pub settings: u64,
}

const DATASET_COLUMNS: &str = "id, name, created_utc, notes, fps, pixel_size_um";
const EVENT_COLUMNS: &str = "id, dataset_id, t_seconds, label, frame, note";

fn dataset_from_row(row: &Row<'_>) -> rusqlite::Result<Dataset> {
    Ok(Dataset {
        id: row.get(0)?,
        name: row.get(1)?,
        created_utc: row.get(2)?,
        notes: row.get(3)?,
        fps: row.get(4)?,
        pixel_size_um: row.get(5)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<EventRecord> {
    Ok(EventRecord {
        id: row.get(0)?,
        dataset_id: row.get(1)?,
        t_seconds: row.get(2)?,
        label: row.get(3)?,
        frame: row.get(4)?,
        note: row.get(5)?,
    })
}

impl Query for ListDatasets {
    type Output = Vec<Dataset>;

    fn run(&self, conn: &Connection) -> rusqlite::Result<Self::Output> {
        let mut stmt = conn.prepare(&format!("SELECT {DATASET_COLUMNS} FROM dataset ORDER BY id"))?;
        let rows = stmt.query_map([], dataset_from_row)?;
        rows.collect()
    }
}

impl Query for GetDataset {
    type Output = Option<Dataset>;

    fn run(&self, conn: &Connection) -> rusqlite::Result<Self::Output> {
        conn.query_row(
            &format!("SELECT {DATASET_COLUMNS} FROM dataset WHERE id = ?1"),
            [self.0],
            dataset_from_row,
        )
        .optional()
    }
}

impl Query for ListEvents {
    type Output = Vec<EventRecord>;

    fn run(&self, conn: &Connection) -> rusqlite::Result<Self::Output> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM event WHERE dataset_id = ?1 ORDER BY t_seconds, id"
        ))?;
        let rows = stmt.query_map([self.dataset_id], event_from_row)?;
        rows.collect()
    }
}

impl Query for GetEvent {
    type Output = Option<EventRecord>;

    fn run(&self, conn: &Connection) -> rusqlite::Result<Self::Output> {
        conn.query_row(
            &format!("SELECT {EVENT_COLUMNS} FROM event WHERE id = ?1"),
            [self.0],
            event_from_row,
        )
        .optional()
    }
}

impl Query for TraceWindow {
    type Output = Vec<TraceSample>;

    fn run(&self, conn: &Connection) -> rusqlite::Result<Self::Output> {
        let mut stmt = conn.prepare(
            "SELECT t_seconds, inner_diam, outer_diam, pressure
             FROM trace
             WHERE dataset_id = ?1
               AND (?2 IS NULL OR t_seconds >= ?2)
               AND (?3 IS NULL OR t_seconds <= ?3)
             ORDER BY t_seconds",
        )?;
        let rows = stmt.query_map(params![self.dataset_id, self.from, self.to], |row| {
            Ok(TraceSample {
                t_seconds: row.get(0)?,
                inner_diam: row.get(1)?,
                outer_diam: row.get(2)?,
                pressure: row.get(3)?,
            })
        })?;
        rows.collect()
    }
}

impl Query for GetSetting {
    type Output = Option<Setting>;

    fn run(&self, conn: &Connection) -> rusqlite::Result<Self::Output> {
        let row: Option<(String, String, i64)> = conn
            .query_row(
                "SELECT key, value_json, updated_ts FROM ui_state WHERE key = ?1",
                [&self.0],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        row.map(|(key, raw, updated_ts)| {
            let value = serde_json::from_str(&raw).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
            })?;
            Ok(Setting {
                key,
                value,
                updated_ts,
            })
        })
        .transpose()
    }
}

impl Query for GetMeta {
    type Output = Option<String>;

    fn run(&self, conn: &Connection) -> rusqlite::Result<Self::Output> {
        conn.query_row("SELECT value FROM meta WHERE key = ?1", [&self.0], |row| {
            row.get(0)
        })
        .optional()
    }
}

impl Query for TableCounts {
    type Output = Counts;

    fn run(&self, conn: &Connection) -> rusqlite::Result<Self::Output> {
        let count = |table: &str| -> rusqlite::Result<u64> {
            let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })?;
            Ok(n.unsigned_abs())
        };
        Ok(Counts {
            datasets: count("dataset")?,
            trace_samples: count("trace")?,
            events: count("event")?,
            settings: count("ui_state")?,
        })
    }
}
