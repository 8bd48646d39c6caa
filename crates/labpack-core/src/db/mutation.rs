//! Write operations against a staging store.
//!
//! A [`Mutation`] is the unit the application hands to a writable handle.
//! Batches are applied all-or-nothing and stamp `meta.modified_utc`, so a
//! published snapshot always records when its content last changed.

use rusqlite::{Connection, params};

use crate::durable::unix_now;
use crate::model::{Dataset, EventRecord, TraceSample};

// ---------------------------------------------------------------------------
// Mutation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Insert or replace a dataset row.
    PutDataset(Dataset),
    /// Delete a dataset with its trace and events.
    DeleteDataset(i64),
    PutEvent(EventRecord),
    DeleteEvent(i64),
    /// Upsert samples keyed by `(dataset_id, t_seconds)`.
    PutTraceSamples {
        dataset_id: i64,
        samples: Vec<TraceSample>,
    },
    ClearTrace(i64),
    PutSetting {
        key: String,
        value: serde_json::Value,
    },
    DeleteSetting(String),
    PutMeta {
        key: String,
        value: String,
    },
}

/// Outcome of an applied batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    /// Mutations applied.
    pub applied: usize,
    /// Rows inserted, replaced or deleted.
    pub rows_changed: usize,
}

/// Apply `mutations` in a single transaction.
///
/// # Errors
///
/// Returns an error if any statement fails; nothing from the batch is kept.
pub fn apply_all(conn: &mut Connection, mutations: &[Mutation]) -> rusqlite::Result<ApplyStats> {
    let tx = conn.transaction()?;
    let mut stats = ApplyStats::default();

    for mutation in mutations {
        stats.rows_changed += apply_one(&tx, mutation)?;
        stats.applied += 1;
    }

    if stats.applied > 0 {
        tx.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('modified_utc', ?1)",
            [chrono::Utc::now().to_rfc3339()],
        )?;
    }
    tx.commit()?;

    tracing::trace!(
        applied = stats.applied,
        rows = stats.rows_changed,
        "applied mutations"
    );
    Ok(stats)
}

fn apply_one(conn: &Connection, mutation: &Mutation) -> rusqlite::Result<usize> {
    match mutation {
        Mutation::PutDataset(ds) => conn.execute(
            "INSERT INTO dataset (id, name, created_utc, notes, fps, pixel_size_um)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 created_utc = excluded.created_utc,
                 notes = excluded.notes,
                 fps = excluded.fps,
                 pixel_size_um = excluded.pixel_size_um",
            params![
                ds.id,
                ds.name,
                ds.created_utc,
                ds.notes,
                ds.fps,
                ds.pixel_size_um
            ],
        ),
        Mutation::DeleteDataset(id) => conn.execute("DELETE FROM dataset WHERE id = ?1", [id]),
        Mutation::PutEvent(ev) => conn.execute(
            "INSERT OR REPLACE INTO event (id, dataset_id, t_seconds, label, frame, note)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![ev.id, ev.dataset_id, ev.t_seconds, ev.label, ev.frame, ev.note],
        ),
        Mutation::DeleteEvent(id) => conn.execute("DELETE FROM event WHERE id = ?1", [id]),
        Mutation::PutTraceSamples {
            dataset_id,
            samples,
        } => {
            let mut stmt = conn.prepare_cached(
                "INSERT OR REPLACE INTO trace
                     (dataset_id, t_seconds, inner_diam, outer_diam, pressure)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            let mut changed = 0;
            for s in samples {
                changed += stmt.execute(params![
                    dataset_id,
                    s.t_seconds,
                    s.inner_diam,
                    s.outer_diam,
                    s.pressure
                ])?;
            }
            Ok(changed)
        }
        Mutation::ClearTrace(dataset_id) => {
            conn.execute("DELETE FROM trace WHERE dataset_id = ?1", [dataset_id])
        }
        Mutation::PutSetting { key, value } => conn.execute(
            "INSERT OR REPLACE INTO ui_state (key, value_json, updated_ts) VALUES (?1, ?2, ?3)",
            params![key, value.to_string(), unix_now()],
        ),
        Mutation::DeleteSetting(key) => {
            conn.execute("DELETE FROM ui_state WHERE key = ?1", [key])
        }
        Mutation::PutMeta { key, value } => conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations;
    use crate::db::query::{GetDataset, GetMeta, GetSetting, ListEvents, Query, TraceWindow};
    use serde_json::json;

    fn test_db() -> Connection {
        let mut conn = Connection::open_in_memory().expect("open in-memory db");
        conn.pragma_update(None, "foreign_keys", "ON").expect("fk");
        migrations::migrate(&mut conn).expect("migrate");
        conn
    }

    fn sample(t: f64, inner: f64) -> TraceSample {
        TraceSample {
            t_seconds: t,
            inner_diam: Some(inner),
            outer_diam: None,
            pressure: None,
        }
    }

    #[test]
    fn put_dataset_upserts() {
        let mut conn = test_db();
        apply_all(&mut conn, &[Mutation::PutDataset(Dataset::new(1, "first"))]).unwrap();
        apply_all(&mut conn, &[Mutation::PutDataset(Dataset::new(1, "renamed"))]).unwrap();

        let ds = GetDataset(1).run(&conn).unwrap().unwrap();
        assert_eq!(ds.name, "renamed");
        assert!(GetMeta("modified_utc".into()).run(&conn).unwrap().is_some());
    }

    #[test]
    fn deleting_dataset_cascades_to_children() {
        let mut conn = test_db();
        apply_all(
            &mut conn,
            &[
                Mutation::PutDataset(Dataset::new(1, "v")),
                Mutation::PutEvent(EventRecord::new(1, 1, 0.5, "drug")),
                Mutation::PutTraceSamples {
                    dataset_id: 1,
                    samples: vec![sample(0.0, 1.0), sample(0.1, 1.1)],
                },
            ],
        )
        .unwrap();

        apply_all(&mut conn, &[Mutation::DeleteDataset(1)]).unwrap();

        assert!(ListEvents { dataset_id: 1 }.run(&conn).unwrap().is_empty());
        assert!(
            TraceWindow {
                dataset_id: 1,
                ..TraceWindow::default()
            }
            .run(&conn)
            .unwrap()
            .is_empty()
        );
    }

    #[test]
    fn failing_batch_rolls_back_entirely() {
        let mut conn = test_db();
        let result = apply_all(
            &mut conn,
            &[
                Mutation::PutDataset(Dataset::new(1, "v")),
                // dataset 99 does not exist
                Mutation::PutEvent(EventRecord::new(1, 99, 0.5, "orphan")),
            ],
        );
        assert!(result.is_err());
        assert!(GetDataset(1).run(&conn).unwrap().is_none());
    }

    #[test]
    fn settings_round_trip_as_json() {
        let mut conn = test_db();
        apply_all(
            &mut conn,
            &[Mutation::PutSetting {
                key: "layout".into(),
                value: json!({"panes": [1, 2]}),
            }],
        )
        .unwrap();
        let setting = GetSetting("layout".into()).run(&conn).unwrap().unwrap();
        assert_eq!(setting.value, json!({"panes": [1, 2]}));

        apply_all(&mut conn, &[Mutation::DeleteSetting("layout".into())]).unwrap();
        assert!(GetSetting("layout".into()).run(&conn).unwrap().is_none());
    }

    #[test]
    fn trace_samples_replace_on_same_timestamp() {
        let mut conn = test_db();
        apply_all(
            &mut conn,
            &[
                Mutation::PutDataset(Dataset::new(1, "v")),
                Mutation::PutTraceSamples {
                    dataset_id: 1,
                    samples: vec![sample(0.0, 1.0)],
                },
                Mutation::PutTraceSamples {
                    dataset_id: 1,
                    samples: vec![sample(0.0, 2.0)],
                },
            ],
        )
        .unwrap();
        let rows = TraceWindow {
            dataset_id: 1,
            ..TraceWindow::default()
        }
        .run(&conn)
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].inner_diam, Some(2.0));

        apply_all(&mut conn, &[Mutation::ClearTrace(1)]).unwrap();
        assert!(
            TraceWindow {
                dataset_id: 1,
                ..TraceWindow::default()
            }
            .run(&conn)
            .unwrap()
            .is_empty()
        );
    }
}
