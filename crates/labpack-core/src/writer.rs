//! Snapshot publication.
//!
//! [`publish`] turns the current state of a staging store into a new
//! immutable snapshot and then advances HEAD. Every step is a durability
//! checkpoint; until the HEAD rename lands, HEAD still names the previous
//! valid snapshot.
//!
//! 1. drain the staging WAL (bounded retries)
//! 2. page-level backup into `snapshots/.publish-*.tmp`
//! 3. switch the copy to `journal_mode = DELETE`, optionally `VACUUM`,
//!    `PRAGMA optimize`, then verify it with `integrity_check`
//! 4. `fsync` the copy
//! 5. no-clobber rename to the next sequence number
//! 6. `fsync` `snapshots/`
//! 7. atomically replace HEAD and `fsync` the bundle root

use rusqlite::backup::Backup;
use rusqlite::Connection;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::PublishConfig;
use crate::db;
use crate::durable::fsync_dir;
use crate::error::{Result, StorageError};
use crate::head::{self, HeadDoc};
use crate::layout::{Bundle, PUBLISH_TEMP_PREFIX, PUBLISH_TEMP_SUFFIX, SnapshotRef, SnapshotSeq};
use crate::staging::StagingStore;

const BACKUP_PAGES_PER_STEP: i32 = 1024;

/// Durability checkpoints of a publish, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStep {
    Checkpointed,
    Copied,
    Finalized,
    Synced,
    Renamed,
    DirSynced,
    HeadWritten,
}

/// Publish the staging store as the bundle's next snapshot.
///
/// The staging store stays open for further edits and records the new
/// sequence as its source.
///
/// # Errors
///
/// - [`StorageError::CheckpointIncomplete`] if the WAL will not drain
/// - [`StorageError::IntegrityCheckFailed`] if the copy does not verify
/// - [`StorageError::DiskFull`] / [`StorageError::PermissionDenied`] and other
///   I/O failures
///
/// On any error before the rename the temp file is removed and HEAD is
/// untouched.
pub fn publish(
    bundle: &Bundle,
    staging: &mut StagingStore,
    config: &PublishConfig,
) -> Result<SnapshotRef> {
    let start = Instant::now();

    drain_wal(staging, config)?;
    reached(PublishStep::Checkpointed)?;

    let dir = bundle.snapshots_dir();
    let temp = tempfile::Builder::new()
        .prefix(PUBLISH_TEMP_PREFIX)
        .suffix(PUBLISH_TEMP_SUFFIX)
        .tempfile_in(&dir)
        .map_err(|e| StorageError::io(&dir, e))?;

    copy_pages(staging.conn(), temp.path())?;
    reached(PublishStep::Copied)?;

    finalize(temp.path(), config)?;
    verify(temp.path())?;
    reached(PublishStep::Finalized)?;

    temp.as_file()
        .sync_all()
        .map_err(|e| StorageError::io(temp.path(), e))?;
    reached(PublishStep::Synced)?;

    let seq = next_seq(bundle)?;
    let target = bundle.snapshot_path(seq);
    temp.persist_noclobber(&target)
        .map_err(|e| StorageError::io(&target, e.error))?;
    reached(PublishStep::Renamed)?;

    fsync_dir(&dir)?;
    reached(PublishStep::DirSynced)?;

    head::write_head(bundle.root(), &HeadDoc::now(seq))?;
    reached(PublishStep::HeadWritten)?;

    staging.set_source_seq(seq);
    let size = fs::metadata(&target).map_or(0, |m| m.len());
    tracing::info!(
        root = %bundle.root().display(),
        seq = %seq,
        size,
        elapsed_ms = start.elapsed().as_millis(),
        "published snapshot"
    );
    Ok(SnapshotRef {
        seq,
        path: target,
        size,
    })
}

/// Force the staging WAL into the main file and confirm it drained.
fn drain_wal(staging: &StagingStore, config: &PublishConfig) -> Result<()> {
    let attempts = config.checkpoint_attempts.max(1);
    let mut backoff = config.initial_backoff();
    let mut wal_bytes = 0;

    for attempt in 1..=attempts {
        let (busy, log, checkpointed): (i64, i64, i64) = staging
            .conn()
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .map_err(|e| StorageError::sqlite(staging.path(), e))?;
        wal_bytes = fs::metadata(staging.wal_path()).map_or(0, |m| m.len());

        if busy == 0 && checkpointed >= log && wal_bytes <= config.wal_threshold_bytes {
            tracing::debug!(attempt, "staging WAL drained");
            return Ok(());
        }

        tracing::debug!(
            attempt,
            busy,
            log,
            checkpointed,
            wal_bytes,
            "staging WAL checkpoint incomplete"
        );
        if attempt < attempts {
            thread::sleep(backoff);
            backoff = backoff.saturating_mul(2);
        }
    }

    tracing::warn!(attempts, wal_bytes, "giving up on staging WAL checkpoint");
    Err(StorageError::CheckpointIncomplete {
        attempts,
        wal_bytes,
    })
}

fn copy_pages(source: &Connection, dest: &Path) -> Result<()> {
    let mut conn = Connection::open(dest).map_err(|e| StorageError::sqlite(dest, e))?;
    {
        let backup = Backup::new(source, &mut conn).map_err(|e| StorageError::sqlite(dest, e))?;
        backup
            .run_to_completion(BACKUP_PAGES_PER_STEP, Duration::ZERO, None)
            .map_err(|e| StorageError::sqlite(dest, e))?;
    }
    conn.close().map_err(|(_, e)| StorageError::sqlite(dest, e))
}

fn finalize(path: &Path, config: &PublishConfig) -> Result<()> {
    let conn = Connection::open(path).map_err(|e| StorageError::sqlite(path, e))?;
    let run = || -> rusqlite::Result<()> {
        let _mode: String = conn.query_row("PRAGMA journal_mode = DELETE", [], |row| row.get(0))?;
        if config.compact {
            conn.execute_batch("VACUUM")?;
        }
        conn.execute_batch("PRAGMA optimize")?;
        Ok(())
    };
    run().map_err(|e| StorageError::sqlite(path, e))?;
    conn.close().map_err(|(_, e)| StorageError::sqlite(path, e))
}

/// Full integrity check of the file as it sits on disk.
fn verify(path: &Path) -> Result<()> {
    #[cfg(test)]
    {
        if faults::CORRUPT_TEMP.with(std::cell::Cell::get) {
            faults::corrupt(path);
        }
    }

    let failed = |detail: String| StorageError::IntegrityCheckFailed {
        path: path.to_path_buf(),
        detail,
    };
    let conn = db::open_read_only(path)?;
    match db::integrity_check(&conn) {
        Ok(None) => Ok(()),
        Ok(Some(detail)) => Err(failed(detail)),
        Err(e) if db::is_corruption(&e) => Err(failed(e.to_string())),
        Err(e) => Err(StorageError::sqlite(path, e)),
    }
}

/// One past the highest sequence on disk or named by HEAD.
fn next_seq(bundle: &Bundle) -> Result<SnapshotSeq> {
    let on_disk = bundle.max_seq()?;
    let named = head::read_head(&bundle.head_path()).ok().map(|h| h.current);
    Ok(on_disk
        .max(named)
        .map_or(SnapshotSeq::FIRST, SnapshotSeq::next))
}

fn reached(step: PublishStep) -> Result<()> {
    tracing::trace!(?step, "publish step complete");
    #[cfg(test)]
    {
        if faults::CRASH_AFTER.with(std::cell::Cell::get) == Some(step) {
            return Err(StorageError::io(
                "<simulated crash>",
                std::io::Error::new(std::io::ErrorKind::Interrupted, format!("{step:?}")),
            ));
        }
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StagingConfig;
    use crate::db::mutation::{Mutation, apply_all};
    use crate::db::query::{GetMeta, ListDatasets, Query};
    use crate::model::Dataset;
    use std::cell::Cell;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        bundle: Bundle,
        staging: StagingStore,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let bundle = Bundle::create(&dir.path().join("b.labpack")).unwrap();
        let config = StagingConfig {
            dir: Some(dir.path().join("staging")),
            ..StagingConfig::default()
        };
        let staging = StagingStore::seed(&bundle, SnapshotSeq::FIRST, "w", &config).unwrap();
        Fixture {
            _dir: dir,
            bundle,
            staging,
        }
    }

    fn edit(staging: &mut StagingStore, id: i64) {
        apply_all(
            staging.conn_mut(),
            &[Mutation::PutDataset(Dataset::new(id, format!("vessel {id}")))],
        )
        .unwrap();
    }

    fn current(bundle: &Bundle) -> SnapshotSeq {
        head::read_head(&bundle.head_path()).unwrap().current
    }

    fn no_temps(bundle: &Bundle) -> bool {
        bundle.publish_temps().unwrap().is_empty()
    }

    #[test]
    fn publish_creates_next_snapshot_and_moves_head() {
        let mut fx = fixture();
        edit(&mut fx.staging, 1);

        let published = publish(&fx.bundle, &mut fx.staging, &PublishConfig::default()).unwrap();
        assert_eq!(published.seq.get(), 2);
        assert_eq!(current(&fx.bundle), published.seq);
        assert_eq!(fx.staging.source_seq(), published.seq);
        assert!(no_temps(&fx.bundle));

        let conn = db::open_read_only(&published.path).unwrap();
        let mode: String = conn
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_ascii_lowercase(), "delete");
        assert_eq!(ListDatasets.run(&conn).unwrap().len(), 1);
        assert!(GetMeta("modified_utc".into()).run(&conn).unwrap().is_some());
    }

    #[test]
    fn staging_stays_usable_and_snapshots_stay_immutable() {
        let mut fx = fixture();
        edit(&mut fx.staging, 1);
        let first = publish(&fx.bundle, &mut fx.staging, &PublishConfig::default()).unwrap();
        let bytes = fs::read(&first.path).unwrap();

        edit(&mut fx.staging, 2);
        let compact = PublishConfig {
            compact: true,
            ..PublishConfig::default()
        };
        let second = publish(&fx.bundle, &mut fx.staging, &compact).unwrap();

        assert_eq!(second.seq, first.seq.next());
        assert_eq!(fs::read(&first.path).unwrap(), bytes);
        let conn = db::open_read_only(&second.path).unwrap();
        assert_eq!(ListDatasets.run(&conn).unwrap().len(), 2);
    }

    #[test]
    fn sequence_skips_past_orphans_beyond_head() {
        let mut fx = fixture();
        let orphan = fx.bundle.snapshot_path(SnapshotSeq::new(5).unwrap());
        fs::copy(fx.bundle.snapshot_path(SnapshotSeq::FIRST), &orphan).unwrap();
        let orphan_bytes = fs::read(&orphan).unwrap();

        let published = publish(&fx.bundle, &mut fx.staging, &PublishConfig::default()).unwrap();
        assert_eq!(published.seq.get(), 6);
        assert_eq!(fs::read(&orphan).unwrap(), orphan_bytes);
    }

    #[test]
    fn crash_at_any_step_leaves_head_on_a_valid_snapshot() {
        let steps = [
            PublishStep::Checkpointed,
            PublishStep::Copied,
            PublishStep::Finalized,
            PublishStep::Synced,
            PublishStep::Renamed,
            PublishStep::DirSynced,
            PublishStep::HeadWritten,
        ];
        for step in steps {
            let mut fx = fixture();
            edit(&mut fx.staging, 1);

            faults::CRASH_AFTER.with(|c| c.set(Some(step)));
            let result = publish(&fx.bundle, &mut fx.staging, &PublishConfig::default());
            faults::CRASH_AFTER.with(|c| c.set(None));
            assert!(result.is_err(), "{step:?}");

            let head = current(&fx.bundle);
            assert!(
                db::quick_check(&fx.bundle.snapshot_path(head)).is_ok(),
                "{step:?}: HEAD names an invalid snapshot"
            );
            let expected = if step == PublishStep::HeadWritten { 2 } else { 1 };
            assert_eq!(head.get(), expected, "{step:?}");

            // The next save still succeeds and lands past anything orphaned.
            let next = publish(&fx.bundle, &mut fx.staging, &PublishConfig::default()).unwrap();
            assert!(next.seq > head);
            assert_eq!(current(&fx.bundle), next.seq);
        }
    }

    #[test]
    fn corrupt_copy_is_never_published() {
        let mut fx = fixture();
        edit(&mut fx.staging, 1);
        let before = fx.bundle.list_snapshots().unwrap();

        faults::CORRUPT_TEMP.with(|c| c.set(true));
        let result = publish(&fx.bundle, &mut fx.staging, &PublishConfig::default());
        faults::CORRUPT_TEMP.with(|c| c.set(false));

        assert!(matches!(
            result,
            Err(StorageError::IntegrityCheckFailed { .. })
        ));
        assert_eq!(current(&fx.bundle), SnapshotSeq::FIRST);
        assert_eq!(fx.bundle.list_snapshots().unwrap(), before);
        assert!(no_temps(&fx.bundle));
    }

    #[test]
    fn pinned_reader_makes_checkpoint_incomplete() {
        let mut fx = fixture();
        edit(&mut fx.staging, 1);
        fx.staging
            .conn()
            .busy_timeout(Duration::from_millis(5))
            .unwrap();

        let reader = Connection::open(fx.staging.path()).unwrap();
        reader.execute_batch("BEGIN").unwrap();
        let _: i64 = reader
            .query_row("SELECT COUNT(*) FROM dataset", [], |row| row.get(0))
            .unwrap();
        edit(&mut fx.staging, 2);

        let config = PublishConfig {
            checkpoint_attempts: 2,
            checkpoint_backoff_ms: 1,
            ..PublishConfig::default()
        };
        let err = publish(&fx.bundle, &mut fx.staging, &config).unwrap_err();
        assert!(matches!(
            err,
            StorageError::CheckpointIncomplete { attempts: 2, .. }
        ));
        assert!(err.is_retryable());
        assert_eq!(current(&fx.bundle), SnapshotSeq::FIRST);

        reader.execute_batch("COMMIT").unwrap();
        assert!(publish(&fx.bundle, &mut fx.staging, &config).is_ok());
    }

    #[test]
    fn fault_flags_default_off() {
        assert_eq!(faults::CRASH_AFTER.with(Cell::get), None);
        assert!(!faults::CORRUPT_TEMP.with(Cell::get));
    }
}
