//! Private working copies of a snapshot.
//!
//! A staging store lives in a per-user cache directory, never inside the
//! (possibly synced) bundle. It is a byte copy of the seeding snapshot,
//! reopened in WAL mode and migrated to the latest schema. An fs2 lock on a
//! `.sqlite.lock` sidecar marks it as owned by a live session, which is how
//! the startup sweep tells orphans from active stores.

use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::config::StagingConfig;
use crate::db::{self, migrations};
use crate::durable::file_age;
use crate::error::{Result, StorageError};
use crate::layout::{Bundle, SnapshotSeq, remove_if_exists};
use crate::lock::FileGuard;

const STAGING_EXT: &str = "sqlite";
const SIDECAR_SUFFIX: &str = ".lock";
const JOURNAL_SUFFIXES: [&str; 2] = ["-wal", "-shm"];

/// Stable per-bundle prefix for staging file names.
#[must_use]
pub fn bundle_key(root: &Path) -> String {
    let canonical = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let hash = blake3::hash(canonical.as_os_str().as_encoded_bytes());
    hash.to_hex()[..16].to_string()
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

#[derive(Debug)]
pub struct StagingStore {
    conn: Connection,
    path: PathBuf,
    sidecar: FileGuard,
    source_seq: SnapshotSeq,
}

impl StagingStore {
    /// Copy snapshot `seq` of `bundle` into a fresh staging store owned by
    /// `owner`.
    ///
    /// # Errors
    ///
    /// I/O failures, [`StorageError::UnsupportedSchemaVersion`] for a
    /// snapshot written by a newer schema, or migration failures. No
    /// staging files are left behind on error.
    pub fn seed(
        bundle: &Bundle,
        seq: SnapshotSeq,
        owner: &str,
        config: &StagingConfig,
    ) -> Result<Self> {
        let start = Instant::now();
        let dir = config.resolved_dir();
        fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;

        let path = dir.join(format!(
            "{}-{owner}.{STAGING_EXT}",
            bundle_key(bundle.root())
        ));
        let sidecar_path = with_suffix(&path, SIDECAR_SUFFIX);
        let sidecar = FileGuard::try_exclusive(&sidecar_path)?.ok_or_else(|| {
            StorageError::io(
                &sidecar_path,
                std::io::Error::new(
                    std::io::ErrorKind::WouldBlock,
                    "staging store is owned by a live session",
                ),
            )
        })?;
        remove_store_files(&path)?;

        let source = bundle.snapshot_path(seq);
        match Self::open_copy(&source, &path) {
            Ok(conn) => {
                tracing::debug!(
                    path = %path.display(),
                    seq = %seq,
                    elapsed_ms = start.elapsed().as_millis(),
                    "seeded staging store"
                );
                Ok(Self {
                    conn,
                    path,
                    sidecar,
                    source_seq: seq,
                })
            }
            Err(error) => {
                let _ = remove_store_files(&path);
                drop(sidecar);
                let _ = fs::remove_file(&sidecar_path);
                Err(error)
            }
        }
    }

    fn open_copy(source: &Path, path: &Path) -> Result<Connection> {
        fs::copy(source, path).map_err(|e| StorageError::io(path, e))?;
        let mut conn = Connection::open(path).map_err(|e| StorageError::sqlite(path, e))?;
        db::configure_staging(&conn).map_err(|e| StorageError::sqlite(path, e))?;
        db::ensure_supported(&conn)?;
        migrations::migrate(&mut conn).map_err(|e| StorageError::sqlite(path, e))?;
        Ok(conn)
    }

    #[must_use]
    pub const fn conn(&self) -> &Connection {
        &self.conn
    }

    pub const fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn wal_path(&self) -> PathBuf {
        with_suffix(&self.path, "-wal")
    }

    /// Snapshot this store was seeded from or last published as.
    #[must_use]
    pub const fn source_seq(&self) -> SnapshotSeq {
        self.source_seq
    }

    pub(crate) const fn set_source_seq(&mut self, seq: SnapshotSeq) {
        self.source_seq = seq;
    }

    /// Close the connection and delete the store, its journal files and its
    /// sidecar.
    ///
    /// # Errors
    ///
    /// Filesystem failures while deleting; the session is over regardless.
    pub fn discard(self) -> Result<()> {
        let Self {
            conn,
            path,
            sidecar,
            ..
        } = self;
        if let Err((_, error)) = conn.close() {
            tracing::warn!(path = %path.display(), %error, "staging connection did not close cleanly");
        }
        remove_store_files(&path)?;
        let sidecar_path = sidecar.path().to_path_buf();
        drop(sidecar);
        remove_if_exists(&sidecar_path)?;
        tracing::debug!(path = %path.display(), "discarded staging store");
        Ok(())
    }
}

fn remove_store_files(path: &Path) -> Result<()> {
    for suffix in JOURNAL_SUFFIXES {
        remove_if_exists(&with_suffix(path, suffix))?;
    }
    remove_if_exists(path)?;
    Ok(())
}

/// Staging files removed by [`sweep_orphans`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: Vec<PathBuf>,
    pub skipped_live: usize,
}

/// Remove staging stores left behind by crashed sessions.
///
/// A store is an orphan when it is at least `stale_after` old and its
/// sidecar lock can be taken. A missing `dir` is not an error.
///
/// # Errors
///
/// Returns an I/O error if `dir` exists but cannot be listed.
pub fn sweep_orphans(dir: &Path, stale_after: Duration) -> Result<SweepReport> {
    let mut report = SweepReport::default();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
        Err(e) => return Err(StorageError::io(dir, e)),
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(STAGING_EXT) {
            continue;
        }
        if file_age(&path).is_none_or(|age| age < stale_after) {
            continue;
        }

        let sidecar_path = with_suffix(&path, SIDECAR_SUFFIX);
        let Some(guard) = FileGuard::try_exclusive(&sidecar_path)? else {
            report.skipped_live += 1;
            continue;
        };
        if let Err(error) = remove_store_files(&path) {
            tracing::warn!(path = %path.display(), %error, "failed to remove orphaned staging store");
            continue;
        }
        drop(guard);
        let _ = remove_if_exists(&sidecar_path);
        tracing::info!(path = %path.display(), "removed orphaned staging store");
        report.removed.push(path);
    }
    Ok(report)
}
