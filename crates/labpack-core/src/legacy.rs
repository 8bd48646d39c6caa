//! Conversion of single-file projects into bundles, and back.
//!
//! A legacy project is one SQLite file carrying the `dataset` and `event`
//! tables. Migration copies its bytes verbatim into `snapshots/000001.sqlite`
//! of a freshly built bundle, records where it came from in `meta.json`,
//! then renames the source to a timestamped `.legacy` backup next to it.
//! The source bytes are never modified.

use rusqlite::backup::Backup;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::db::{self, migrations, schema};
use crate::durable::{atomic_write_json, fsync_dir, unix_now};
use crate::error::{Result, StorageError};
use crate::head::{self, HeadDoc};
use crate::layout::{
    Bundle, BundleMeta, META_FILE, Provenance, SNAPSHOT_DIR, SnapshotSeq, parent_dir,
    remove_if_exists,
};
use crate::recovery::{self, RecoveryMode};

/// Extension given to bundles derived from a legacy file.
pub const BUNDLE_EXT: &str = "labpack";

/// Extension of the renamed source file.
pub const BACKUP_EXT: &str = "legacy";

const COPY_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyFormat {
    /// Project tables present but `user_version` never set.
    Unversioned,
    V1,
    V2,
}

impl LegacyFormat {
    const fn from_user_version(version: u32) -> Option<Self> {
        match version {
            0 => Some(Self::Unversioned),
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            _ => None,
        }
    }

    /// Tag recorded in migration provenance.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Unversioned => "sqlite-unversioned",
            Self::V1 => "sqlite-v1",
            Self::V2 => "sqlite-v2",
        }
    }

    #[must_use]
    pub const fn schema_version(self) -> u32 {
        match self {
            Self::Unversioned => 0,
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }
}

impl fmt::Display for LegacyFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrateOptions {
    /// Bundle location. Defaults to [`derived_bundle_path`].
    pub target: Option<PathBuf>,
    /// Run the full `PRAGMA integrity_check` on the copied bytes.
    pub verify_integrity: bool,
}

impl Default for MigrateOptions {
    fn default() -> Self {
        Self {
            target: None,
            verify_integrity: true,
        }
    }
}

/// `study.db` → `study.labpack`
#[must_use]
pub fn derived_bundle_path(source: &Path) -> PathBuf {
    source.with_extension(BUNDLE_EXT)
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// Identify a legacy single-file project without modifying it.
///
/// # Errors
///
/// [`StorageError::UnknownLegacyFormat`] for anything that is not a SQLite
/// file with the project tables at a known `user_version`, including
/// directories and missing paths.
pub fn detect(path: &Path) -> Result<LegacyFormat> {
    let unknown = || StorageError::UnknownLegacyFormat(path.to_path_buf());
    if !path.is_file() || !db::has_sqlite_header(path) {
        return Err(unknown());
    }
    let conn = open_immutable(path).map_err(|_| unknown())?;
    classify(&conn).ok().flatten().ok_or_else(unknown)
}

fn classify(conn: &Connection) -> rusqlite::Result<Option<LegacyFormat>> {
    for table in schema::LEGACY_SIGNATURE_TABLES {
        if !migrations::table_exists(conn, table)? {
            return Ok(None);
        }
    }
    let version = migrations::current_schema_version(conn)?;
    Ok(LegacyFormat::from_user_version(version))
}

/// Read-only open that creates no `-wal`/`-shm` siblings next to the file.
fn open_immutable(path: &Path) -> rusqlite::Result<Connection> {
    let raw = path.to_string_lossy();
    let mut uri = String::with_capacity(raw.len() + 24);
    uri.push_str("file:");
    for ch in raw.chars() {
        match ch {
            '%' => uri.push_str("%25"),
            '?' => uri.push_str("%3f"),
            '#' => uri.push_str("%23"),
            _ => uri.push(ch),
        }
    }
    uri.push_str("?immutable=1");
    Connection::open_with_flags(
        uri,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
}

// ---------------------------------------------------------------------------
// Migration
// ---------------------------------------------------------------------------

/// What the copied source turned out to be.
struct Inspected {
    format: LegacyFormat,
    created_utc: Option<String>,
    modified_utc: Option<String>,
}

/// Convert `source` into a bundle and return the bundle path.
///
/// Idempotent: a bundle path, or a source whose bundle already exists with
/// matching provenance, is verified and returned without copying anything.
/// A crash between installing the bundle and renaming the source is
/// finished on the next call.
///
/// # Errors
///
/// - [`StorageError::UnknownLegacyFormat`] when `source` is not a project
/// - [`StorageError::IntegrityCheckFailed`] when the copied bytes are damaged
///   or the source still has an uncheckpointed `-wal`
/// - [`StorageError::AlreadyExists`] when the target exists but was not
///   migrated from `source`
/// - [`StorageError::NotFound`] when neither source nor bundle exist
///
/// On error the source is untouched and no bundle is left at the target.
pub fn migrate(source: &Path, options: &MigrateOptions) -> Result<PathBuf> {
    if Bundle::is_bundle(source) {
        verify(&Bundle::open(source)?)?;
        return Ok(source.to_path_buf());
    }

    let target = options
        .target
        .clone()
        .unwrap_or_else(|| derived_bundle_path(source));
    let source_abs = std::path::absolute(source).map_err(|e| StorageError::io(source, e))?;

    if fs::symlink_metadata(&target).is_ok() {
        return resume(&source_abs, &target);
    }
    if !source.is_file() {
        return Err(StorageError::NotFound(source.to_path_buf()));
    }
    if !db::has_sqlite_header(source) {
        return Err(StorageError::UnknownLegacyFormat(source.to_path_buf()));
    }
    reject_pending_wal(source)?;

    let parent = parent_dir(&target);
    fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
    let staged = tempfile::Builder::new()
        .prefix(".labpack-migrate-")
        .tempdir_in(parent)
        .map_err(|e| StorageError::io(parent, e))?;

    let snapshots = staged.path().join(SNAPSHOT_DIR);
    fs::create_dir(&snapshots).map_err(|e| StorageError::io(&snapshots, e))?;
    let first = snapshots.join(SnapshotSeq::FIRST.file_name());

    let source_hash = copy_hashed(source, &first)?;
    let inspected = inspect_copy(source, &first, options.verify_integrity)?;
    for suffix in ["-wal", "-shm"] {
        remove_if_exists(&with_suffix(&first, suffix))?;
    }
    fsync_dir(&snapshots)?;
    let snapshot_hash = hash_file(&first)?;

    let source_modified_ts = inspected
        .modified_utc
        .as_deref()
        .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
        .map(|at| at.timestamp())
        .or_else(|| file_mtime(source));

    let mut meta = BundleMeta::new(inspected.format.schema_version());
    meta.migrated_from = Some(Provenance {
        source: source_abs.clone(),
        format: inspected.format.tag().to_string(),
        blake3: source_hash,
        snapshot_blake3: snapshot_hash,
        source_created_utc: inspected.created_utc,
        source_modified_ts,
        migrated_ts: unix_now(),
        backup: None,
    });
    atomic_write_json(&staged.path().join(META_FILE), &meta)?;
    head::write_head(staged.path(), &HeadDoc::now(SnapshotSeq::FIRST))?;

    Bundle::install(staged, &target)?;
    tracing::info!(
        source = %source.display(),
        bundle = %target.display(),
        format = %inspected.format,
        "migrated legacy project"
    );

    let bundle = Bundle::open(&target)?;
    retire_source(&bundle, &source_abs, meta);
    Ok(target)
}

/// The target already exists: accept it only if it was migrated from
/// `source`, and finish the source rename if a crash interrupted it.
fn resume(source: &Path, target: &Path) -> Result<PathBuf> {
    let bundle = Bundle::open(target)
        .map_err(|_| StorageError::AlreadyExists(target.to_path_buf()))?;
    let meta = bundle.meta_or_default();
    let Some(provenance) = meta.migrated_from.as_ref() else {
        return Err(StorageError::AlreadyExists(target.to_path_buf()));
    };
    if provenance.source != source {
        return Err(StorageError::AlreadyExists(target.to_path_buf()));
    }
    verify(&bundle)?;

    if provenance.backup.is_none() && source.is_file() {
        if hash_file(source)? == provenance.blake3 {
            retire_source(&bundle, source, meta);
        } else {
            tracing::warn!(
                source = %source.display(),
                "legacy file changed after migration; leaving it in place"
            );
        }
    }
    tracing::debug!(bundle = %target.display(), "legacy project already migrated");
    Ok(target.to_path_buf())
}

/// Rename the source to its backup name and record it. A failure here is
/// logged; the bundle is complete either way.
fn retire_source(bundle: &Bundle, source: &Path, mut meta: BundleMeta) {
    let backup = backup_path(source);
    if let Err(error) = fs::rename(source, &backup) {
        tracing::warn!(source = %source.display(), %error, "could not rename legacy file");
        return;
    }
    if let Err(error) = fsync_dir(parent_dir(source)) {
        tracing::warn!(dir = %parent_dir(source).display(), %error, "could not sync legacy backup rename");
    }
    if let Some(provenance) = meta.migrated_from.as_mut() {
        provenance.backup = Some(backup.clone());
    }
    if let Err(error) = bundle.save_meta(&meta) {
        tracing::warn!(%error, "could not record legacy backup path");
    }
    tracing::info!(backup = %backup.display(), "kept legacy file as backup");
}

/// `<name>.<YYYYmmddTHHMMSSZ>.legacy`, with a counter on collision.
fn backup_path(source: &Path) -> PathBuf {
    let name = source
        .file_name()
        .map_or_else(|| "project".into(), |n| n.to_string_lossy().into_owned());
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
    let dir = parent_dir(source);
    let mut candidate = dir.join(format!("{name}.{stamp}.{BACKUP_EXT}"));
    let mut n = 1;
    while fs::symlink_metadata(&candidate).is_ok() {
        candidate = dir.join(format!("{name}.{stamp}-{n}.{BACKUP_EXT}"));
        n += 1;
    }
    candidate
}

fn reject_pending_wal(source: &Path) -> Result<()> {
    let wal = with_suffix(source, "-wal");
    match fs::metadata(&wal) {
        Ok(meta) if meta.len() > 0 => Err(StorageError::IntegrityCheckFailed {
            path: source.to_path_buf(),
            detail: format!(
                "{} holds uncheckpointed writes; open the project once with the application that wrote it",
                wal.display()
            ),
        }),
        _ => Ok(()),
    }
}

/// Copy `from` to a new file `to`, returning the blake3 of the bytes copied.
fn copy_hashed(from: &Path, to: &Path) -> Result<String> {
    let mut reader = File::open(from).map_err(|e| StorageError::io(from, e))?;
    let mut writer = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(to)
        .map_err(|e| StorageError::io(to, e))?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0_u8; COPY_CHUNK];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(StorageError::io(from, e)),
        };
        hasher.update(&buf[..n]);
        writer
            .write_all(&buf[..n])
            .map_err(|e| StorageError::io(to, e))?;
    }
    writer.sync_all().map_err(|e| StorageError::io(to, e))?;
    Ok(hasher.finalize().to_hex().to_string())
}

fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| StorageError::io(path, e))?;
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut file, &mut hasher).map_err(|e| StorageError::io(path, e))?;
    Ok(hasher.finalize().to_hex().to_string())
}

fn file_mtime(path: &Path) -> Option<i64> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    let at: chrono::DateTime<chrono::Utc> = modified.into();
    Some(at.timestamp())
}

/// Classify and check the private copy, switching it out of WAL mode so the
/// snapshot is self-contained. Errors name `source`, not the copy.
fn inspect_copy(source: &Path, copy: &Path, verify_integrity: bool) -> Result<Inspected> {
    let unknown = || StorageError::UnknownLegacyFormat(source.to_path_buf());
    let damaged = |detail: String| StorageError::IntegrityCheckFailed {
        path: source.to_path_buf(),
        detail,
    };
    let conn = Connection::open(copy).map_err(|_| unknown())?;

    if verify_integrity {
        match db::integrity_check(&conn) {
            Ok(None) => {}
            Ok(Some(detail)) => return Err(damaged(detail)),
            Err(e) if db::is_corruption(&e) => return Err(damaged(e.to_string())),
            Err(_) => return Err(unknown()),
        }
    }

    let format = match classify(&conn) {
        Ok(Some(format)) => format,
        Ok(None) => return Err(unknown()),
        Err(e) if db::is_corruption(&e) => return Err(damaged(e.to_string())),
        Err(_) => return Err(unknown()),
    };

    let read_meta = |key: &str| -> rusqlite::Result<Option<String>> {
        if !migrations::table_exists(&conn, "meta")? {
            return Ok(None);
        }
        conn.query_row("SELECT value FROM meta WHERE key = ?1", [key], |row| row.get(0))
            .optional()
    };
    let created_utc = read_meta("created_utc").unwrap_or_else(|error| {
        tracing::warn!(%error, "could not read legacy created_utc");
        None
    });
    let modified_utc = read_meta("modified_utc").unwrap_or_else(|error| {
        tracing::warn!(%error, "could not read legacy modified_utc");
        None
    });

    let mode: String = conn
        .query_row("PRAGMA journal_mode", [], |row| row.get(0))
        .map_err(|e| StorageError::sqlite(copy, e))?;
    if !mode.eq_ignore_ascii_case("delete") {
        let _mode: String = conn
            .query_row("PRAGMA journal_mode = DELETE", [], |row| row.get(0))
            .map_err(|e| StorageError::sqlite(copy, e))?;
        tracing::debug!(from = %mode, "switched migrated snapshot to rollback journal");
    }
    conn.close().map_err(|(_, e)| StorageError::sqlite(copy, e))?;

    Ok(Inspected {
        format,
        created_utc,
        modified_utc,
    })
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Check that a bundle resolves to a valid snapshot and, for a migrated
/// bundle whose `000001` is still present, that it is the file migration
/// published.
///
/// # Errors
///
/// [`StorageError::UnrecoverableBundle`] when nothing validates, or
/// [`StorageError::IntegrityCheckFailed`] when `000001` does not match its
/// recorded fingerprint.
pub fn verify(bundle: &Bundle) -> Result<()> {
    recovery::recover(bundle, RecoveryMode::Inspect)?;

    let Some(provenance) = bundle.meta_or_default().migrated_from else {
        return Ok(());
    };
    let first = bundle.snapshot_path(SnapshotSeq::FIRST);
    if !first.is_file() {
        return Ok(());
    }
    let failed = |detail: String| StorageError::IntegrityCheckFailed {
        path: first.clone(),
        detail,
    };
    db::quick_check(&first).map_err(failed)?;
    if hash_file(&first)? != provenance.snapshot_blake3 {
        return Err(failed(
            "contents differ from the migrated fingerprint".to_string(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

/// Write the bundle's current snapshot to `out` as a standalone project
/// file in rollback-journal mode.
///
/// # Errors
///
/// [`StorageError::AlreadyExists`] if `out` exists, recovery errors if the
/// bundle has no valid snapshot, otherwise I/O and SQLite failures. `out`
/// is either absent or complete.
pub fn export_legacy(bundle: &Bundle, out: &Path) -> Result<PathBuf> {
    if fs::symlink_metadata(out).is_ok() {
        return Err(StorageError::AlreadyExists(out.to_path_buf()));
    }
    let report = recovery::recover(bundle, RecoveryMode::Inspect)?;
    let snapshot = bundle.snapshot_path(report.current());
    let source = db::open_read_only(&snapshot)?;

    let dir = parent_dir(out);
    fs::create_dir_all(dir).map_err(|e| StorageError::io(dir, e))?;
    let temp = tempfile::Builder::new()
        .prefix(".labpack-export-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| StorageError::io(dir, e))?;

    let mut dest = Connection::open(temp.path()).map_err(|e| StorageError::sqlite(temp.path(), e))?;
    {
        let backup =
            Backup::new(&source, &mut dest).map_err(|e| StorageError::sqlite(temp.path(), e))?;
        backup
            .run_to_completion(256, Duration::ZERO, None)
            .map_err(|e| StorageError::sqlite(temp.path(), e))?;
    }
    let stamp = |conn: &Connection| -> rusqlite::Result<()> {
        let _mode: String = conn.query_row("PRAGMA journal_mode = DELETE", [], |row| row.get(0))?;
        if migrations::table_exists(conn, "meta")? {
            conn.execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES ('exported_from', ?1), ('exported_utc', ?2)",
                [
                    bundle.root().display().to_string(),
                    chrono::Utc::now().to_rfc3339(),
                ],
            )?;
        }
        Ok(())
    };
    stamp(&dest).map_err(|e| StorageError::sqlite(temp.path(), e))?;
    dest.close()
        .map_err(|(_, e)| StorageError::sqlite(temp.path(), e))?;

    temp.as_file()
        .sync_all()
        .map_err(|e| StorageError::io(temp.path(), e))?;
    temp.persist_noclobber(out).map_err(|e| {
        if e.error.kind() == io::ErrorKind::AlreadyExists {
            StorageError::AlreadyExists(out.to_path_buf())
        } else {
            StorageError::io(out, e.error)
        }
    })?;
    fsync_dir(dir)?;

    tracing::info!(
        bundle = %bundle.root().display(),
        seq = %report.current(),
        out = %out.display(),
        "exported current snapshot"
    );
    Ok(out.to_path_buf())
}
