//! On-disk bundle contract.
//!
//! ```text
//! <root>/
//!   HEAD.json              current snapshot pointer
//!   meta.json              bundle metadata, milestones, migration provenance
//!   snapshots/NNNNNN.sqlite
//!   .lock                  writer lock marker
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::db;
use crate::db::migrations::LATEST_SCHEMA_VERSION;
use crate::durable::{atomic_write_json, fsync_dir, fsync_file, read_json, unix_now};
use crate::error::{Result, StorageError};
use crate::head::{self, HeadDoc};

pub const HEAD_FILE: &str = "HEAD.json";
pub const META_FILE: &str = "meta.json";
pub const LOCK_FILE: &str = ".lock";
pub const SNAPSHOT_DIR: &str = "snapshots";
pub const SNAPSHOT_EXT: &str = "sqlite";

/// Prefix of in-flight publish temp files inside `snapshots/`.
pub const PUBLISH_TEMP_PREFIX: &str = ".publish-";
pub const PUBLISH_TEMP_SUFFIX: &str = ".tmp";

/// Format tag written to `meta.json`.
pub const BUNDLE_FORMAT: &str = "labpack-bundle-v1";

const SEQ_WIDTH: usize = 6;

// ---------------------------------------------------------------------------
// SnapshotSeq
// ---------------------------------------------------------------------------

/// Snapshot sequence number. Always `>= 1`; rendered zero-padded to six
/// digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotSeq(u32);

impl SnapshotSeq {
    pub const FIRST: Self = Self(1);

    #[must_use]
    pub const fn new(n: u32) -> Option<Self> {
        if n == 0 { None } else { Some(Self(n)) }
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// `NNNNNN.sqlite`
    #[must_use]
    pub fn file_name(self) -> String {
        format!("{self}.{SNAPSHOT_EXT}")
    }

    /// Parse a snapshot file name. Anything that is not exactly digits plus
    /// the snapshot extension (conflict copies, temp files) yields `None`.
    #[must_use]
    pub fn from_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(SNAPSHOT_EXT)?.strip_suffix('.')?;
        if stem.len() < SEQ_WIDTH {
            return None;
        }
        stem.parse().ok()
    }
}

impl fmt::Display for SnapshotSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$}", self.0, width = SEQ_WIDTH)
    }
}

impl FromStr for SnapshotSeq {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("not a snapshot sequence: {s:?}"));
        }
        let n: u32 = s.parse().map_err(|e| format!("{s:?}: {e}"))?;
        Self::new(n).ok_or_else(|| "snapshot sequence must be >= 1".to_string())
    }
}

impl Serialize for SnapshotSeq {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SnapshotSeq {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A snapshot file present on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRef {
    pub seq: SnapshotSeq,
    pub path: PathBuf,
    pub size: u64,
}

// ---------------------------------------------------------------------------
// BundleMeta
// ---------------------------------------------------------------------------

/// Where a migrated bundle came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: PathBuf,
    pub format: String,
    /// blake3 of the source bytes, hex.
    pub blake3: String,
    /// blake3 of `000001` as published. Differs from `blake3` only when the
    /// source had to be switched out of WAL mode.
    pub snapshot_blake3: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_created_utc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_modified_ts: Option<i64>,
    pub migrated_ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleMeta {
    pub format: String,
    pub schema_version: u32,
    pub created_ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrated_from: Option<Provenance>,
    /// Snapshots protected from pruning, with a user label.
    #[serde(default)]
    pub milestones: BTreeMap<SnapshotSeq, String>,
}

impl BundleMeta {
    #[must_use]
    pub fn new(schema_version: u32) -> Self {
        Self {
            format: BUNDLE_FORMAT.to_string(),
            schema_version,
            created_ts: unix_now(),
            migrated_from: None,
            milestones: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

/// Summary of a bundle's on-disk state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleInfo {
    pub snapshot_count: usize,
    pub total_bytes: u64,
    pub current: Option<SnapshotSeq>,
    pub modified_ts: Option<i64>,
    /// Sync client whose folder holds the bundle, if any.
    pub synced_by: Option<SyncService>,
}

/// Handle to a bundle directory. Cheap to clone; holds no open files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    root: PathBuf,
}

impl Bundle {
    /// Create a new bundle with snapshot `000001` holding an empty schema.
    ///
    /// The bundle is assembled in a hidden sibling directory and renamed
    /// into place, so `root` either does not exist or is complete.
    ///
    /// # Errors
    ///
    /// [`StorageError::AlreadyExists`] if `root` exists, otherwise I/O and
    /// SQLite failures.
    pub fn create(root: &Path) -> Result<Self> {
        if fs::symlink_metadata(root).is_ok() {
            return Err(StorageError::AlreadyExists(root.to_path_buf()));
        }
        let parent = parent_dir(root);
        fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;

        let staged = tempfile::Builder::new()
            .prefix(".labpack-create-")
            .tempdir_in(parent)
            .map_err(|e| StorageError::io(parent, e))?;

        let snapshots = staged.path().join(SNAPSHOT_DIR);
        fs::create_dir(&snapshots).map_err(|e| StorageError::io(&snapshots, e))?;

        let first = snapshots.join(SnapshotSeq::FIRST.file_name());
        db::create_empty_database(&first)?;
        fsync_file(&first)?;
        fsync_dir(&snapshots)?;

        atomic_write_json(
            &staged.path().join(META_FILE),
            &BundleMeta::new(LATEST_SCHEMA_VERSION),
        )?;
        head::write_head(staged.path(), &HeadDoc::now(SnapshotSeq::FIRST))?;

        Self::install(staged, root)?;
        tracing::info!(root = %root.display(), "created bundle");
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Rename a fully built bundle directory to `root`.
    pub(crate) fn install(staged: tempfile::TempDir, root: &Path) -> Result<()> {
        if fs::symlink_metadata(root).is_ok() {
            return Err(StorageError::AlreadyExists(root.to_path_buf()));
        }
        fs::rename(staged.path(), root).map_err(|e| StorageError::io(root, e))?;
        // The temp path no longer exists; dropping the guard is a no-op.
        drop(staged);
        fsync_dir(parent_dir(root))
    }

    /// Open an existing bundle. Degraded contents (missing HEAD, no
    /// snapshots) are left for recovery to resolve.
    ///
    /// # Errors
    ///
    /// [`StorageError::NotFound`] if `root` has no `snapshots/` directory.
    pub fn open(root: &Path) -> Result<Self> {
        if !root.join(SNAPSHOT_DIR).is_dir() {
            return Err(StorageError::NotFound(root.to_path_buf()));
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Whether `path` looks like a bundle root.
    #[must_use]
    pub fn is_bundle(path: &Path) -> bool {
        path.join(SNAPSHOT_DIR).is_dir()
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join(SNAPSHOT_DIR)
    }

    #[must_use]
    pub fn head_path(&self) -> PathBuf {
        self.root.join(HEAD_FILE)
    }

    #[must_use]
    pub fn meta_path(&self) -> PathBuf {
        self.root.join(META_FILE)
    }

    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    #[must_use]
    pub fn snapshot_path(&self, seq: SnapshotSeq) -> PathBuf {
        self.snapshots_dir().join(seq.file_name())
    }

    /// Snapshot files in ascending sequence order.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if `snapshots/` cannot be listed.
    pub fn list_snapshots(&self) -> Result<Vec<SnapshotRef>> {
        let dir = self.snapshots_dir();
        let entries = fs::read_dir(&dir).map_err(|e| StorageError::io(&dir, e))?;

        let mut snapshots = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(&dir, e))?;
            let Some(seq) = entry.file_name().to_str().and_then(SnapshotSeq::from_file_name)
            else {
                continue;
            };
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            snapshots.push(SnapshotRef {
                seq,
                path: entry.path(),
                size: meta.len(),
            });
        }
        snapshots.sort_by_key(|s| s.seq);
        Ok(snapshots)
    }

    /// Highest sequence present on disk.
    ///
    /// # Errors
    ///
    /// Same as [`Self::list_snapshots`].
    pub fn max_seq(&self) -> Result<Option<SnapshotSeq>> {
        Ok(self.list_snapshots()?.last().map(|s| s.seq))
    }

    /// Abandoned or in-flight publish temp files in `snapshots/`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if `snapshots/` cannot be listed.
    pub fn publish_temps(&self) -> Result<Vec<PathBuf>> {
        let dir = self.snapshots_dir();
        let entries = fs::read_dir(&dir).map_err(|e| StorageError::io(&dir, e))?;
        Ok(entries
            .flatten()
            .filter(|entry| {
                entry.file_name().to_str().is_some_and(|name| {
                    name.starts_with(PUBLISH_TEMP_PREFIX) && name.ends_with(PUBLISH_TEMP_SUFFIX)
                })
            })
            .map(|entry| entry.path())
            .collect())
    }

    /// Load `meta.json`; a missing document yields `None`.
    ///
    /// # Errors
    ///
    /// I/O errors or [`StorageError::Json`] for a malformed document.
    pub fn load_meta(&self) -> Result<Option<BundleMeta>> {
        let path = self.meta_path();
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    /// Load `meta.json`, substituting fresh metadata when it is missing or
    /// unreadable. Used wherever metadata is advisory.
    #[must_use]
    pub fn meta_or_default(&self) -> BundleMeta {
        match self.load_meta() {
            Ok(Some(meta)) => meta,
            Ok(None) => BundleMeta::new(LATEST_SCHEMA_VERSION),
            Err(error) => {
                tracing::warn!(root = %self.root.display(), %error, "ignoring unreadable meta.json");
                BundleMeta::new(LATEST_SCHEMA_VERSION)
            }
        }
    }

    /// Atomically replace `meta.json`.
    ///
    /// # Errors
    ///
    /// Same as [`crate::durable::atomic_write`].
    pub fn save_meta(&self, meta: &BundleMeta) -> Result<()> {
        atomic_write_json(&self.meta_path(), meta)
    }

    /// Snapshot count, size and current pointer.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if `snapshots/` cannot be listed.
    pub fn info(&self) -> Result<BundleInfo> {
        let snapshots = self.list_snapshots()?;
        let head = head::read_head(&self.head_path()).ok();
        Ok(BundleInfo {
            snapshot_count: snapshots.len(),
            total_bytes: snapshots.iter().map(|s| s.size).sum(),
            current: head.as_ref().map(|h| h.current),
            modified_ts: head.map(|h| h.ts),
            synced_by: sync_service(&self.root),
        })
    }
}

// ---------------------------------------------------------------------------
// Cloud sync detection
// ---------------------------------------------------------------------------

/// File-sync clients recognized from their folder names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncService {
    ICloud,
    Dropbox,
    OneDrive,
    GoogleDrive,
    Box,
}

impl fmt::Display for SyncService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ICloud => "iCloud Drive",
            Self::Dropbox => "Dropbox",
            Self::OneDrive => "OneDrive",
            Self::GoogleDrive => "Google Drive",
            Self::Box => "Box",
        })
    }
}

/// The sync client whose folder contains `path`, judged by path components
/// alone. Covers the classic home-folder locations and the macOS
/// `Library/CloudStorage` provider folders (`Dropbox`, `OneDrive-Org`,
/// `GoogleDrive-user@example.com`, ...).
#[must_use]
pub fn sync_service(path: &Path) -> Option<SyncService> {
    path.components().find_map(|component| {
        let name = component.as_os_str().to_str()?;
        if name == "Mobile Documents" || name == "iCloud Drive" || name == "iCloudDrive" {
            Some(SyncService::ICloud)
        } else if name.starts_with("Dropbox") {
            Some(SyncService::Dropbox)
        } else if name.starts_with("OneDrive") {
            Some(SyncService::OneDrive)
        } else if name.starts_with("GoogleDrive") || name == "Google Drive" || name == "My Drive" {
            Some(SyncService::GoogleDrive)
        } else if name == "Box" || name == "Box Sync" || name.starts_with("Box-") {
            Some(SyncService::Box)
        } else {
            None
        }
    })
}

pub(crate) fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Remove a file, treating "already gone" as success.
pub(crate) fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StorageError::io(path, e)),
    }
}
