//! Single-file container form of a bundle.
//!
//! A container is a ZIP archive with every entry stored uncompressed under
//! `bundle/`: `HEAD.json`, `meta.json` and the `snapshots/` files. Sync
//! clients see one file that changes whole on each save instead of a
//! directory whose members arrive in arbitrary order.
//!
//! Editing happens on an unpacked copy in the staging directory. Each copy
//! is guarded by an fs2 sidecar lock so [`sweep_unpacked`] can tell a live
//! copy from one left behind by a crash. Writing a container always goes
//! through a temp file in the target's directory: [`pack`] refuses to
//! replace an existing file, [`repack`] replaces it atomically.

use std::fs::{self, File};
use std::io::{self, Read, Seek, Write};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use tempfile::{NamedTempFile, TempDir};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::durable::{file_age, fsync_dir};
use crate::error::{Result, StorageError};
use crate::head::{self, HeadDoc};
use crate::layout::{
    Bundle, HEAD_FILE, LOCK_FILE, META_FILE, PUBLISH_TEMP_PREFIX, SNAPSHOT_DIR, SnapshotSeq,
    parent_dir, remove_if_exists,
};
use crate::lock::FileGuard;
use crate::recovery::{self, RecoveryMode};

/// File extension of a container.
pub const CONTAINER_EXT: &str = "labpackz";

/// Directory every archive entry lives under.
const ARCHIVE_ROOT: &str = "bundle";

const ZIP_MAGIC: &[u8; 4] = b"PK\x03\x04";

/// Prefix of unpacked working copies in the staging directory.
pub const UNPACK_PREFIX: &str = "labpack-container-";

const SIDECAR_SUFFIX: &str = ".lock";

const PACK_TEMP_PREFIX: &str = ".labpack-pack-";
const PACK_TEMP_SUFFIX: &str = ".tmp";

/// Entries at or above this size need ZIP64 records.
const ZIP64_THRESHOLD: u64 = 0xFFFF_FFFF;

fn zip_error(path: &Path, error: zip::result::ZipError) -> StorageError {
    StorageError::io(path, io::Error::new(io::ErrorKind::InvalidData, error))
}

fn entry_name(relative: &str) -> String {
    format!("{ARCHIVE_ROOT}/{relative}")
}

/// Whether `path` is a container: a ZIP file carrying `bundle/HEAD.json`
/// and `bundle/meta.json`.
#[must_use]
pub fn is_container(path: &Path) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let mut magic = [0u8; 4];
    if file.read_exact(&mut magic).is_err() || magic != *ZIP_MAGIC {
        return false;
    }
    if file.rewind().is_err() {
        return false;
    }
    let Ok(archive) = ZipArchive::new(file) else {
        return false;
    };
    let names: Vec<&str> = archive.file_names().collect();
    [HEAD_FILE, META_FILE]
        .iter()
        .all(|required| names.contains(&entry_name(required).as_str()))
}

// ---------------------------------------------------------------------------
// Pack
// ---------------------------------------------------------------------------

/// Write `bundle` to a new container at `target`.
///
/// # Errors
///
/// - [`StorageError::AlreadyExists`] if `target` exists
/// - [`StorageError::UnrecoverableBundle`] if no snapshot validates
/// - I/O failures; nothing is left at `target` on error
pub fn pack(bundle: &Bundle, target: &Path) -> Result<()> {
    if fs::symlink_metadata(target).is_ok() {
        return Err(StorageError::AlreadyExists(target.to_path_buf()));
    }
    let temp = write_archive(bundle, target)?;
    temp.persist_noclobber(target).map_err(|e| {
        if e.error.kind() == io::ErrorKind::AlreadyExists {
            StorageError::AlreadyExists(target.to_path_buf())
        } else {
            StorageError::io(target, e.error)
        }
    })?;
    fsync_dir(parent_dir(target))?;
    tracing::info!(root = %bundle.root().display(), container = %target.display(), "packed bundle");
    Ok(())
}

/// Atomically replace the container at `target` with the current state of
/// `bundle`.
///
/// # Errors
///
/// Same as [`pack`], minus the existence check. The previous container is
/// intact on error.
pub fn repack(bundle: &Bundle, target: &Path) -> Result<()> {
    let temp = write_archive(bundle, target)?;
    temp.persist(target)
        .map_err(|e| StorageError::io(target, e.error))?;
    fsync_dir(parent_dir(target))?;
    tracing::debug!(container = %target.display(), "repacked container");
    Ok(())
}

/// Build the archive in a synced temp file beside `target`.
fn write_archive(bundle: &Bundle, target: &Path) -> Result<NamedTempFile> {
    let report = recovery::recover(bundle, RecoveryMode::Inspect)?;
    let current = report.current();

    let dir = parent_dir(target);
    fs::create_dir_all(dir).map_err(|e| StorageError::io(dir, e))?;
    let mut temp = tempfile::Builder::new()
        .prefix(PACK_TEMP_PREFIX)
        .suffix(PACK_TEMP_SUFFIX)
        .tempfile_in(dir)
        .map_err(|e| StorageError::io(dir, e))?;
    let temp_path = temp.path().to_path_buf();

    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let mut zip = ZipWriter::new(temp.as_file_mut());

    let head = HeadDoc {
        current,
        ts: packed_head_ts(bundle, current),
    };
    let head_bytes = serde_json::to_vec_pretty(&head).map_err(|source| StorageError::Json {
        path: bundle.head_path(),
        source,
    })?;
    let meta_bytes =
        serde_json::to_vec_pretty(&bundle.meta_or_default()).map_err(|source| {
            StorageError::Json {
                path: bundle.meta_path(),
                source,
            }
        })?;
    for (name, bytes) in [(HEAD_FILE, &head_bytes), (META_FILE, &meta_bytes)] {
        zip.start_file(entry_name(name), stored)
            .map_err(|e| zip_error(&temp_path, e))?;
        zip.write_all(bytes).map_err(|e| StorageError::io(&temp_path, e))?;
    }

    for snapshot in bundle.list_snapshots()? {
        let mut source = match File::open(&snapshot.path) {
            Ok(file) => file,
            // Retention may remove an older snapshot while the archive is
            // being written; the current one is never a candidate.
            Err(e) if e.kind() == io::ErrorKind::NotFound && snapshot.seq != current => {
                tracing::debug!(seq = %snapshot.seq, "snapshot pruned while packing");
                continue;
            }
            Err(e) => return Err(StorageError::io(&snapshot.path, e)),
        };
        let name = entry_name(&format!("{SNAPSHOT_DIR}/{}", snapshot.seq.file_name()));
        zip.start_file(name, stored.large_file(snapshot.size >= ZIP64_THRESHOLD))
            .map_err(|e| zip_error(&temp_path, e))?;
        io::copy(&mut source, &mut zip).map_err(|e| StorageError::io(&snapshot.path, e))?;
    }
    zip.finish().map_err(|e| zip_error(&temp_path, e))?;

    temp.as_file()
        .sync_all()
        .map_err(|e| StorageError::io(&temp_path, e))?;
    Ok(temp)
}

/// Timestamp to carry into the packed HEAD: the on-disk one when it already
/// names `current`.
fn packed_head_ts(bundle: &Bundle, current: SnapshotSeq) -> i64 {
    head::read_head(&bundle.head_path())
        .ok()
        .filter(|doc| doc.current == current)
        .map_or_else(|| HeadDoc::now(current).ts, |doc| doc.ts)
}

// ---------------------------------------------------------------------------
// Unpack
// ---------------------------------------------------------------------------

/// A container extracted to a private working directory.
///
/// Dropping it removes the directory but leaves the sidecar file for the
/// next [`sweep_unpacked`]; [`Unpacked::discard`] removes both.
#[derive(Debug)]
pub struct Unpacked {
    dir: TempDir,
    bundle: Bundle,
    sidecar: FileGuard,
}

impl Unpacked {
    #[must_use]
    pub const fn bundle(&self) -> &Bundle {
        &self.bundle
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Remove the working copy and its sidecar.
    ///
    /// # Errors
    ///
    /// I/O failures while removing the directory.
    pub fn discard(self) -> Result<()> {
        let Self { dir, sidecar, .. } = self;
        let path = dir.path().to_path_buf();
        dir.close().map_err(|e| StorageError::io(&path, e))?;
        let sidecar_path = sidecar.path().to_path_buf();
        drop(sidecar);
        remove_if_exists(&sidecar_path)?;
        Ok(())
    }
}

/// Extract `container` into a fresh directory under `work_dir`.
///
/// Only regular files under `bundle/` are extracted. Entries that would
/// escape the working directory are rejected, and lock markers or publish
/// temps that a foreign writer may have packed are skipped.
///
/// # Errors
///
/// - [`StorageError::NotFound`] if `container` is not a container
/// - I/O failures; the partial working directory is removed on error
pub fn unpack(container: &Path, work_dir: &Path) -> Result<Unpacked> {
    if !is_container(container) {
        return Err(StorageError::NotFound(container.to_path_buf()));
    }
    fs::create_dir_all(work_dir).map_err(|e| StorageError::io(work_dir, e))?;
    let dir = tempfile::Builder::new()
        .prefix(UNPACK_PREFIX)
        .tempdir_in(work_dir)
        .map_err(|e| StorageError::io(work_dir, e))?;
    let sidecar_path = sidecar_of(dir.path());
    let Some(sidecar) = FileGuard::try_exclusive(&sidecar_path)? else {
        return Err(StorageError::io(
            &sidecar_path,
            io::Error::new(io::ErrorKind::WouldBlock, "working copy sidecar is held"),
        ));
    };

    let bundle = match extract(container, dir.path()).and_then(|()| Bundle::open(dir.path())) {
        Ok(bundle) => bundle,
        Err(error) => {
            drop(sidecar);
            let _ = remove_if_exists(&sidecar_path);
            return Err(error);
        }
    };
    tracing::debug!(container = %container.display(), dir = %dir.path().display(), "unpacked container");
    Ok(Unpacked {
        dir,
        bundle,
        sidecar,
    })
}

fn extract(container: &Path, dest: &Path) -> Result<()> {
    let file = File::open(container).map_err(|e| StorageError::io(container, e))?;
    let mut archive = ZipArchive::new(file).map_err(|e| zip_error(container, e))?;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| zip_error(container, e))?;
        if entry.is_dir() {
            continue;
        }
        let Some(relative) = archive_relative(entry.name()) else {
            tracing::warn!(entry = entry.name(), "skipping container entry outside bundle/");
            continue;
        };
        if is_transient(&relative) {
            continue;
        }
        let out = dest.join(&relative);
        let parent = parent_dir(&out);
        fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        let mut target = File::create(&out).map_err(|e| StorageError::io(&out, e))?;
        io::copy(&mut entry, &mut target).map_err(|e| StorageError::io(&out, e))?;
    }

    let snapshots = dest.join(SNAPSHOT_DIR);
    fs::create_dir_all(&snapshots).map_err(|e| StorageError::io(&snapshots, e))
}

/// Path of an entry relative to `bundle/`, or `None` when the entry is
/// outside it or would climb out of the extraction root.
fn archive_relative(name: &str) -> Option<PathBuf> {
    let relative = Path::new(name).strip_prefix(ARCHIVE_ROOT).ok()?;
    let mut clean = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (!clean.as_os_str().is_empty()).then_some(clean)
}

fn is_transient(relative: &Path) -> bool {
    relative
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| {
            name == LOCK_FILE || name.starts_with(PUBLISH_TEMP_PREFIX) || name.starts_with(".tmp-")
        })
}

/// Writer lock marker of a container: `<container>.lock` beside it.
#[must_use]
pub fn lock_path(container: &Path) -> PathBuf {
    sidecar_of(container)
}

fn sidecar_of(dir: &Path) -> PathBuf {
    let mut name = dir.as_os_str().to_os_string();
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

// ---------------------------------------------------------------------------
// Sweeping
// ---------------------------------------------------------------------------

/// Remove working copies left behind by crashed sessions.
///
/// A copy is stale when it is at least `stale_after` old and its sidecar
/// lock can be taken. Returns the directories removed; a missing
/// `work_dir` is not an error.
///
/// # Errors
///
/// Returns an I/O error if `work_dir` exists but cannot be listed.
pub fn sweep_unpacked(work_dir: &Path, stale_after: Duration) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(work_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StorageError::io(work_dir, e)),
    };

    let mut removed = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let is_copy = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(UNPACK_PREFIX) && !name.ends_with(SIDECAR_SUFFIX));
        if !is_copy || !path.is_dir() {
            continue;
        }
        if file_age(&path).is_none_or(|age| age < stale_after) {
            continue;
        }
        let sidecar_path = sidecar_of(&path);
        let Some(guard) = FileGuard::try_exclusive(&sidecar_path)? else {
            continue;
        };
        if let Err(error) = fs::remove_dir_all(&path) {
            tracing::warn!(path = %path.display(), %error, "failed to remove stale container copy");
            continue;
        }
        drop(guard);
        let _ = remove_if_exists(&sidecar_path);
        tracing::info!(path = %path.display(), "removed stale container copy");
        removed.push(path);
    }
    Ok(removed)
}

/// Remove pack temp files older than `stale_after` from `dir`, as left by a
/// crash mid-save. Returns how many were removed.
pub fn sweep_pack_temps(dir: &Path, stale_after: Duration) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .filter(|entry| {
            entry.file_name().to_str().is_some_and(|name| {
                name.starts_with(PACK_TEMP_PREFIX) && name.ends_with(PACK_TEMP_SUFFIX)
            })
        })
        .filter(|entry| file_age(&entry.path()).is_some_and(|age| age >= stale_after))
        .filter(|entry| remove_if_exists(&entry.path()).unwrap_or(false))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A bundle holding snapshots `1..=count` with HEAD on the last.
    fn bundle_with(root: &Path, count: u32) -> Bundle {
        let bundle = Bundle::create(root).unwrap();
        let first = bundle.snapshot_path(SnapshotSeq::FIRST);
        for n in 2..=count {
            fs::copy(&first, bundle.snapshot_path(seq(n))).unwrap();
        }
        head::write_head(bundle.root(), &HeadDoc::now(seq(count))).unwrap();
        bundle
    }

    fn seq(n: u32) -> SnapshotSeq {
        SnapshotSeq::new(n).unwrap()
    }

    fn archive_names(path: &Path) -> Vec<String> {
        let archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
        archive.file_names().map(str::to_string).collect()
    }

    #[test]
    fn pack_then_unpack_preserves_head_and_snapshots() {
        let tmp = tempfile::tempdir().unwrap();
        let bundle = bundle_with(&tmp.path().join("p.labpack"), 3);
        let container = tmp.path().join("p.labpackz");

        pack(&bundle, &container).unwrap();
        assert!(is_container(&container));

        let unpacked = unpack(&container, &tmp.path().join("work")).unwrap();
        let restored = unpacked.bundle();
        assert_eq!(restored.list_snapshots().unwrap().len(), 3);
        let source_head = head::read_head(&bundle.head_path()).unwrap();
        let restored_head = head::read_head(&restored.head_path()).unwrap();
        assert_eq!(restored_head, source_head);
        assert_eq!(
            fs::read(restored.snapshot_path(seq(3))).unwrap(),
            fs::read(bundle.snapshot_path(seq(3))).unwrap()
        );
        assert_eq!(restored.meta_or_default(), bundle.meta_or_default());

        let dir = unpacked.dir().to_path_buf();
        unpacked.discard().unwrap();
        assert!(!dir.exists());
        assert!(!sidecar_of(&dir).exists());
    }

    #[test]
    fn entries_are_stored_and_transient_files_left_out() {
        let tmp = tempfile::tempdir().unwrap();
        let bundle = bundle_with(&tmp.path().join("p.labpack"), 2);
        fs::write(bundle.lock_path(), b"{}").unwrap();
        fs::write(bundle.snapshots_dir().join(".publish-abc.tmp"), b"partial").unwrap();
        fs::write(bundle.root().join(".tmp-xyz.partial"), b"partial").unwrap();
        let container = tmp.path().join("p.labpackz");

        pack(&bundle, &container).unwrap();

        let names = archive_names(&container);
        assert_eq!(
            names,
            vec![
                "bundle/HEAD.json",
                "bundle/meta.json",
                "bundle/snapshots/000001.sqlite",
                "bundle/snapshots/000002.sqlite",
            ]
        );
        let mut archive = ZipArchive::new(File::open(&container).unwrap()).unwrap();
        for index in 0..archive.len() {
            let entry = archive.by_index(index).unwrap();
            assert_eq!(entry.compression(), CompressionMethod::Stored);
        }
    }

    #[test]
    fn pack_refuses_to_replace_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let bundle = bundle_with(&tmp.path().join("p.labpack"), 1);
        let container = tmp.path().join("p.labpackz");
        fs::write(&container, b"keep me").unwrap();

        let err = pack(&bundle, &container).unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
        assert_eq!(fs::read(&container).unwrap(), b"keep me");
        assert_eq!(sweep_pack_temps(tmp.path(), Duration::ZERO), 0);
    }

    #[test]
    fn repack_replaces_container_with_new_state() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("p.labpack");
        let bundle = bundle_with(&root, 1);
        let container = tmp.path().join("p.labpackz");
        pack(&bundle, &container).unwrap();
        assert_eq!(archive_names(&container).len(), 3);

        let bundle = {
            fs::remove_dir_all(&root).unwrap();
            bundle_with(&root, 3)
        };
        repack(&bundle, &container).unwrap();

        assert_eq!(archive_names(&container).len(), 5);
        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with(PACK_TEMP_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn packed_head_names_recovered_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let bundle = bundle_with(&tmp.path().join("p.labpack"), 2);
        fs::write(bundle.head_path(), b"{ not json").unwrap();
        let container = tmp.path().join("p.labpackz");

        pack(&bundle, &container).unwrap();

        let unpacked = unpack(&container, &tmp.path().join("work")).unwrap();
        let head = head::read_head(&unpacked.bundle().head_path()).unwrap();
        assert_eq!(head.current, seq(2));
        // Packing only inspects; the source bundle is untouched.
        assert_eq!(fs::read(bundle.head_path()).unwrap(), b"{ not json");
    }

    #[test]
    fn unpack_skips_entries_that_escape_the_bundle() {
        let tmp = tempfile::tempdir().unwrap();
        let bundle = bundle_with(&tmp.path().join("p.labpack"), 1);
        let container = tmp.path().join("hostile.labpackz");
        {
            let file = File::create(&container).unwrap();
            let mut zip = ZipWriter::new(file);
            let stored =
                SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
            for name in [HEAD_FILE, META_FILE] {
                zip.start_file(entry_name(name), stored).unwrap();
                zip.write_all(&fs::read(bundle.root().join(name)).unwrap())
                    .unwrap();
            }
            zip.start_file("bundle/snapshots/000001.sqlite", stored)
                .unwrap();
            zip.write_all(&fs::read(bundle.snapshot_path(SnapshotSeq::FIRST)).unwrap())
                .unwrap();
            zip.start_file("bundle/../../escaped.txt", stored).unwrap();
            zip.write_all(b"outside").unwrap();
            zip.start_file("elsewhere/notes.txt", stored).unwrap();
            zip.write_all(b"outside").unwrap();
            zip.start_file("bundle/.lock", stored).unwrap();
            zip.write_all(b"{}").unwrap();
            zip.finish().unwrap();
        }

        let work = tmp.path().join("work");
        let unpacked = unpack(&container, &work).unwrap();

        assert!(!tmp.path().join("escaped.txt").exists());
        assert!(!work.join("escaped.txt").exists());
        assert!(!unpacked.dir().join("notes.txt").exists());
        assert!(!unpacked.bundle().lock_path().exists());
        assert_eq!(unpacked.bundle().list_snapshots().unwrap().len(), 1);
    }

    #[test]
    fn non_containers_are_recognized() {
        let tmp = tempfile::tempdir().unwrap();
        let bundle = bundle_with(&tmp.path().join("p.labpack"), 1);

        let sqlite = bundle.snapshot_path(SnapshotSeq::FIRST);
        assert!(!is_container(&sqlite));
        assert!(!is_container(bundle.root()));
        assert!(!is_container(&tmp.path().join("missing.labpackz")));

        let plain = tmp.path().join("plain.zip");
        {
            let mut zip = ZipWriter::new(File::create(&plain).unwrap());
            zip.start_file("readme.txt", SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"hello").unwrap();
            zip.finish().unwrap();
        }
        assert!(!is_container(&plain));
        assert!(matches!(
            unpack(&plain, &tmp.path().join("work")),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn sweep_removes_only_abandoned_copies() {
        let tmp = tempfile::tempdir().unwrap();
        let bundle = bundle_with(&tmp.path().join("p.labpack"), 1);
        let container = tmp.path().join("p.labpackz");
        pack(&bundle, &container).unwrap();
        let work = tmp.path().join("work");

        let live = unpack(&container, &work).unwrap();
        let abandoned = unpack(&container, &work).unwrap();
        let abandoned_dir = abandoned.dir().to_path_buf();
        // Simulate a crash: the directory stays, the sidecar lock is gone.
        let Unpacked { dir, sidecar, .. } = abandoned;
        let kept = dir.keep();
        drop(sidecar);
        assert_eq!(kept, abandoned_dir);

        let young = sweep_unpacked(&work, Duration::from_secs(3600)).unwrap();
        assert!(young.is_empty());

        let removed = sweep_unpacked(&work, Duration::ZERO).unwrap();
        assert_eq!(removed, vec![abandoned_dir.clone()]);
        assert!(!abandoned_dir.exists());
        assert!(live.dir().exists());
        assert!(sweep_unpacked(&tmp.path().join("missing"), Duration::ZERO)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn stale_pack_temps_are_swept() {
        let tmp = tempfile::tempdir().unwrap();
        let temp = tmp.path().join(".labpack-pack-abc.tmp");
        fs::write(&temp, b"partial").unwrap();
        fs::write(tmp.path().join("p.labpackz"), b"keep").unwrap();

        assert_eq!(sweep_pack_temps(tmp.path(), Duration::from_secs(3600)), 0);
        assert_eq!(sweep_pack_temps(tmp.path(), Duration::ZERO), 1);
        assert!(!temp.exists());
        assert!(tmp.path().join("p.labpackz").exists());
    }
}
