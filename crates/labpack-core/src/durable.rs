//! Durable filesystem primitives shared by every component that publishes
//! bytes into a bundle.
//!
//! All pointer documents go through [`atomic_write`]: write a temp file in
//! the destination directory, `fsync` it, rename over the target, then
//! `fsync` the directory so the new entry itself survives power loss.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, SystemTime};

use crate::error::{Result, StorageError};
use crate::layout::parent_dir;

/// Atomically replace `path` with `bytes`.
///
/// # Errors
///
/// Returns [`StorageError::DiskFull`]/[`StorageError::PermissionDenied`] or
/// an I/O error. On failure the previous content of `path` is intact.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = parent_dir(path);
    let mut temp = tempfile::Builder::new()
        .prefix(".tmp-")
        .suffix(".partial")
        .tempfile_in(dir)
        .map_err(|e| StorageError::io(dir, e))?;

    temp.write_all(bytes).map_err(|e| StorageError::io(temp.path(), e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| StorageError::io(temp.path(), e))?;
    temp.persist(path)
        .map_err(|e| StorageError::io(path, e.error))?;

    fsync_dir(dir)
}

/// Serialize `value` as pretty JSON and [`atomic_write`] it.
///
/// # Errors
///
/// Same as [`atomic_write`].
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(|source| StorageError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    bytes.push(b'\n');
    atomic_write(path, &bytes)
}

/// Read and parse a JSON document.
///
/// # Errors
///
/// I/O errors, or [`StorageError::Json`] when the document is malformed.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).map_err(|e| StorageError::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|source| StorageError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Flush a file's contents to stable storage.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be opened or synced.
pub fn fsync_file(path: &Path) -> Result<()> {
    let file = File::open(path).map_err(|e| StorageError::io(path, e))?;
    file.sync_all().map_err(|e| StorageError::io(path, e))
}

/// Flush a directory so renames and creations inside it are durable.
///
/// A no-op on platforms that cannot open directories as files.
///
/// # Errors
///
/// Returns an I/O error if the directory sync itself fails.
pub fn fsync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let file = File::open(dir).map_err(|e| StorageError::io(dir, e))?;
        file.sync_all().map_err(|e| StorageError::io(dir, e))?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

/// Current time as unix seconds.
#[must_use]
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Age of a file by modification time; `None` when it cannot be determined.
#[must_use]
pub fn file_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).and_then(|meta| meta.modified()).ok()?;
    SystemTime::now().duration_since(modified).ok()
}
