//! Single-writer arbitration for a bundle.
//!
//! The `.lock` marker is created with `create_new` (`O_EXCL`), so exactly
//! one of any number of racing creators succeeds. A marker may be reclaimed
//! when its `refreshed_ts` is older than the stale threshold, or when it was
//! written on this host by a process that is no longer running. The
//! reclaim runs under an fs2 advisory lock on `.lock.reclaim` and re-verifies
//! the marker bytes before removing them, so two concurrent reclaimers can
//! never both win. Acquisition is attempt-once: it never blocks or retries.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::config::LockConfig;
use crate::durable::{atomic_write_json, file_age, fsync_dir, unix_now};
use crate::error::{Result, StorageError};
use crate::layout::{Bundle, parent_dir};

/// Lifecycle of a writer lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Acquiring,
    Held,
    Released,
}

/// Contents of the `.lock` marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMarker {
    pub owner: String,
    pub pid: u32,
    pub host: String,
    pub acquired_ts: i64,
    pub refreshed_ts: i64,
}

impl LockMarker {
    fn new(owner: &str) -> Self {
        let now = unix_now();
        Self {
            owner: owner.to_string(),
            pid: std::process::id(),
            host: host_name(),
            acquired_ts: now,
            refreshed_ts: now,
        }
    }
}

const UNKNOWN_HOST: &str = "unknown";

fn host_name() -> String {
    System::host_name().unwrap_or_else(|| UNKNOWN_HOST.to_string())
}

/// Whether `pid` is a running process on this machine.
fn process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some()
}

/// The marker was written on this host by a process that has exited.
fn holder_exited(marker: &LockMarker) -> bool {
    marker.host != UNKNOWN_HOST && marker.host == host_name() && !process_alive(marker.pid)
}

/// A fresh session owner id: random hex plus the process id.
#[must_use]
pub fn new_owner_id() -> String {
    format!("{:016x}-{}", rand::random::<u64>(), std::process::id())
}

/// Result of an acquisition attempt. `ReadOnly` is a degraded-mode signal,
/// not an error.
#[derive(Debug)]
pub enum LockOutcome {
    Acquired(LockGuard),
    ReadOnly { holder: Option<LockMarker> },
}

impl LockOutcome {
    #[must_use]
    pub const fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }
}

// ---------------------------------------------------------------------------
// FileGuard
// ---------------------------------------------------------------------------

/// Non-blocking fs2 exclusive lock on a sidecar file. Unlocked on drop.
#[derive(Debug)]
pub(crate) struct FileGuard {
    file: File,
    path: PathBuf,
}

impl FileGuard {
    /// `Ok(None)` when another handle holds the lock.
    pub(crate) fn try_exclusive(path: &Path) -> Result<Option<Self>> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| StorageError::io(path, e))?;

        if file.try_lock_exclusive().is_err() {
            return Ok(None);
        }
        Ok(Some(Self {
            file,
            path: path.to_path_buf(),
        }))
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

// ---------------------------------------------------------------------------
// LockManager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LockManager {
    path: PathBuf,
    reclaim_path: PathBuf,
    stale_after: Duration,
}

impl LockManager {
    #[must_use]
    pub fn new(bundle: &Bundle, config: &LockConfig) -> Self {
        Self::at(bundle.lock_path(), config)
    }

    /// A lock whose marker lives at `path`, for units other than a bundle
    /// directory.
    #[must_use]
    pub fn at(path: PathBuf, config: &LockConfig) -> Self {
        let mut reclaim = path.clone().into_os_string();
        reclaim.push(".reclaim");
        Self {
            path,
            reclaim_path: PathBuf::from(reclaim),
            stale_after: config.stale_after(),
        }
    }

    #[must_use]
    pub fn marker_path(&self) -> &Path {
        &self.path
    }

    /// The marker currently on disk, if present and readable.
    #[must_use]
    pub fn read_marker(&self) -> Option<LockMarker> {
        let bytes = fs::read(&self.path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// `Held` while any marker exists, `Unlocked` otherwise.
    #[must_use]
    pub fn observed_state(&self) -> LockState {
        if self.path.exists() {
            LockState::Held
        } else {
            LockState::Unlocked
        }
    }

    /// Attempt once to become the bundle's writer.
    ///
    /// # Errors
    ///
    /// Only filesystem failures other than contention; a fresh foreign
    /// marker yields [`LockOutcome::ReadOnly`].
    pub fn acquire(&self, owner: &str) -> Result<LockOutcome> {
        tracing::debug!(path = %self.path.display(), owner, state = ?LockState::Acquiring, "acquiring bundle lock");
        let marker = LockMarker::new(owner);

        if self.try_create(&marker)? {
            return Ok(self.acquired(marker));
        }

        let existing = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // Holder released between our create and read.
                if self.try_create(&marker)? {
                    return Ok(self.acquired(marker));
                }
                return Ok(LockOutcome::ReadOnly {
                    holder: self.read_marker(),
                });
            }
            Err(e) => return Err(StorageError::io(&self.path, e)),
        };
        let holder: Option<LockMarker> = serde_json::from_slice(&existing).ok();

        if !self.is_stale(holder.as_ref()) {
            tracing::info!(
                path = %self.path.display(),
                holder = holder.as_ref().map_or("<unreadable>", |m| m.owner.as_str()),
                "bundle is locked by another session; opening read-only"
            );
            return Ok(LockOutcome::ReadOnly { holder });
        }

        self.reclaim(&existing, holder, marker)
    }

    /// Remove the marker if it still names `owner`.
    ///
    /// Returns whether a marker was removed. A marker owned by someone else
    /// is logged and left in place.
    ///
    /// # Errors
    ///
    /// Filesystem failures while removing the marker.
    pub fn release(&self, owner: &str) -> Result<bool> {
        match self.read_marker() {
            Some(marker) if marker.owner == owner => {
                match fs::remove_file(&self.path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
                    Err(e) => return Err(StorageError::io(&self.path, e)),
                }
                fsync_dir(parent_dir(&self.path))?;
                tracing::debug!(path = %self.path.display(), owner, state = ?LockState::Released, "released bundle lock");
                Ok(true)
            }
            Some(marker) => {
                tracing::warn!(
                    path = %self.path.display(),
                    owner,
                    holder = %marker.owner,
                    "lock marker belongs to another session; not removing"
                );
                Ok(false)
            }
            None => {
                tracing::warn!(path = %self.path.display(), owner, "lock marker missing or unreadable at release");
                Ok(false)
            }
        }
    }

    fn acquired(&self, marker: LockMarker) -> LockOutcome {
        tracing::info!(path = %self.path.display(), owner = %marker.owner, state = ?LockState::Held, "acquired bundle lock");
        LockOutcome::Acquired(LockGuard {
            manager: self.clone(),
            marker,
            state: LockState::Held,
        })
    }

    /// Exclusive create. `Ok(false)` when a marker already exists.
    fn try_create(&self, marker: &LockMarker) -> Result<bool> {
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(StorageError::io(&self.path, e)),
        };

        let written = serde_json::to_vec(marker)
            .map_err(io::Error::other)
            .and_then(|bytes| file.write_all(&bytes))
            .and_then(|()| file.sync_all());
        if let Err(e) = written {
            let _ = fs::remove_file(&self.path);
            return Err(StorageError::io(&self.path, e));
        }
        fsync_dir(parent_dir(&self.path))?;
        Ok(true)
    }

    fn is_stale(&self, holder: Option<&LockMarker>) -> bool {
        if let Some(marker) = holder.filter(|m| holder_exited(m)) {
            tracing::warn!(
                path = %self.path.display(),
                holder = %marker.owner,
                pid = marker.pid,
                "lock holder process is not running"
            );
            return true;
        }
        let age = match holder {
            Some(marker) => {
                let secs = unix_now().saturating_sub(marker.refreshed_ts);
                u64::try_from(secs).map_or(Duration::ZERO, Duration::from_secs)
            }
            None => file_age(&self.path).unwrap_or(Duration::ZERO),
        };
        age > self.stale_after
    }

    fn reclaim(
        &self,
        judged: &[u8],
        holder: Option<LockMarker>,
        marker: LockMarker,
    ) -> Result<LockOutcome> {
        let Some(_reclaim) = FileGuard::try_exclusive(&self.reclaim_path)? else {
            tracing::info!(path = %self.path.display(), "another session is reclaiming the lock");
            return Ok(LockOutcome::ReadOnly { holder });
        };

        match fs::read(&self.path) {
            Ok(current) if current == judged => match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::io(&self.path, e)),
            },
            Ok(current) => {
                return Ok(LockOutcome::ReadOnly {
                    holder: serde_json::from_slice(&current).ok(),
                });
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::io(&self.path, e)),
        }

        if !self.try_create(&marker)? {
            return Ok(LockOutcome::ReadOnly {
                holder: self.read_marker(),
            });
        }

        tracing::warn!(
            path = %self.path.display(),
            previous_owner = holder.as_ref().map_or("<unreadable>", |m| m.owner.as_str()),
            previous_refreshed_ts = holder.as_ref().map(|m| m.refreshed_ts),
            owner = %marker.owner,
            "reclaimed stale bundle lock"
        );
        Ok(self.acquired(marker))
    }
}

// ---------------------------------------------------------------------------
// LockGuard
// ---------------------------------------------------------------------------

/// Proof of write ownership. Releases the marker on drop.
#[derive(Debug)]
pub struct LockGuard {
    manager: LockManager,
    marker: LockMarker,
    state: LockState,
}

impl LockGuard {
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.marker.owner
    }

    #[must_use]
    pub const fn marker(&self) -> &LockMarker {
        &self.marker
    }

    #[must_use]
    pub const fn state(&self) -> LockState {
        self.state
    }

    /// Bump `refreshed_ts` so a long session is never judged stale.
    ///
    /// # Errors
    ///
    /// Filesystem failures while rewriting the marker.
    pub fn refresh(&mut self) -> Result<()> {
        match self.manager.read_marker() {
            Some(current) if current.owner == self.marker.owner => {}
            other => {
                tracing::warn!(
                    owner = %self.marker.owner,
                    holder = other.as_ref().map(|m| m.owner.as_str()),
                    "lock marker no longer ours; skipping refresh"
                );
                return Ok(());
            }
        }
        self.marker.refreshed_ts = unix_now();
        atomic_write_json(&self.manager.path, &self.marker)
    }

    /// Release the lock now.
    ///
    /// # Errors
    ///
    /// Filesystem failures while removing the marker.
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.state != LockState::Held {
            return Ok(());
        }
        self.state = LockState::Released;
        self.manager.release(&self.marker.owner).map(|_| ())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(error) = self.release_inner() {
            tracing::warn!(owner = %self.marker.owner, %error, "failed to release bundle lock on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::TempDir;

    fn bundle() -> (TempDir, Bundle) {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("snapshots")).unwrap();
        let bundle = Bundle::open(dir.path()).unwrap();
        (dir, bundle)
    }

    fn manager(bundle: &Bundle) -> LockManager {
        LockManager::new(bundle, &LockConfig::default())
    }

    fn write_marker(bundle: &Bundle, owner: &str, refreshed_ts: i64) {
        let marker = LockMarker {
            owner: owner.to_string(),
            pid: 1,
            host: "elsewhere".to_string(),
            acquired_ts: refreshed_ts,
            refreshed_ts,
        };
        fs::write(bundle.lock_path(), serde_json::to_vec(&marker).unwrap()).unwrap();
    }

    #[test]
    fn second_owner_gets_read_only() {
        let (_dir, bundle) = bundle();
        let locks = manager(&bundle);

        let LockOutcome::Acquired(guard) = locks.acquire("a").unwrap() else {
            panic!("first acquire must succeed");
        };
        assert_eq!(guard.state(), LockState::Held);

        match locks.acquire("b").unwrap() {
            LockOutcome::ReadOnly { holder } => assert_eq!(holder.unwrap().owner, "a"),
            LockOutcome::Acquired(_) => panic!("second owner must not acquire"),
        }

        guard.release().unwrap();
        assert_eq!(locks.observed_state(), LockState::Unlocked);
        assert!(locks.acquire("b").unwrap().is_acquired());
    }

    #[test]
    fn drop_releases_marker() {
        let (_dir, bundle) = bundle();
        let locks = manager(&bundle);
        {
            let _outcome = locks.acquire("a").unwrap();
            assert!(bundle.lock_path().exists());
        }
        assert!(!bundle.lock_path().exists());
    }

    #[test]
    fn release_never_removes_foreign_marker() {
        let (_dir, bundle) = bundle();
        write_marker(&bundle, "other", unix_now());
        assert!(!manager(&bundle).release("me").unwrap());
        assert!(bundle.lock_path().exists());
    }

    #[test]
    fn stale_marker_is_reclaimed() {
        let (_dir, bundle) = bundle();
        write_marker(&bundle, "crashed", unix_now() - 7200);

        let LockOutcome::Acquired(guard) = manager(&bundle).acquire("fresh").unwrap() else {
            panic!("stale marker must be reclaimable");
        };
        assert_eq!(guard.owner(), "fresh");
        assert_eq!(manager(&bundle).read_marker().unwrap().owner, "fresh");
    }

    fn write_local_marker(bundle: &Bundle, owner: &str, pid: u32) {
        let now = unix_now();
        let marker = LockMarker {
            owner: owner.to_string(),
            pid,
            host: host_name(),
            acquired_ts: now,
            refreshed_ts: now,
        };
        fs::write(bundle.lock_path(), serde_json::to_vec(&marker).unwrap()).unwrap();
    }

    /// Pid of a child process that has already exited and been reaped.
    fn exited_pid() -> u32 {
        let mut child = std::process::Command::new(std::env::current_exe().unwrap())
            .arg("--list")
            .stdout(std::process::Stdio::null())
            .spawn()
            .unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    #[test]
    fn fresh_marker_of_exited_local_process_is_reclaimed() {
        let (_dir, bundle) = bundle();
        write_local_marker(&bundle, "crashed", exited_pid());

        let LockOutcome::Acquired(guard) = manager(&bundle).acquire("fresh").unwrap() else {
            panic!("marker of an exited process must be reclaimable");
        };
        assert_eq!(guard.owner(), "fresh");
        assert_eq!(manager(&bundle).read_marker().unwrap().pid, std::process::id());
    }

    #[test]
    fn fresh_marker_of_running_local_process_is_respected() {
        let (_dir, bundle) = bundle();
        write_local_marker(&bundle, "alive", std::process::id());
        assert!(!manager(&bundle).acquire("me").unwrap().is_acquired());
    }

    #[test]
    fn exited_pid_on_another_host_is_judged_by_age() {
        let (_dir, bundle) = bundle();
        write_marker(&bundle, "remote", unix_now());
        let mut marker = manager(&bundle).read_marker().unwrap();
        marker.pid = exited_pid();
        fs::write(bundle.lock_path(), serde_json::to_vec(&marker).unwrap()).unwrap();

        assert!(!manager(&bundle).acquire("me").unwrap().is_acquired());
    }

    #[test]
    fn unreadable_fresh_marker_is_respected() {
        let (_dir, bundle) = bundle();
        fs::write(bundle.lock_path(), b"").unwrap();
        assert!(!manager(&bundle).acquire("me").unwrap().is_acquired());
    }

    #[test]
    fn refresh_keeps_session_fresh() {
        let (_dir, bundle) = bundle();
        let locks = manager(&bundle);
        let LockOutcome::Acquired(mut guard) = locks.acquire("a").unwrap() else {
            panic!("acquire");
        };
        guard.marker.refreshed_ts -= 7200;
        atomic_write_json(&bundle.lock_path(), &guard.marker).unwrap();

        guard.refresh().unwrap();
        assert!(!locks.acquire("b").unwrap().is_acquired());
    }

    fn race(bundle: &Bundle, contenders: usize) -> usize {
        let barrier = Arc::new(Barrier::new(contenders));
        let handles: Vec<_> = (0..contenders)
            .map(|i| {
                let barrier = Arc::clone(&barrier);
                let locks = manager(bundle);
                thread::spawn(move || {
                    barrier.wait();
                    locks.acquire(&format!("owner-{i}")).unwrap()
                })
            })
            .collect();
        let outcomes: Vec<LockOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        outcomes.iter().filter(|o| o.is_acquired()).count()
    }

    #[test]
    fn concurrent_acquire_has_single_winner() {
        let (_dir, bundle) = bundle();
        assert_eq!(race(&bundle, 8), 1);
    }

    #[test]
    fn concurrent_stale_reclaim_has_single_winner() {
        let (_dir, bundle) = bundle();
        write_marker(&bundle, "crashed", unix_now() - 7200);
        assert_eq!(race(&bundle, 8), 1);
    }
}
