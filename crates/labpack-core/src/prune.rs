//! Retention pruning.
//!
//! Snapshots are immutable, so pruning is plain file removal of sequences
//! outside the retained set: the current snapshot, the newest
//! `keep_count`, and every milestone. Pruning refuses to run unless HEAD
//! validates exactly as written; a bundle awaiting repair is left alone.
//!
//! [`Pruner`] runs pruning on its own thread, driven by a work queue of
//! [`PruneRequest`]s and an idle timer. The save path only enqueues.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::config::RetentionConfig;
use crate::durable::{file_age, fsync_dir};
use crate::error::{ErrorCode, StorageError};
use crate::layout::{Bundle, SnapshotSeq, remove_if_exists};
use crate::recovery::{self, RecoveryMode};

#[derive(Debug, thiserror::Error)]
pub enum PruneError {
    #[error("HEAD does not name a valid snapshot as written (named {named:?}, resolved {resolved}); pruning skipped")]
    UnresolvedHead {
        named: Option<SnapshotSeq>,
        resolved: SnapshotSeq,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl PruneError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::UnresolvedHead { .. } => ErrorCode::UnrecoverableBundle,
            Self::Storage(inner) => inner.code(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub current: Option<SnapshotSeq>,
    pub kept: Vec<SnapshotSeq>,
    pub deleted: Vec<SnapshotSeq>,
    pub temps_removed: Vec<PathBuf>,
}

/// Sequences that must survive pruning.
#[must_use]
pub fn retained_set(
    all: &[SnapshotSeq],
    current: SnapshotSeq,
    keep_count: usize,
    milestones: &BTreeMap<SnapshotSeq, String>,
) -> BTreeSet<SnapshotSeq> {
    let mut sorted: Vec<SnapshotSeq> = all.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut keep: BTreeSet<SnapshotSeq> =
        sorted.iter().rev().take(keep_count.max(1)).copied().collect();
    keep.insert(current);
    keep.extend(milestones.keys().copied());
    keep
}

/// Delete snapshots outside the retained set and stale publish temps.
///
/// # Errors
///
/// [`PruneError::UnresolvedHead`] if HEAD needs repair first; storage
/// errors from recovery or file removal.
pub fn prune(bundle: &Bundle, config: &RetentionConfig) -> Result<PruneReport, PruneError> {
    let start = Instant::now();
    let resolution = recovery::recover(bundle, RecoveryMode::Inspect)?;
    if !resolution.head_was_valid() {
        return Err(PruneError::UnresolvedHead {
            named: resolution.previous,
            resolved: resolution.current(),
        });
    }
    let current = resolution.current();

    let snapshots = bundle.list_snapshots()?;
    let all: Vec<SnapshotSeq> = snapshots.iter().map(|s| s.seq).collect();
    let milestones = bundle.meta_or_default().milestones;
    let keep = retained_set(&all, current, config.effective_keep_count(), &milestones);

    let mut report = PruneReport {
        current: Some(current),
        ..PruneReport::default()
    };
    for snapshot in &snapshots {
        if keep.contains(&snapshot.seq) {
            report.kept.push(snapshot.seq);
            continue;
        }
        if remove_if_exists(&snapshot.path)? {
            report.deleted.push(snapshot.seq);
        }
    }

    let stale_after = config.stale_temp_after();
    for temp in bundle.publish_temps()? {
        if file_age(&temp).is_some_and(|age| age >= stale_after) && remove_if_exists(&temp)? {
            report.temps_removed.push(temp);
        }
    }

    if !report.deleted.is_empty() || !report.temps_removed.is_empty() {
        fsync_dir(&bundle.snapshots_dir())?;
        tracing::info!(
            root = %bundle.root().display(),
            current = %current,
            kept = report.kept.len(),
            deleted = report.deleted.len(),
            temps_removed = report.temps_removed.len(),
            elapsed_ms = start.elapsed().as_millis(),
            "pruned snapshots"
        );
    }
    Ok(report)
}

// ---------------------------------------------------------------------------
// Background worker
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum PruneRequest {
    /// Prune one bundle now (sent after a publish).
    Prune(PathBuf),
    /// Include a bundle in idle-timer passes.
    Watch(PathBuf),
    Unwatch(PathBuf),
    /// Acknowledge once every earlier request has been handled.
    Flush(Sender<()>),
    Shutdown,
}

/// Cloneable sending side of the pruner queue. Sends never block; a stopped
/// worker turns them into no-ops.
#[derive(Debug, Clone)]
pub struct PrunerHandle {
    tx: Sender<PruneRequest>,
}

impl PrunerHandle {
    pub fn request(&self, root: &Path) {
        self.send(PruneRequest::Prune(root.to_path_buf()));
    }

    /// Include `root` in idle passes until the returned [`Watch`] drops.
    #[must_use = "dropping the Watch unwatches the bundle immediately"]
    pub fn watch(&self, root: &Path) -> Watch {
        self.send(PruneRequest::Watch(root.to_path_buf()));
        Watch {
            handle: self.clone(),
            root: root.to_path_buf(),
        }
    }

    pub fn unwatch(&self, root: &Path) {
        self.send(PruneRequest::Unwatch(root.to_path_buf()));
    }

    /// Block until the worker has drained everything queued before this call.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = mpsc::channel();
        if self.tx.send(PruneRequest::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    fn send(&self, request: PruneRequest) {
        if self.tx.send(request).is_err() {
            tracing::debug!("pruner is stopped; dropping request");
        }
    }
}

/// A bundle's registration with the pruner. Sends `Unwatch` on drop, so a
/// session that is dropped without closing stops being pruned.
#[derive(Debug)]
pub struct Watch {
    handle: PrunerHandle,
    root: PathBuf,
}

impl Watch {
    /// Queue an immediate prune of the watched bundle.
    pub fn request(&self) {
        self.handle.request(&self.root);
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.handle.unwatch(&self.root);
    }
}

/// Owns the pruner thread. Dropping it shuts the worker down.
#[derive(Debug)]
pub struct Pruner {
    handle: PrunerHandle,
    join: Option<JoinHandle<()>>,
}

impl Pruner {
    /// Start the worker thread.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the thread cannot be spawned.
    pub fn spawn(config: RetentionConfig) -> Result<Self, StorageError> {
        let (tx, rx) = mpsc::channel();
        let join = thread::Builder::new()
            .name("labpack-pruner".to_string())
            .spawn(move || run_worker(&rx, &config))
            .map_err(|e| StorageError::io("<pruner thread>", e))?;
        Ok(Self {
            handle: PrunerHandle { tx },
            join: Some(join),
        })
    }

    #[must_use]
    pub fn handle(&self) -> PrunerHandle {
        self.handle.clone()
    }

    /// Stop the worker and wait for it to finish its current job.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.handle.tx.send(PruneRequest::Shutdown);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                tracing::error!("pruner thread panicked");
            }
        }
    }
}

impl Drop for Pruner {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(rx: &mpsc::Receiver<PruneRequest>, config: &RetentionConfig) {
    let mut watched: BTreeSet<PathBuf> = BTreeSet::new();
    tracing::debug!(idle_secs = config.idle_prune_secs, "pruner started");

    loop {
        match rx.recv_timeout(config.idle_interval()) {
            Ok(PruneRequest::Prune(root)) => prune_root(&root, config),
            Ok(PruneRequest::Watch(root)) => {
                watched.insert(root);
            }
            Ok(PruneRequest::Unwatch(root)) => {
                watched.remove(&root);
            }
            Ok(PruneRequest::Flush(ack)) => {
                let _ = ack.send(());
            }
            Ok(PruneRequest::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                for root in &watched {
                    prune_root(root, config);
                }
            }
        }
    }
    tracing::debug!("pruner stopped");
}

fn prune_root(root: &Path, config: &RetentionConfig) {
    let outcome = Bundle::open(root)
        .map_err(PruneError::from)
        .and_then(|bundle| prune(&bundle, config));
    match outcome {
        Ok(report) => {
            tracing::debug!(root = %root.display(), deleted = report.deleted.len(), "prune pass complete");
        }
        Err(error @ PruneError::UnresolvedHead { .. }) => {
            tracing::info!(root = %root.display(), %error, "prune deferred until HEAD is repaired");
        }
        Err(error) => {
            tracing::warn!(root = %root.display(), %error, code = %error.code(), "prune failed");
        }
    }
}
