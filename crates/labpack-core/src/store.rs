//! Consumer-facing API: open a bundle, read and write through a handle, save.
//!
//! ```text
//! open ─► lock attempt ─┬─ acquired ─► recover (repair) ─► seed staging ─► Session
//!                       └─ held      ─► recover (inspect) ─► snapshot view ─► ReadOnly
//! ```
//!
//! A [`Session`] owns the bundle's writer lock and a private staging store.
//! A [`ReadOnlyHandle`] reads the current immutable snapshot and never takes
//! the lock. A [`ContainerHandle`] does the same for the single-file form,
//! working on an unpacked copy and repacking on every save. There is no
//! process-wide state: every handle comes from an explicit [`Store`].

use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{PublishConfig, StoreConfig};
use crate::container::{self, Unpacked};
use crate::db::{self, mutation::{self, ApplyStats, Mutation}, query::Query};
use crate::error::{Result, StorageError};
use crate::layout::{self, Bundle, SnapshotRef, SnapshotSeq, parent_dir};
use crate::legacy::{self, MigrateOptions};
use crate::lock::{self, LockGuard, LockManager, LockMarker, LockOutcome};
use crate::prune::{self, PruneError, PruneReport, Pruner, PrunerHandle, Watch};
use crate::recovery::{self, RecoveryMode, RecoveryReport};
use crate::staging::{self, StagingStore};
use crate::writer;

/// Entry point. Holds configuration and, optionally, the background pruner.
#[derive(Debug)]
pub struct Store {
    config: StoreConfig,
    pruner: Option<Pruner>,
}

impl Store {
    /// A store without a background pruner. Call [`Self::prune`] to apply
    /// retention explicitly.
    #[must_use]
    pub const fn new(config: StoreConfig) -> Self {
        Self {
            config,
            pruner: None,
        }
    }

    /// A store whose sessions hand every save to a pruner thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the pruner thread cannot be spawned.
    pub fn with_background_pruner(config: StoreConfig) -> Result<Self> {
        let pruner = Pruner::spawn(config.retention.clone())?;
        Ok(Self {
            config,
            pruner: Some(pruner),
        })
    }

    /// A background-pruning store configured from the user config file and
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the pruner cannot start.
    pub fn from_user_config() -> anyhow::Result<Self> {
        let config = crate::config::load_user_config()?;
        Ok(Self::with_background_pruner(config)?)
    }

    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn pruner_handle(&self) -> Option<PrunerHandle> {
        self.pruner.as_ref().map(Pruner::handle)
    }

    /// Create a new bundle and open a session on it.
    ///
    /// # Errors
    ///
    /// [`StorageError::AlreadyExists`] if `path` exists, otherwise the
    /// errors of [`Bundle::create`] and [`Self::open`].
    pub fn create(&self, path: &Path) -> Result<Handle> {
        Bundle::create(path)?;
        self.open(path)
    }

    /// Open a bundle for editing, falling back to a read-only handle when
    /// another live session holds the lock.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotFound`] if `path` is not a bundle
    /// - [`StorageError::UnrecoverableBundle`] if no snapshot validates
    /// - [`StorageError::UnsupportedSchemaVersion`] for a newer schema
    /// - I/O failures
    pub fn open(&self, path: &Path) -> Result<Handle> {
        let bundle = Bundle::open(path)?;
        note_sync_folder(path);
        self.sweep_staging();
        self.open_bundle(bundle)
    }

    fn open_bundle(&self, bundle: Bundle) -> Result<Handle> {
        let owner = lock::new_owner_id();
        match LockManager::new(&bundle, &self.config.lock).acquire(&owner)? {
            LockOutcome::Acquired(guard) => {
                let session = Session::start(bundle, guard, &self.config, self.pruner_handle())?;
                Ok(Handle::Session(session))
            }
            LockOutcome::ReadOnly { holder } => {
                tracing::info!(
                    root = %bundle.root().display(),
                    holder = holder.as_ref().map(|m| m.owner.as_str()),
                    "bundle is locked by another session; opening read-only"
                );
                ReadOnlyHandle::open(bundle, holder).map(Handle::ReadOnly)
            }
        }
    }

    /// Open the current snapshot for viewing without attempting the lock.
    ///
    /// # Errors
    ///
    /// Same as [`Self::open`], minus lock handling.
    pub fn open_read_only(&self, path: &Path) -> Result<ReadOnlyHandle> {
        let bundle = Bundle::open(path)?;
        ReadOnlyHandle::open(bundle, None)
    }

    /// Convert a legacy single-file project and return the bundle path.
    ///
    /// # Errors
    ///
    /// See [`legacy::migrate`].
    #[allow(clippy::unused_self)]
    pub fn migrate(&self, legacy_path: &Path) -> Result<PathBuf> {
        legacy::migrate(legacy_path, &MigrateOptions::default())
    }

    /// Create a new container file and open it for editing.
    ///
    /// # Errors
    ///
    /// [`StorageError::AlreadyExists`] if `path` exists, otherwise the
    /// errors of [`container::pack`] and [`Self::open_container`].
    pub fn create_container(&self, path: &Path) -> Result<ContainerHandle> {
        if fs::symlink_metadata(path).is_ok() {
            return Err(StorageError::AlreadyExists(path.to_path_buf()));
        }
        let work = self.container_dir();
        fs::create_dir_all(&work).map_err(|e| StorageError::io(&work, e))?;
        let scratch = tempfile::Builder::new()
            .prefix(".labpack-new-")
            .tempdir_in(&work)
            .map_err(|e| StorageError::io(&work, e))?;
        let bundle = Bundle::create(&scratch.path().join("new.labpack"))?;
        container::pack(&bundle, path)?;
        let scratch_path = scratch.path().to_path_buf();
        scratch
            .close()
            .map_err(|e| StorageError::io(&scratch_path, e))?;
        self.open_container(path)
    }

    /// Open a container file. Like [`Self::open`], a container locked by a
    /// live session opens read-only.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotFound`] if `path` is not a container
    /// - the errors of [`Self::open`] for the unpacked bundle
    pub fn open_container(&self, path: &Path) -> Result<ContainerHandle> {
        if !container::is_container(path) {
            return Err(StorageError::NotFound(path.to_path_buf()));
        }
        note_sync_folder(path);
        self.sweep_staging();
        let swept = container::sweep_pack_temps(parent_dir(path), self.config.retention.stale_temp_after());
        if swept > 0 {
            tracing::info!(dir = %parent_dir(path).display(), swept, "removed abandoned container temps");
        }

        let owner = lock::new_owner_id();
        let outcome = LockManager::at(container::lock_path(path), &self.config.lock).acquire(&owner)?;
        let unpacked = container::unpack(path, &self.container_dir())?;
        let bundle = unpacked.bundle().clone();
        let (handle, lock) = match outcome {
            LockOutcome::Acquired(guard) => (self.open_bundle(bundle)?, Some(guard)),
            LockOutcome::ReadOnly { holder } => {
                tracing::info!(
                    container = %path.display(),
                    holder = holder.as_ref().map(|m| m.owner.as_str()),
                    "container is locked by another session; opening read-only"
                );
                (Handle::ReadOnly(ReadOnlyHandle::open(bundle, holder)?), None)
            }
        };
        tracing::info!(container = %path.display(), read_only = handle.is_read_only(), "opened container");
        Ok(ContainerHandle {
            handle,
            unpacked,
            lock,
            path: path.to_path_buf(),
        })
    }

    /// Write the bundle at `bundle_path` to a new container at `target`.
    ///
    /// # Errors
    ///
    /// See [`container::pack`].
    #[allow(clippy::unused_self)]
    pub fn pack(&self, bundle_path: &Path, target: &Path) -> Result<()> {
        container::pack(&Bundle::open(bundle_path)?, target)
    }

    /// Apply retention to a bundle synchronously.
    ///
    /// # Errors
    ///
    /// See [`prune::prune`].
    pub fn prune(&self, path: &Path) -> Result<PruneReport, PruneError> {
        let bundle = Bundle::open(path)?;
        prune::prune(&bundle, &self.config.retention)
    }

    /// Wait until the background pruner has handled every request queued so
    /// far. Returns immediately without a pruner.
    pub fn flush_pruner(&self) {
        if let Some(pruner) = &self.pruner {
            pruner.handle().flush();
        }
    }

    fn container_dir(&self) -> PathBuf {
        self.config.staging.resolved_dir().join("containers")
    }

    fn sweep_staging(&self) {
        let containers = self.container_dir();
        match container::sweep_unpacked(&containers, self.config.staging.stale_after()) {
            Ok(removed) if !removed.is_empty() => {
                tracing::info!(
                    dir = %containers.display(),
                    removed = removed.len(),
                    "swept stale container copies"
                );
            }
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(dir = %containers.display(), %error, "container sweep failed");
            }
        }

        let dir = self.config.staging.resolved_dir();
        match staging::sweep_orphans(&dir, self.config.staging.stale_after()) {
            Ok(report) if !report.removed.is_empty() => {
                tracing::info!(
                    dir = %dir.display(),
                    removed = report.removed.len(),
                    "swept orphaned staging stores"
                );
            }
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(dir = %dir.display(), %error, "staging sweep failed");
            }
        }
    }
}

fn note_sync_folder(path: &Path) {
    if let Some(service) = layout::sync_service(path) {
        tracing::info!(
            path = %path.display(),
            %service,
            "project lives in a cloud-synced folder"
        );
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// What [`Store::open`] hands back.
#[derive(Debug)]
pub enum Handle {
    Session(Session),
    ReadOnly(ReadOnlyHandle),
}

impl Handle {
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        matches!(self, Self::ReadOnly(_))
    }

    #[must_use]
    pub const fn bundle(&self) -> &Bundle {
        match self {
            Self::Session(session) => &session.bundle,
            Self::ReadOnly(view) => &view.bundle,
        }
    }

    /// Snapshot the handle was opened on or last saved as.
    #[must_use]
    pub const fn current(&self) -> SnapshotSeq {
        match self {
            Self::Session(session) => session.current(),
            Self::ReadOnly(view) => view.seq,
        }
    }

    /// Run a query against the staging store (sessions) or the snapshot
    /// (read-only handles).
    ///
    /// # Errors
    ///
    /// SQLite failures.
    pub fn read<Q: Query>(&self, query: &Q) -> Result<Q::Output> {
        match self {
            Self::Session(session) => session.read(query),
            Self::ReadOnly(view) => view.read(query),
        }
    }

    /// # Errors
    ///
    /// [`StorageError::ReadOnlyViolation`] on a read-only handle, otherwise
    /// SQLite failures.
    pub fn write(&mut self, mutation: Mutation) -> Result<ApplyStats> {
        self.session_mut()?.write(mutation)
    }

    /// Apply a batch in one transaction.
    ///
    /// # Errors
    ///
    /// Same as [`Self::write`].
    pub fn write_all(&mut self, mutations: &[Mutation]) -> Result<ApplyStats> {
        self.session_mut()?.write_all(mutations)
    }

    /// Publish the staging store as the next snapshot.
    ///
    /// # Errors
    ///
    /// [`StorageError::ReadOnlyViolation`] on a read-only handle, otherwise
    /// the errors of [`writer::publish`].
    pub fn save(&mut self) -> Result<SnapshotRef> {
        self.session_mut()?.save()
    }

    /// Release the lock and discard staging (sessions), or drop the
    /// snapshot connection (read-only handles).
    ///
    /// # Errors
    ///
    /// Filesystem failures while cleaning up; the handle is gone either way.
    pub fn close(self) -> Result<()> {
        match self {
            Self::Session(session) => session.close(),
            Self::ReadOnly(view) => {
                view.close();
                Ok(())
            }
        }
    }

    #[must_use]
    pub const fn as_session(&self) -> Option<&Session> {
        match self {
            Self::Session(session) => Some(session),
            Self::ReadOnly(_) => None,
        }
    }

    pub const fn as_session_mut(&mut self) -> Option<&mut Session> {
        match self {
            Self::Session(session) => Some(session),
            Self::ReadOnly(_) => None,
        }
    }

    fn session_mut(&mut self) -> Result<&mut Session> {
        self.as_session_mut().ok_or(StorageError::ReadOnlyViolation)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A writable view of a bundle. Owns the writer lock for its lifetime.
///
/// Dropping a session without [`Session::close`] still releases the lock and
/// unwatches the bundle; its staging store is then left for the next orphan
/// sweep.
#[derive(Debug)]
pub struct Session {
    bundle: Bundle,
    lock: LockGuard,
    staging: StagingStore,
    publish: PublishConfig,
    pruner: Option<Watch>,
    recovery: RecoveryReport,
    dirty: bool,
}

impl Session {
    fn start(
        bundle: Bundle,
        lock: LockGuard,
        config: &StoreConfig,
        pruner: Option<PrunerHandle>,
    ) -> Result<Self> {
        let recovery = recovery::recover(&bundle, RecoveryMode::Repair)?;
        let staging =
            StagingStore::seed(&bundle, recovery.current(), lock.owner(), &config.staging)?;
        let pruner = pruner.map(|handle| handle.watch(bundle.root()));
        tracing::info!(
            root = %bundle.root().display(),
            owner = %lock.owner(),
            seq = %recovery.current(),
            "opened bundle for editing"
        );
        Ok(Self {
            bundle,
            lock,
            staging,
            publish: config.publish.clone(),
            pruner,
            recovery,
            dirty: false,
        })
    }

    #[must_use]
    pub const fn bundle(&self) -> &Bundle {
        &self.bundle
    }

    #[must_use]
    pub const fn current(&self) -> SnapshotSeq {
        self.staging.source_seq()
    }

    #[must_use]
    pub fn owner(&self) -> &str {
        self.lock.owner()
    }

    /// What recovery resolved when this session opened.
    #[must_use]
    pub const fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Whether there are writes not yet published.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Direct access to the staging connection.
    #[must_use]
    pub const fn connection(&self) -> &Connection {
        self.staging.conn()
    }

    /// # Errors
    ///
    /// SQLite failures.
    pub fn read<Q: Query>(&self, query: &Q) -> Result<Q::Output> {
        query
            .run(self.staging.conn())
            .map_err(|e| StorageError::sqlite(self.staging.path(), e))
    }

    /// # Errors
    ///
    /// SQLite failures; the staging store is unchanged on error.
    #[allow(clippy::needless_pass_by_value)]
    pub fn write(&mut self, mutation: Mutation) -> Result<ApplyStats> {
        self.write_all(std::slice::from_ref(&mutation))
    }

    /// # Errors
    ///
    /// SQLite failures; the whole batch rolls back on error.
    pub fn write_all(&mut self, mutations: &[Mutation]) -> Result<ApplyStats> {
        let stats = mutation::apply_all(self.staging.conn_mut(), mutations)
            .map_err(|e| StorageError::sqlite(self.staging.path(), e))?;
        if stats.applied > 0 {
            self.dirty = true;
        }
        Ok(stats)
    }

    /// Publish the staging store as the bundle's next snapshot.
    ///
    /// Refreshes the lock marker and queues a prune; pruning never runs on
    /// this path.
    ///
    /// # Errors
    ///
    /// See [`writer::publish`]. After an error the staging store still holds
    /// every edit and HEAD still names the previous snapshot.
    pub fn save(&mut self) -> Result<SnapshotRef> {
        let snapshot = writer::publish(&self.bundle, &mut self.staging, &self.publish)?;
        self.dirty = false;
        if let Err(error) = self.lock.refresh() {
            tracing::warn!(%error, "could not refresh lock marker after save");
        }
        if let Some(pruner) = &self.pruner {
            pruner.request();
        }
        Ok(snapshot)
    }

    /// Protect snapshot `seq` from pruning under `label`.
    ///
    /// # Errors
    ///
    /// [`StorageError::NotFound`] if the snapshot does not exist, otherwise
    /// failures writing `meta.json`.
    pub fn tag_milestone(&mut self, seq: SnapshotSeq, label: &str) -> Result<()> {
        let path = self.bundle.snapshot_path(seq);
        if !path.is_file() {
            return Err(StorageError::NotFound(path));
        }
        let mut meta = self.bundle.meta_or_default();
        meta.milestones.insert(seq, label.to_string());
        self.bundle.save_meta(&meta)?;

        // The pruner may have removed it between the check and the save.
        if !path.is_file() {
            meta.milestones.remove(&seq);
            self.bundle.save_meta(&meta)?;
            return Err(StorageError::NotFound(path));
        }
        tracing::info!(seq = %seq, label, "tagged milestone");
        Ok(())
    }

    /// Remove a milestone tag. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Failures writing `meta.json`.
    pub fn untag_milestone(&mut self, seq: SnapshotSeq) -> Result<bool> {
        let mut meta = self.bundle.meta_or_default();
        if meta.milestones.remove(&seq).is_none() {
            return Ok(false);
        }
        self.bundle.save_meta(&meta)?;
        tracing::info!(seq = %seq, "removed milestone tag");
        Ok(true)
    }

    /// Discard staging and release the lock. Unsaved edits are lost.
    ///
    /// # Errors
    ///
    /// Filesystem failures while cleaning up. The lock is released even when
    /// discarding staging fails.
    pub fn close(self) -> Result<()> {
        let Self {
            bundle,
            lock,
            staging,
            pruner,
            dirty,
            ..
        } = self;
        if dirty {
            tracing::warn!(root = %bundle.root().display(), "closing session with unsaved edits");
        }
        drop(pruner);
        let discarded = staging.discard();
        lock.release()?;
        discarded?;
        tracing::info!(root = %bundle.root().display(), "closed bundle");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ReadOnlyHandle
// ---------------------------------------------------------------------------

/// A view of the bundle's current snapshot.
#[derive(Debug)]
pub struct ReadOnlyHandle {
    bundle: Bundle,
    conn: Connection,
    seq: SnapshotSeq,
    holder: Option<LockMarker>,
}

impl ReadOnlyHandle {
    fn open(bundle: Bundle, holder: Option<LockMarker>) -> Result<Self> {
        let report = recovery::recover(&bundle, RecoveryMode::Inspect)?;
        let seq = report.current();
        let conn = db::open_snapshot_view(&bundle.snapshot_path(seq))?;
        tracing::debug!(root = %bundle.root().display(), seq = %seq, "opened snapshot view");
        Ok(Self {
            bundle,
            conn,
            seq,
            holder,
        })
    }

    #[must_use]
    pub const fn bundle(&self) -> &Bundle {
        &self.bundle
    }

    #[must_use]
    pub const fn current(&self) -> SnapshotSeq {
        self.seq
    }

    /// The lock marker that forced read-only mode, if any.
    #[must_use]
    pub const fn holder(&self) -> Option<&LockMarker> {
        self.holder.as_ref()
    }

    /// # Errors
    ///
    /// SQLite failures.
    pub fn read<Q: Query>(&self, query: &Q) -> Result<Q::Output> {
        query
            .run(&self.conn)
            .map_err(|e| StorageError::sqlite(self.bundle.snapshot_path(self.seq), e))
    }

    /// Follow HEAD to a newer snapshot if the writer has published one.
    /// Returns whether the view moved.
    ///
    /// # Errors
    ///
    /// Recovery or open failures; the current view stays valid on error.
    pub fn reload(&mut self) -> Result<bool> {
        let report = recovery::recover(&self.bundle, RecoveryMode::Inspect)?;
        if report.current() == self.seq {
            return Ok(false);
        }
        self.conn = db::open_snapshot_view(&self.bundle.snapshot_path(report.current()))?;
        tracing::debug!(from = %self.seq, to = %report.current(), "snapshot view moved");
        self.seq = report.current();
        Ok(true)
    }

    pub fn close(self) {
        if let Err((_, error)) = self.conn.close() {
            tracing::warn!(%error, "snapshot connection did not close cleanly");
        }
    }
}

// ---------------------------------------------------------------------------
// ContainerHandle
// ---------------------------------------------------------------------------

/// A handle on a container file, backed by an unpacked working copy.
///
/// Holds the container's lock when editable. Dropping it without
/// [`ContainerHandle::close`] releases the lock and removes the working
/// copy; unsaved edits are lost either way.
#[derive(Debug)]
pub struct ContainerHandle {
    handle: Handle,
    unpacked: Unpacked,
    lock: Option<LockGuard>,
    path: PathBuf,
}

impl ContainerHandle {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        self.handle.is_read_only()
    }

    #[must_use]
    pub const fn handle(&self) -> &Handle {
        &self.handle
    }

    pub const fn handle_mut(&mut self) -> &mut Handle {
        &mut self.handle
    }

    /// Publish a snapshot in the working copy, then atomically replace the
    /// container file with it.
    ///
    /// # Errors
    ///
    /// [`StorageError::ReadOnlyViolation`] on a read-only handle, otherwise
    /// the errors of [`Handle::save`] and [`container::repack`]. The
    /// container keeps its previous contents on error.
    pub fn save(&mut self) -> Result<SnapshotRef> {
        let saved = self.handle.save()?;
        container::repack(self.unpacked.bundle(), &self.path)?;
        if let Some(lock) = &mut self.lock {
            lock.refresh()?;
        }
        tracing::info!(container = %self.path.display(), seq = %saved.seq, "saved container");
        Ok(saved)
    }

    /// Close the inner handle, remove the working copy and release the
    /// container lock.
    ///
    /// # Errors
    ///
    /// The first cleanup failure; every step runs regardless.
    pub fn close(self) -> Result<()> {
        let Self {
            handle,
            unpacked,
            lock,
            path,
        } = self;
        let closed = handle.close();
        let discarded = unpacked.discard();
        let released = lock.map_or(Ok(()), LockGuard::release);
        closed?;
        discarded?;
        released?;
        tracing::info!(container = %path.display(), "closed container");
        Ok(())
    }
}
