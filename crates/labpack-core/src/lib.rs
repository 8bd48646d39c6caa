//! labpack-core library.
//!
//! Crash-safe, sync-safe storage for project bundles: immutable SQLite
//! snapshots published atomically behind a `HEAD.json` pointer, a private
//! staging store per editing session, and single-writer arbitration.
//!
//! Start at [`Store`].
//!
//! # Conventions
//!
//! - **Errors**: [`StorageError`] for engine operations, `anyhow::Result` for
//!   config loading.
//! - **Logging**: `tracing` macros (`info!`, `warn!`, `debug!`) with
//!   structured fields.

pub mod config;
pub mod container;
pub mod db;
pub mod durable;
pub mod error;
pub mod head;
pub mod layout;
pub mod legacy;
pub mod lock;
pub mod model;
pub mod prune;
pub mod recovery;
pub mod staging;
pub mod store;
pub mod writer;

pub use error::{ErrorCode, Result, StorageError};
pub use layout::{Bundle, SnapshotRef, SnapshotSeq};
pub use store::{ContainerHandle, Handle, ReadOnlyHandle, Session, Store};
