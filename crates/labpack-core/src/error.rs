use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Machine-readable error codes for callers that branch on failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    BundleNotFound,
    BundleExists,
    ConfigParseError,
    ReadOnlyViolation,
    SchemaTooNew,
    CheckpointIncomplete,
    IntegrityCheckFailed,
    UnrecoverableBundle,
    UnknownLegacyFormat,
    DiskFull,
    PermissionDenied,
    IoFailure,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::BundleNotFound => "E1001",
            Self::BundleExists => "E1002",
            Self::ConfigParseError => "E1003",
            Self::ReadOnlyViolation => "E2001",
            Self::SchemaTooNew => "E2002",
            Self::CheckpointIncomplete => "E3001",
            Self::IntegrityCheckFailed => "E3002",
            Self::UnrecoverableBundle => "E3003",
            Self::UnknownLegacyFormat => "E4001",
            Self::DiskFull => "E5001",
            Self::PermissionDenied => "E5002",
            Self::IoFailure => "E5003",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and dialogs.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::BundleNotFound => "Project bundle not found",
            Self::BundleExists => "Project bundle already exists",
            Self::ConfigParseError => "Config file parse error",
            Self::ReadOnlyViolation => "Project is open read-only",
            Self::SchemaTooNew => "Project was written by a newer version",
            Self::CheckpointIncomplete => "Staging journal could not be drained",
            Self::IntegrityCheckFailed => "Snapshot failed integrity check",
            Self::UnrecoverableBundle => "No valid snapshot found in bundle",
            Self::UnknownLegacyFormat => "Unrecognized legacy project format",
            Self::DiskFull => "Disk full",
            Self::PermissionDenied => "Permission denied",
            Self::IoFailure => "Filesystem I/O failure",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to the user.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::BundleNotFound => Some("Check the project path, or create a new project."),
            Self::BundleExists => Some("Choose a different name or open the existing project."),
            Self::ConfigParseError => Some("Fix syntax in labpack/config.toml and retry."),
            Self::ReadOnlyViolation => {
                Some("Another session holds the write lock; close it or wait for it to go stale.")
            }
            Self::SchemaTooNew => Some("Upgrade to a version that understands this project."),
            Self::CheckpointIncomplete => Some("Retry the save once pending reads finish."),
            Self::IntegrityCheckFailed => {
                Some("The previous save is intact; retry, and check the disk if it persists.")
            }
            Self::UnrecoverableBundle => Some(
                "Every snapshot failed validation. Restore the bundle from a backup or sync history.",
            ),
            Self::UnknownLegacyFormat => Some("The file is not a recognized project; it was left untouched."),
            Self::DiskFull => Some("Free disk space and save again; the previous save is intact."),
            Self::PermissionDenied => Some("Check write permissions on the project folder."),
            Self::IoFailure => None,
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Errors surfaced by the storage engine.
///
/// Every variant leaves the bundle in a state no worse than before the
/// failing operation began.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("bundle not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("bundle already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("write rejected: handle is read-only")]
    ReadOnlyViolation,

    #[error("schema version {found} is newer than supported version {supported}")]
    UnsupportedSchemaVersion { found: u32, supported: u32 },

    #[error("WAL checkpoint incomplete after {attempts} attempts ({wal_bytes} bytes remain)")]
    CheckpointIncomplete { attempts: u32, wal_bytes: u64 },

    #[error("integrity check failed for {}: {detail}", .path.display())]
    IntegrityCheckFailed { path: PathBuf, detail: String },

    #[error("no valid snapshot in {} ({examined} examined)", .path.display())]
    UnrecoverableBundle { path: PathBuf, examined: usize },

    #[error("unknown legacy format: {}", .0.display())]
    UnknownLegacyFormat(PathBuf),

    #[error("disk full while writing {}", .0.display())]
    DiskFull(PathBuf),

    #[error("permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("malformed document {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    /// Classify an I/O failure at `path`, lifting disk-full and permission
    /// errors into their dedicated variants.
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        match source.kind() {
            io::ErrorKind::StorageFull => Self::DiskFull(path),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(path),
            _ if source.raw_os_error() == Some(ENOSPC) => Self::DiskFull(path),
            _ => Self::Io { path, source },
        }
    }

    /// Classify a SQLite failure while operating on `path`.
    pub fn sqlite(path: impl AsRef<Path>, source: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(err, _) = &source {
            match err.code {
                rusqlite::ffi::ErrorCode::DiskFull => {
                    return Self::DiskFull(path.as_ref().to_path_buf());
                }
                rusqlite::ffi::ErrorCode::PermissionDenied
                | rusqlite::ffi::ErrorCode::ReadOnly => {
                    return Self::PermissionDenied(path.as_ref().to_path_buf());
                }
                _ => {}
            }
        }
        Self::Sqlite(source)
    }

    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::BundleNotFound,
            Self::AlreadyExists(_) => ErrorCode::BundleExists,
            Self::ReadOnlyViolation => ErrorCode::ReadOnlyViolation,
            Self::UnsupportedSchemaVersion { .. } => ErrorCode::SchemaTooNew,
            Self::CheckpointIncomplete { .. } => ErrorCode::CheckpointIncomplete,
            Self::IntegrityCheckFailed { .. } => ErrorCode::IntegrityCheckFailed,
            Self::UnrecoverableBundle { .. } => ErrorCode::UnrecoverableBundle,
            Self::UnknownLegacyFormat(_) => ErrorCode::UnknownLegacyFormat,
            Self::DiskFull(_) => ErrorCode::DiskFull,
            Self::PermissionDenied(_) => ErrorCode::PermissionDenied,
            Self::Io { .. } | Self::Json { .. } => ErrorCode::IoFailure,
            Self::Sqlite(_) => ErrorCode::InternalUnexpected,
        }
    }

    /// Optional remediation hint for the user.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }

    /// Whether the caller may simply retry the operation.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::CheckpointIncomplete { .. })
    }

    /// Whether this error means committed data may have been lost.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::UnrecoverableBundle { .. })
    }
}

/// `ENOSPC` on every unix we target; also what Windows maps
/// `ERROR_DISK_FULL` to through the CRT.
const ENOSPC: i32 = 28;

/// Convenience alias used throughout the crate.
pub type Result<T, E = StorageError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::{ErrorCode, StorageError};
    use std::collections::HashSet;
    use std::io;
    use std::path::PathBuf;

    #[test]
    fn all_codes_are_unique() {
        let all = [
            ErrorCode::BundleNotFound,
            ErrorCode::BundleExists,
            ErrorCode::ConfigParseError,
            ErrorCode::ReadOnlyViolation,
            ErrorCode::SchemaTooNew,
            ErrorCode::CheckpointIncomplete,
            ErrorCode::IntegrityCheckFailed,
            ErrorCode::UnrecoverableBundle,
            ErrorCode::UnknownLegacyFormat,
            ErrorCode::DiskFull,
            ErrorCode::PermissionDenied,
            ErrorCode::IoFailure,
            ErrorCode::InternalUnexpected,
        ];

        let mut seen = HashSet::new();
        for code in all {
            assert!(seen.insert(code.code()), "duplicate code {}", code.code());
        }
    }

    #[test]
    fn code_format_is_machine_friendly() {
        let code = ErrorCode::CheckpointIncomplete.code();
        assert_eq!(code.len(), 5);
        assert!(code.starts_with('E'));
        assert!(code.chars().skip(1).all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn io_errors_are_classified() {
        let full = StorageError::io("/x", io::Error::from_raw_os_error(28));
        assert!(matches!(full, StorageError::DiskFull(_)));

        let denied = StorageError::io("/x", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(denied, StorageError::PermissionDenied(_)));

        let other = StorageError::io("/x", io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(matches!(other, StorageError::Io { .. }));
        assert_eq!(other.code(), ErrorCode::IoFailure);
    }

    #[test]
    fn sqlite_full_and_readonly_are_classified() {
        let failure = |code| {
            StorageError::sqlite(
                "/x",
                rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None),
            )
        };

        let full = failure(rusqlite::ffi::SQLITE_FULL);
        assert!(matches!(full, StorageError::DiskFull(_)));
        assert_eq!(full.code(), ErrorCode::DiskFull);
        assert!(matches!(
            failure(rusqlite::ffi::SQLITE_READONLY),
            StorageError::PermissionDenied(_)
        ));
        assert!(matches!(
            failure(rusqlite::ffi::SQLITE_BUSY),
            StorageError::Sqlite(_)
        ));
    }

    #[test]
    fn only_checkpoint_is_retryable_and_only_unrecoverable_is_fatal() {
        let checkpoint = StorageError::CheckpointIncomplete {
            attempts: 3,
            wal_bytes: 4096,
        };
        assert!(checkpoint.is_retryable());
        assert!(!checkpoint.is_fatal());

        let lost = StorageError::UnrecoverableBundle {
            path: PathBuf::from("/p"),
            examined: 4,
        };
        assert!(lost.is_fatal());
        assert!(!lost.is_retryable());
        assert!(lost.hint().is_some());
        assert!(lost.to_string().contains("4 examined"));
    }
}
