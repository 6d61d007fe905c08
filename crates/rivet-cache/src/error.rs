//! Error types for cache operations.

use std::io;
use std::path::PathBuf;

/// Errors that can occur inside the cache subsystem.
///
/// These never fail a build: lookups degrade to misses and stores degrade to
/// [`StoreFailure`] reasons. The enum is used for internal propagation and by
/// the maintenance operations (`prune`, `verify`, `clean`).
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// An I/O error occurred while reading or writing cache files.
    #[error("cache I/O error at {path}: {source}")]
    Io {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// A manifest could not be parsed.
    #[error("failed to parse cache manifest {path}: {reason}")]
    ManifestParse {
        /// The manifest file path.
        path: PathBuf,
        /// Description of the parse failure.
        reason: String,
    },

    /// A manifest parsed but failed field validation.
    #[error("invalid cache manifest {path}: {reason}")]
    ManifestInvalid {
        /// The manifest file path.
        path: PathBuf,
        /// Which field failed and why.
        reason: String,
    },

    /// A manifest could not be serialized.
    #[error("failed to serialize cache manifest: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A background blocking task panicked or was cancelled.
    #[error("cache background task failed: {0}")]
    Background(#[from] tokio::task::JoinError),
}

impl CacheError {
    /// Wrap an I/O error with the path it occurred at.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Why a task result was not written to the cache.
///
/// Returned by `store` instead of an error; the build carries on uncached.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreFailure {
    /// The cache is in read-only / skip-write mode.
    #[error("cache writes are disabled")]
    WritesDisabled,

    /// Only successful runs are cached.
    #[error("task exited with code {0}")]
    NonZeroExit(i32),

    /// An entry for the key exists and overwrite was not requested.
    #[error("an entry for {key} already exists{}", if *.concurrent { " (stored concurrently)" } else { "" })]
    AlreadyExists {
        /// The conflicting key.
        key: String,
        /// The entry appeared after this task's own lookup missed.
        concurrent: bool,
    },

    /// A declared output does not exist.
    #[error("declared output '{0}' does not exist")]
    MissingOutput(String),

    /// A declared output is a directory rather than a file.
    #[error("declared output '{0}' is a directory, not a file")]
    OutputIsDirectory(String),

    /// A declared output escapes the package directory.
    #[error("declared output '{0}' is not a relative path inside the package")]
    OutputOutsidePackage(String),

    /// The disk holding the cache is full.
    #[error("disk full while writing {0}")]
    DiskFull(PathBuf),

    /// The cache directory is not writable.
    #[error("permission denied writing {0}")]
    PermissionDenied(PathBuf),

    /// Any other I/O failure.
    #[error("I/O error at {path}: {message}")]
    Io {
        /// Where the failure happened.
        path: PathBuf,
        /// The underlying error text.
        message: String,
    },

    /// The cache could not be initialized.
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

impl StoreFailure {
    /// Classify an I/O error into a human-readable store failure.
    pub fn from_io(path: impl Into<PathBuf>, err: &io::Error) -> Self {
        let path = path.into();
        match err.kind() {
            io::ErrorKind::StorageFull => Self::DiskFull(path),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(path),
            _ => Self::Io {
                path,
                message: err.to_string(),
            },
        }
    }
}

impl From<CacheError> for StoreFailure {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Io { path, source } => Self::from_io(path, &source),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

/// Why a cache hit could not be restored.
///
/// Distinct from a miss: the caller should fall back to running the task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RestoreFailure {
    /// A cached output no longer matches the hash recorded at store time.
    #[error("integrity check failed for '{path}': expected {expected}, found {actual}")]
    IntegrityMismatch {
        /// Package-relative output path.
        path: String,
        /// Hash recorded in the manifest.
        expected: String,
        /// Hash of the file currently in the cache.
        actual: String,
    },

    /// A cached output listed in the manifest is gone.
    #[error("cached output '{0}' is missing from the entry")]
    MissingCachedOutput(String),

    /// Copying an output back into the workspace failed.
    #[error("I/O error restoring {path}: {message}")]
    Io {
        /// Where the failure happened.
        path: PathBuf,
        /// The underlying error text.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_failure_classification() {
        let full = io::Error::new(io::ErrorKind::StorageFull, "no space");
        assert_eq!(
            StoreFailure::from_io("/cache/x", &full),
            StoreFailure::DiskFull(PathBuf::from("/cache/x"))
        );

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(
            StoreFailure::from_io("/cache/x", &denied),
            StoreFailure::PermissionDenied(PathBuf::from("/cache/x"))
        );

        let other = io::Error::new(io::ErrorKind::Other, "boom");
        assert!(matches!(
            StoreFailure::from_io("/cache/x", &other),
            StoreFailure::Io { .. }
        ));
    }

    #[test]
    fn test_already_exists_message() {
        let failure = StoreFailure::AlreadyExists {
            key: "abc".to_string(),
            concurrent: true,
        };
        assert_eq!(
            failure.to_string(),
            "an entry for abc already exists (stored concurrently)"
        );
    }
}
