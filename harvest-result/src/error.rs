use std::path::{Path, PathBuf};
use std::{fmt, io};
use thiserror::Error;

/// Unified error type for all harvest storage operations.
///
/// Every crate in the workspace returns this enum so failures propagate with `?`
/// across crate boundaries without conversion glue. Variants carry the context an
/// operator needs to act on the failure: the snapshot id, the operation, or the
/// file path that could not be read or written.
///
/// # Error Handling Strategy
///
/// Components never swallow failures. Low-level errors are wrapped with their
/// path or snapshot context and re-raised to the lifecycle layer, which decides
/// whether to retry, mark the snapshot failed, or surface an empty result.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error without additional path context.
    ///
    /// Prefer [`Error::io_at`] when the offending path is known.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// I/O error on a specific file or directory.
    ///
    /// Raised by writers when a flush fails (the in-progress file is discarded)
    /// and by readers when a file cannot be opened mid-scan.
    #[error("I/O error at {path}: {source}")]
    IoAt {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Arrow error while building or slicing record batches.
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Parquet error that is not attributable to a specific file.
    ///
    /// File-level decode failures are reported as [`Error::CorruptData`] instead.
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// SQLite error raised by the catalog store.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON (de)serialization failure for metadata, summaries, or configuration.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Snapshot, metadata, or record is absent.
    ///
    /// # Recovery
    ///
    /// Recoverable. Statistics callers surface this as an empty result; it is
    /// never silently treated as a zero count inside the storage layer.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A filter expression could not be parsed.
    ///
    /// Raised before any file is opened, so a malformed filter never costs a scan.
    #[error("Invalid filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    /// Lifecycle violation, e.g. appending to a snapshot that is already closed.
    ///
    /// Fatal to the calling operation only. The snapshot itself stays in its
    /// current state and `delete` remains valid.
    #[error("Invalid state for snapshot {snapshot_id}: cannot {operation} while {state}")]
    InvalidState {
        snapshot_id: i64,
        state: String,
        operation: String,
    },

    /// A file failed to parse.
    ///
    /// Carries the file identity so operators can isolate the file and re-harvest.
    #[error("Corrupt data in {path}: {message}")]
    CorruptData { path: PathBuf, message: String },

    /// Destination already holds data that an operation refuses to overwrite.
    #[error("Destination already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    /// Invalid API parameter or configuration value.
    #[error("Invalid argument: {0}")]
    InvalidArgumentError(String),

    /// Unexpected internal state, including poisoned locks.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap an I/O error with the path it occurred on.
    #[inline]
    pub fn io_at(path: impl AsRef<Path>, source: io::Error) -> Self {
        Error::IoAt {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Create a corrupt-data error for `path` from any displayable error.
    ///
    /// # Examples
    ///
    /// ```
    /// use harvest_result::Error;
    ///
    /// let err = Error::corrupt("/data/part-valid-00000.parquet", "bad magic");
    /// assert!(err.to_string().contains("part-valid-00000"));
    /// ```
    #[inline]
    pub fn corrupt<E: fmt::Display>(path: impl AsRef<Path>, err: E) -> Self {
        Error::CorruptData {
            path: path.as_ref().to_path_buf(),
            message: err.to_string(),
        }
    }

    #[inline]
    pub fn invalid_filter(filter: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidFilter {
            filter: filter.into(),
            reason: reason.into(),
        }
    }

    #[inline]
    pub fn invalid_state(
        snapshot_id: i64,
        state: impl fmt::Display,
        operation: impl Into<String>,
    ) -> Self {
        Error::InvalidState {
            snapshot_id,
            state: state.to_string(),
            operation: operation.into(),
        }
    }

    /// Map a poisoned lock into an internal error.
    #[inline]
    pub fn poisoned<T>(_: std::sync::PoisonError<T>) -> Self {
        Error::Internal("lock poisoned".to_string())
    }

    /// Whether the error means "nothing stored here" rather than a failure.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Io(e) | Error::IoAt { source: e, .. } => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_at_includes_path() {
        let err = Error::io_at(
            "/tmp/snap/part-valid-00001.parquet.inprogress",
            io::Error::new(io::ErrorKind::Other, "disk full"),
        );
        let msg = err.to_string();
        assert!(msg.contains("part-valid-00001"));
        assert!(msg.contains("disk full"));
    }

    #[test]
    fn test_is_not_found() {
        assert!(Error::NotFound("snapshot 8".into()).is_not_found());
        assert!(Error::io_at("/x", io::Error::from(io::ErrorKind::NotFound)).is_not_found());
        assert!(!Error::Internal("x".into()).is_not_found());
    }

    #[test]
    fn test_invalid_state_message() {
        let err = Error::invalid_state(8, "CLOSED", "append");
        assert_eq!(
            err.to_string(),
            "Invalid state for snapshot 8: cannot append while CLOSED"
        );
    }
}
