//! Error types shared by every layer of the filesystem stack.
//!
//! Backends, decorators, the jail and the request core all report failures
//! through [`UfsError`]. Host I/O errors are mapped onto the structured
//! variants where a standard kind exists and carried opaquely otherwise.

use std::io;
use thiserror::Error;

/// Why a raw string could not become a [`UfsPath`](crate::UfsPath).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PathError {
    /// The raw path was the empty string.
    #[error("path is empty")]
    Empty,

    /// The raw path contained a NUL byte.
    #[error("path contains a NUL byte")]
    NulByte,

    /// A single segment was longer than [`MAX_SEGMENT_LEN`](crate::path::MAX_SEGMENT_LEN).
    #[error("path segment is longer than 255 bytes")]
    SegmentTooLong,

    /// A `..` segment tried to climb above the root.
    #[error("path climbs above the root")]
    AboveRoot,

    /// An absolute path was given where a relative fragment was expected.
    #[error("absolute path given as a relative fragment")]
    AbsoluteFragment,
}

/// Errors reported by filesystem operations.
#[derive(Debug, Error)]
pub enum UfsError {
    /// The path could not be normalized.
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: PathError },

    /// The path, or a symlink on the way to it, resolves outside the jail root.
    #[error("path escapes the jail root: {path}")]
    PathEscape { path: String },

    /// Symlink resolution exceeded the configured depth.
    #[error("too many levels of symbolic links: {path}")]
    TooManyLinks { path: String },

    #[error("no such file or directory: {path}")]
    NotFound { path: String },

    #[error("file exists: {path}")]
    AlreadyExists { path: String },

    #[error("not a directory: {path}")]
    NotADirectory { path: String },

    #[error("is a directory: {path}")]
    IsADirectory { path: String },

    #[error("directory not empty: {path}")]
    DirectoryNotEmpty { path: String },

    /// The request was cancelled before it produced a result.
    #[error("request cancelled")]
    Cancelled,

    /// The request's deadline passed before it produced a result.
    #[error("request timed out")]
    Timeout,

    /// The request core is shutting down and accepts no more work.
    #[error("request core is shutting down")]
    CoreShutdown,

    /// The file handle is unknown to the backend.
    #[error("invalid file handle: {0}")]
    InvalidHandle(u64),

    /// A mutation was attempted through a read-only layer.
    #[error("filesystem is read-only")]
    ReadOnly,

    /// The backend does not implement the operation.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// Any other backend failure, carried unchanged.
    #[error("backend error: {0}")]
    Backend(io::Error),
}

/// Result type for filesystem operations.
pub type UfsResult<T> = Result<T, UfsError>;

impl UfsError {
    /// Builds an error for `path` from a host I/O error.
    ///
    /// Standard kinds become their structured variant; everything else is
    /// wrapped in [`UfsError::Backend`].
    pub fn from_io(err: io::Error, path: impl Into<String>) -> Self {
        let path = path.into();
        match err.kind() {
            io::ErrorKind::NotFound => UfsError::NotFound { path },
            io::ErrorKind::AlreadyExists => UfsError::AlreadyExists { path },
            io::ErrorKind::NotADirectory => UfsError::NotADirectory { path },
            io::ErrorKind::IsADirectory => UfsError::IsADirectory { path },
            io::ErrorKind::DirectoryNotEmpty => UfsError::DirectoryNotEmpty { path },
            io::ErrorKind::ReadOnlyFilesystem => UfsError::ReadOnly,
            _ => UfsError::Backend(err),
        }
    }

    pub(crate) fn invalid_path(path: &str, reason: PathError) -> Self {
        UfsError::InvalidPath {
            path: path.to_string(),
            reason,
        }
    }

    pub(crate) fn escape(path: impl ToString) -> Self {
        UfsError::PathEscape {
            path: path.to_string(),
        }
    }

    /// Returns true for errors raised by containment checks.
    ///
    /// These are produced before any backend call is made.
    pub fn is_containment(&self) -> bool {
        matches!(
            self,
            UfsError::InvalidPath { .. } | UfsError::PathEscape { .. } | UfsError::TooManyLinks { .. }
        )
    }

    /// Returns true for errors produced by the request core itself.
    pub fn is_scheduling(&self) -> bool {
        matches!(
            self,
            UfsError::Cancelled | UfsError::Timeout | UfsError::CoreShutdown
        )
    }
}

impl From<io::Error> for UfsError {
    fn from(err: io::Error) -> Self {
        UfsError::from_io(err, String::new())
    }
}
