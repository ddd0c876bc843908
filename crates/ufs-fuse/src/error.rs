//! Mapping from filesystem errors to POSIX error codes.
//!
//! Every reply to the kernel that is not a success carries one errno. The
//! [`ToErrno`] trait is the single place where [`UfsError`] variants are
//! turned into those codes.

use std::io;
use ufs_core::UfsError;

/// Extension trait to convert errors to errno.
pub trait ToErrno {
    /// Converts this error to a libc error code.
    fn to_errno(&self) -> i32;
}

impl ToErrno for UfsError {
    fn to_errno(&self) -> i32 {
        match self {
            UfsError::InvalidPath { .. } => libc::EINVAL,
            UfsError::PathEscape { .. } => libc::EACCES,
            UfsError::TooManyLinks { .. } => libc::ELOOP,
            UfsError::NotFound { .. } => libc::ENOENT,
            UfsError::AlreadyExists { .. } => libc::EEXIST,
            UfsError::NotADirectory { .. } => libc::ENOTDIR,
            UfsError::IsADirectory { .. } => libc::EISDIR,
            UfsError::DirectoryNotEmpty { .. } => libc::ENOTEMPTY,
            UfsError::Cancelled => libc::ECANCELED,
            UfsError::Timeout => libc::ETIMEDOUT,
            UfsError::CoreShutdown => libc::ESHUTDOWN,
            UfsError::InvalidHandle(_) => libc::EBADF,
            UfsError::ReadOnly => libc::EROFS,
            UfsError::Unsupported(_) => libc::ENOTSUP,
            UfsError::Backend(e) => e.to_errno(),
        }
    }
}

impl ToErrno for io::Error {
    /// Uses the raw OS error when there is one, otherwise maps the kind.
    fn to_errno(&self) -> i32 {
        if let Some(code) = self.raw_os_error() {
            return code;
        }
        match self.kind() {
            io::ErrorKind::NotFound => libc::ENOENT,
            io::ErrorKind::PermissionDenied => libc::EACCES,
            io::ErrorKind::AlreadyExists => libc::EEXIST,
            io::ErrorKind::InvalidInput => libc::EINVAL,
            io::ErrorKind::TimedOut => libc::ETIMEDOUT,
            io::ErrorKind::Unsupported => libc::ENOTSUP,
            io::ErrorKind::StorageFull => libc::ENOSPC,
            io::ErrorKind::FileTooLarge => libc::EFBIG,
            _ => libc::EIO,
        }
    }
}
