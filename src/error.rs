//! Error type shared by every VFS operation.

use thiserror::Error;

/// Error type for VFS operations.
///
/// Internal-inconsistency states (a backend reporting success for a creation
/// that raced another creation of the same name, cache bookkeeping that
/// contradicts itself) are bugs, not environment conditions; those panic
/// instead of surfacing here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VfsError {
    #[error("no such file or directory: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("is a directory: {0}")]
    IsADirectory(String),
    #[error("too many levels of symbolic links")]
    SymlinkLoop,
    #[error("cross-device link or rename")]
    CrossDevice,
    #[error("resource busy: {0}")]
    Busy(String),
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("operation not supported")]
    Unsupported,
    #[error("out of memory")]
    OutOfMemory,
}

/// Result type for VFS operations.
pub type Result<T> = std::result::Result<T, VfsError>;
