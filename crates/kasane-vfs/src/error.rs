//! VFS error types.

use std::io;

use thiserror::Error;

/// Error type for the layered filesystem.
#[derive(Debug, Error)]
pub enum VfsError {
    /// Operation on a handle whose backing resource set is empty
    /// (deleted, or never materialized). Non-retryable.
    #[error("invalid handle: {0}")]
    Invalid(String),

    /// File or folder not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The filesystem or the target layer refuses writes.
    #[error("read-only: {0}")]
    ReadOnly(String),

    /// A second lock was requested while one is outstanding, or a
    /// mutation was attempted with a stale or foreign lock.
    #[error("already locked: {0}")]
    AlreadyLocked(String),

    /// Create targeting an occupied (unmasked) name.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Structural operation on a data file that needs a folder.
    #[error("not a folder: {0}")]
    NotAFolder(String),

    /// Rename or delete attempted on the root.
    #[error("operation not allowed on root")]
    NotRoot,

    /// Invalid child name (contains a separator, or is empty).
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// Attribute persistence failed after the retry budget; the original
    /// I/O cause is attached.
    #[error("attribute persistence failed: {path}")]
    PersistenceFailure {
        path: String,
        #[source]
        source: io::Error,
    },

    /// I/O error from a delegate.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl VfsError {
    /// Create an Invalid error.
    pub fn invalid(path: impl Into<String>) -> Self {
        Self::Invalid(path.into())
    }

    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create a ReadOnly error.
    pub fn read_only(path: impl Into<String>) -> Self {
        Self::ReadOnly(path.into())
    }

    /// Create an AlreadyLocked error.
    pub fn already_locked(path: impl Into<String>) -> Self {
        Self::AlreadyLocked(path.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    /// Create a NotAFolder error.
    pub fn not_a_folder(path: impl Into<String>) -> Self {
        Self::NotAFolder(path.into())
    }

    /// Create an InvalidName error.
    pub fn invalid_name(name: impl Into<String>) -> Self {
        Self::InvalidName(name.into())
    }

    /// Create a PersistenceFailure wrapping an I/O cause.
    pub fn persistence(path: impl Into<String>, source: io::Error) -> Self {
        Self::PersistenceFailure {
            path: path.into(),
            source,
        }
    }
}

/// Convert VfsError to std::io::Error for compatibility.
impl From<VfsError> for io::Error {
    fn from(e: VfsError) -> Self {
        match e {
            VfsError::Invalid(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            VfsError::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            VfsError::ReadOnly(msg) => io::Error::new(io::ErrorKind::PermissionDenied, msg),
            VfsError::AlreadyLocked(msg) => io::Error::new(io::ErrorKind::WouldBlock, msg),
            VfsError::AlreadyExists(msg) => io::Error::new(io::ErrorKind::AlreadyExists, msg),
            VfsError::NotAFolder(msg) => io::Error::new(io::ErrorKind::NotADirectory, msg),
            VfsError::NotRoot => {
                io::Error::new(io::ErrorKind::PermissionDenied, "operation not allowed on root")
            }
            VfsError::InvalidName(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            VfsError::PersistenceFailure { source, .. } => source,
            VfsError::Io(e) => e,
        }
    }
}

/// VFS result type.
pub type VfsResult<T> = Result<T, VfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_conversion_preserves_kind() {
        let e: io::Error = VfsError::already_exists("pkg/x.txt").into();
        assert_eq!(e.kind(), io::ErrorKind::AlreadyExists);

        let e: io::Error = VfsError::read_only("layer 0").into();
        assert_eq!(e.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_persistence_failure_keeps_cause() {
        let cause = io::Error::other("disk full");
        let e = VfsError::persistence("pkg", cause);
        let src = std::error::Error::source(&e).expect("cause attached");
        assert!(src.to_string().contains("disk full"));
    }
}
