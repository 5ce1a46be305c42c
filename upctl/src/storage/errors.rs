use std::io;

use thiserror::Error;

/// Failure reported by a storage backend.
///
/// Backends classify their native errors into these categories so that callers can decide
/// what to tell the client without knowing which store is behind the trait.
#[derive(Error, Debug)]
pub enum StorageError {
    /// No object exists under the requested key
    #[error("Object not found")]
    NotFound,

    /// The store refused the operation (credentials, bucket policy, filesystem permissions)
    #[error("Permission denied: {message}")]
    PermissionDenied { message: String },

    /// The store is out of space or the caller exceeded a quota
    #[error("Quota exceeded: {message}")]
    QuotaExceeded { message: String },

    /// The operation did not complete in time
    #[error("Timed out: {message}")]
    Timeout { message: String },

    /// The store could not be reached or reported a transient failure
    #[error("Store unavailable: {message}")]
    Unavailable { message: String },

    /// Catch-all for unclassified failures
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StorageError {
    /// Short description that is safe to return to clients.
    ///
    /// Unclassified errors are reduced to a generic phrase; the full chain only goes to logs.
    pub fn user_message(&self) -> String {
        match self {
            StorageError::NotFound => "object not found".to_string(),
            StorageError::PermissionDenied { message } => format!("permission denied ({message})"),
            StorageError::QuotaExceeded { message } => format!("quota exceeded ({message})"),
            StorageError::Timeout { message } => format!("timed out ({message})"),
            StorageError::Unavailable { message } => format!("store unavailable ({message})"),
            StorageError::Other(_) => "write failed".to_string(),
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound,
            io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => StorageError::PermissionDenied {
                message: err.to_string(),
            },
            io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded | io::ErrorKind::FileTooLarge => StorageError::QuotaExceeded {
                message: err.to_string(),
            },
            io::ErrorKind::TimedOut => StorageError::Timeout { message: err.to_string() },
            _ => StorageError::Other(anyhow::Error::from(err)),
        }
    }
}

/// Type alias for storage operation results
pub type Result<T> = std::result::Result<T, StorageError>;
