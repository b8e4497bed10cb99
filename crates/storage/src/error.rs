//! Storage error types.

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

impl From<StorageError> for ferry_core::Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => ferry_core::Error::NotFound(key),
            StorageError::Io(e) => ferry_core::Error::Transient(format!("storage I/O: {e}")),
            StorageError::InvalidKey(_) | StorageError::InvalidRange(_) | StorageError::Config(_) => {
                ferry_core::Error::Internal(err.to_string())
            }
        }
    }
}
