use crate::core::CoreError;
use thiserror::Error;

/// Storage layer error type for the step store backends.
///
/// Wraps backend and serialization errors while preserving the error chain.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// A core serialization or deserialization error occurred.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// The backend could not be reached or rejected a command.
    #[error("connection error: {0}")]
    Connection(String),

    /// The stored value could not be interpreted.
    #[error("corrupt record in {bucket} at {field}: {reason}")]
    Corrupt {
        bucket: String,
        field: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, StorageError>;
