/*
    errors.rs - Error types for the queue store

    Covers the persistence backend only. Delivery failures live in
    remote::RemoteError and never surface through the store.
*/

use thiserror::Error;

/// Errors that can occur in the queue store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Storage I/O error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Backend temporarily cannot be reached
    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Persisted queue could not be decoded
    #[error("Corrupted data: {0}")]
    CorruptedData(String),

    /// Item not found
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            StoreError::CorruptedData(err.to_string())
        } else {
            StoreError::Serialization(err.to_string())
        }
    }
}
