//! Errors raised by instance persistence.

use thiserror::Error;

/// A result type using `StoreError`.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No instance record exists under the key.
    #[error("instance record not found")]
    NotFound,

    /// RocksDB rejected the operation.
    #[error("database error: {0}")]
    Database(String),

    /// CBOR encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The store was disposed.
    #[error("store is closed")]
    Closed,
}
