//! Error types for the idempotency store.

use thiserror::Error;

/// Result type alias for idempotency store operations.
pub type IdempotencyStoreResult<T> = Result<T, IdempotencyStoreError>;

/// Errors that can occur during idempotency store operations.
#[derive(Error, Debug)]
pub enum IdempotencyStoreError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with context
    #[error("idempotency store error: {0}")]
    Other(#[from] anyhow::Error),
}
