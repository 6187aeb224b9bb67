//! Error types for the outbox store.

use thiserror::Error;

/// Result type alias for outbox store operations.
pub type OutboxStoreResult<T> = Result<T, OutboxStoreError>;

/// Errors that can occur during outbox store operations.
#[derive(Error, Debug)]
pub enum OutboxStoreError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// `commit()` or `rollback()` called with no open transaction (depth 0).
    ///
    /// Treated as a soft failure by the caller rather than propagated as a
    /// hard error, matching the graceful-degradation contract.
    #[error("no transaction is open")]
    NoTransaction,

    /// `begin()` called while a transaction was already open at this depth
    /// and the caller requested strict (non-nesting) semantics.
    #[error("transaction already open")]
    AlreadyInTransaction,

    /// Generic error with context
    #[error("outbox store error: {0}")]
    Other(#[from] anyhow::Error),
}
