//! Error types for the transactional producer.

use thiserror::Error;

/// Result type alias for producer operations.
pub type ProducerResult<T> = Result<T, ProducerError>;

/// Errors surfaced by the producer. Only the `InvariantViolation` and
/// `SaveFailed` variants cross the API boundary back to business callers
/// per the propagation policy; everything else downstream (broker, ledger)
/// is absorbed elsewhere in the pipeline.
#[derive(Error, Debug)]
pub enum ProducerError {
    /// `begin()` called while a transaction was already open on this producer.
    #[error("producer already has an open transaction")]
    AlreadyInTransaction,

    /// `prepare()` called outside an open transaction.
    #[error("producer has no open transaction")]
    NotInTransaction,

    /// A staged message failed to persist; the whole batch (and the host's
    /// broader DB transaction) was rolled back.
    #[error("failed to save staged message {message_id}: {source}")]
    SaveFailed {
        message_id: String,
        #[source]
        source: outbox_store::OutboxStoreError,
    },

    #[error(transparent)]
    Store(#[from] outbox_store::OutboxStoreError),
}
