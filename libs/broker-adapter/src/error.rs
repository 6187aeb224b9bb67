//! Error types for broker adapters.

use thiserror::Error;

/// Errors surfaced by adapter lifecycle operations (`consume`, `ack`, `nack`, `close`).
///
/// `send` never returns this type — its failure modes are folded into
/// [`crate::SendOutcome`] so the dispatcher can tell a permanent broker
/// rejection from a transient one without matching on error internals.
#[derive(Error, Debug)]
pub enum BrokerAdapterError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("ack/nack failed: {0}")]
    Acknowledgment(String),

    #[error("raw handle did not originate from this adapter")]
    ForeignHandle,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
