//! Error types for the dispatcher.

use thiserror::Error;

pub type DispatcherResult<T> = Result<T, DispatcherError>;

/// The only error a dispatch cycle can surface to its caller: a failure to
/// even read the pending batch. Everything downstream of that (a single
/// record's send/mark failure) is logged and folded into the retry/failed
/// state machine instead of propagated, per the "never abort the batch on
/// a single record's failure" contract.
#[derive(Error, Debug)]
pub enum DispatcherError {
    #[error("failed to fetch pending outbox records: {0}")]
    Store(#[from] outbox_store::OutboxStoreError),
}
