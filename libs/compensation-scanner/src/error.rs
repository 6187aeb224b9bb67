//! Error types for the compensation scanner.

use thiserror::Error;

pub type ScannerResult<T> = Result<T, ScannerError>;

/// The only errors a scan cycle surfaces to its caller: failures to even
/// read the failed batch. A single record's compensator failure is logged
/// and folded back into the failed state, never propagated, per the
/// "never abort the batch" contract.
#[derive(Error, Debug)]
pub enum ScannerError {
    #[error("failed to fetch failed outbox records: {0}")]
    OutboxStore(#[from] outbox_store::OutboxStoreError),

    #[error("failed to fetch failed consumption records: {0}")]
    IdempotencyStore(#[from] idempotency_store::IdempotencyStoreError),
}
