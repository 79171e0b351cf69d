//! Error types for accord-sync.

use thiserror::Error;

use accord_bus::BusError;
use accord_core::error::StoreError;
use accord_core::types::SpecId;

/// Failures inside one sync operation. The engine converts these into an
/// operation in state `failed` or `rolled_back`; they never escape as errors
/// from the public sync calls.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Post-apply consistency check failed.
    #[error("validation gate failed for spec '{spec_id}': {details}")]
    ValidationGate { spec_id: SpecId, details: String },

    /// A restored file no longer matches its backup digest.
    #[error("rollback verification failed for {target}: expected digest {expected}, found {actual}")]
    RollbackMismatch {
        target: String,
        expected: String,
        actual: String,
    },

    #[error("invalid sync request: {0}")]
    InvalidRequest(String),
}

/// Errors returned by the conflict resolver's API.
#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("no manual intervention ticket with id '{0}'")]
    TicketNotFound(String),

    /// The ticket is already being processed by another caller.
    #[error("ticket '{0}' is already being processed")]
    TicketBusy(String),

    #[error("decision not applicable: {0}")]
    InvalidDecision(String),

    /// Applying the decision failed; the stores were rolled back.
    #[error("applying resolution failed: {0}")]
    ApplyFailed(String),

    #[error("event bus error: {0}")]
    Bus(#[from] BusError),
}
