//! # accord-sync
//!
//! Consistency between the document store and the structured store.
//!
//! - [`validator`]: [`StateValidator`] checks each change and repairs what
//!   can be derived from one side
//! - [`engine`]: [`SyncEngine`] copies fields between the stores with
//!   backup and rollback
//! - [`resolver`]: [`ConflictResolver`] scores resolution strategies and
//!   queues manual intervention tickets

pub mod conflict;
pub mod engine;
pub mod error;
pub mod resolver;
pub mod validator;

pub use conflict::{Conflict, ConflictTimestamps, ConflictType};
pub use engine::{
    OperationState, StateChange, SyncDirection, SyncEngine, SyncOperation, SyncOptions, SyncStats,
};
pub use error::{EngineError, ResolverError};
pub use resolver::{
    ConflictResolver, ManualDecision, ManualInterventionTicket, ResolutionOutcome,
    ResolutionRecord, ResolutionState, ResolveOptions, ResolverStats, StrategyKind, TicketStatus,
};
pub use validator::{
    ConsistencyReport, Inconsistency, InconsistencyType, RepairStrategy, StateValidator,
    ValidationResult, ValidatorStats,
};
