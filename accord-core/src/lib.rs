//! Accord core library: domain types, store gateways, config, errors.
//!
//! - [`types`]: newtypes, closed enumerations, change payloads
//! - [`frontmatter`]: specification document codec
//! - [`state`]: typed structured-store state
//! - [`store`]: [`DocumentStore`] / [`StructuredStore`] gateways and backups
//! - [`fs_store`]: filesystem implementations of both gateways
//! - [`config`]: `config.yaml` load / save / validate
//! - [`audit`], [`lock`], [`health`]: shared utilities for the sync components

pub mod audit;
pub mod config;
pub mod error;
pub mod frontmatter;
pub mod fs_store;
pub mod health;
pub mod lock;
pub mod state;
pub mod store;
pub mod types;

pub use audit::{AuditEntry, AuditLog};
pub use config::AccordConfig;
pub use error::{ConfigError, StoreError};
pub use frontmatter::{FieldTarget, FieldUpdate, SpecDocument};
pub use fs_store::{FsDocumentStore, FsStructuredStore};
pub use health::{ComponentHealth, HealthStatus};
pub use lock::SpecLocks;
pub use store::{
    AssignOutcome, AssignmentMetadata, Backup, BackupTarget, DocumentStore, StructuredStore,
    UpdateMetadata,
};
pub use types::{
    AgentId, ChangeKind, ChangePayload, FieldCategory, Impact, SemanticChange, Severity,
    SourceType, SpecId, StateKind, TaskEntry, TaskId, TaskStatus,
};
