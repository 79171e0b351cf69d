//! Orchestrator daemon: wires bus, validator, sync engine, and resolver, and
//! serves the control socket.

pub mod analyzer;
mod error;
pub mod health;
pub mod orchestrator;
pub mod paths;
pub mod protocol;
mod runtime;

pub use analyzer::{should_validate, ChangeAnalysis, ChangeAnalyzer, SemanticAnalyzer};
pub use error::DaemonError;
pub use health::{OverallHealth, SystemHealth};
pub use orchestrator::{Collaborators, Orchestrator, OrchestratorStats, StatusReport, StopReport};
pub use protocol::{
    request_change, request_dead_letters, request_replay, request_resolve, request_status,
    request_stop, request_tickets, send_request, DaemonRequest, DaemonResponse,
};
pub use runtime::{build_orchestrator, dispatch, init_tracing, run, start_blocking};
