//! Error types for accord-bus.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by the bus API itself. Handler failures never surface here.
#[derive(Debug, Error)]
pub enum BusError {
    /// Registration or publish arguments were rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `publish` was called outside a tokio runtime, so the drain loop cannot run.
    #[error("no tokio runtime available to drain the event queue")]
    NoRuntime,
}

/// Why one handler invocation failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("handler timed out after {0:?}")]
    TimedOut(Duration),

    #[error("handler panicked: {0}")]
    Panicked(String),

    /// The handler task ended without producing a result.
    #[error("handler task cancelled")]
    Cancelled,
}

impl HandlerError {
    pub fn failed(message: impl std::fmt::Display) -> Self {
        HandlerError::Failed(message.to_string())
    }
}
