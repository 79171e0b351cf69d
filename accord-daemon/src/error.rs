use std::path::PathBuf;

use thiserror::Error;

/// Error surface for the orchestrator, runtime, and socket protocol.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(#[from] accord_core::ConfigError),

    #[error("store error: {0}")]
    Store(#[from] accord_core::StoreError),

    #[error("event bus error: {0}")]
    Bus(#[from] accord_bus::BusError),

    #[error("resolver error: {0}")]
    Resolver(#[from] accord_sync::ResolverError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A component could not be constructed or wired; nothing was started.
    #[error("failed to initialize {component}: {message}")]
    Initialization {
        component: &'static str,
        message: String,
    },

    #[error("orchestrator is stopped; change rejected")]
    Stopped,

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    #[error("daemon is not running (socket missing: {socket})")]
    DaemonNotRunning { socket: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
