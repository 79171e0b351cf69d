//! Error types for accord-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{SpecId, TaskId};

/// All errors that can arise from document-store and structured-store access.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failure, with the path that caused it.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed frontmatter or JSON. Never guessed at or repaired.
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    /// Syntactically valid content whose shape does not match the expected state kind.
    #[error("unexpected structure in {path}: {message}")]
    Schema { path: PathBuf, message: String },

    /// No specification document carries this id.
    #[error("no specification document found for spec '{spec_id}'")]
    SpecNotFound { spec_id: SpecId },

    /// The specification exists but has no task with this id.
    #[error("spec '{spec_id}' has no task '{task_id}'")]
    TaskNotFound { spec_id: SpecId, task_id: TaskId },

    /// JSON serialization error (write path).
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization error (frontmatter write path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl StoreError {
    /// `true` for content that could not be parsed at all.
    pub fn is_parse(&self) -> bool {
        matches!(self, StoreError::Parse { .. })
    }
}

/// Errors from loading or validating [`crate::config::AccordConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error on load, with the offending file.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A value is outside its permitted range.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// `dirs::home_dir()` returned `None`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}

/// Convenience constructor for [`StoreError::Io`].
pub fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}
