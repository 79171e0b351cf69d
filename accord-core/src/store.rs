//! Store gateways: the contracts the sync core uses to read and mutate the
//! document store and the structured store.
//!
//! Implementations live in [`crate::fs_store`]; tests wrap them to inject
//! failures.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::StoreError;
use crate::frontmatter::{FieldUpdate, SpecDocument};
use crate::state::{AssignmentState, ProgressAggregate, ProgressState};
use crate::types::{AgentId, SpecId, StateKind, TaskEntry, TaskId, TaskStatus};

// ---------------------------------------------------------------------------
// Backups
// ---------------------------------------------------------------------------

/// What a backup was taken of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "store", rename_all = "snake_case")]
pub enum BackupTarget {
    Document { spec_id: SpecId, path: PathBuf },
    /// The records one spec owns inside a state file.
    Structured { kind: StateKind, spec_id: SpecId },
}

/// Point-in-time copy of one document, or of one spec's records in a state
/// file, taken immediately before a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    pub target: BackupTarget,
    /// `None` when the document did not exist; restoring removes it again.
    pub content: Option<String>,
    /// SHA-256 of `content` (hex), or of the empty string when absent.
    pub digest: String,
    pub taken_at: DateTime<Utc>,
}

impl Backup {
    pub fn new(target: BackupTarget, content: Option<String>) -> Self {
        let digest = digest_of(content.as_deref().unwrap_or(""));
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            target,
            content,
            digest,
            taken_at: Utc::now(),
        }
    }
}

/// Hex SHA-256 of `content`, line endings normalized.
pub fn digest_of(content: &str) -> String {
    let normalized = content.replace("\r\n", "\n");
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Write metadata
// ---------------------------------------------------------------------------

/// Who is writing, for history entries and logs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UpdateMetadata {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
}

impl UpdateMetadata {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            operation_id: None,
        }
    }

    pub fn with_operation(mut self, operation_id: impl Into<String>) -> Self {
        self.operation_id = Some(operation_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AssignmentMetadata {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Write time to record; defaults to now.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl AssignmentMetadata {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: Option<TaskStatus>) -> Self {
        self.status = status;
        self
    }
}

/// Result of [`StructuredStore::assign_task`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AssignOutcome {
    Created,
    Updated { previous_agent: AgentId },
    /// Record already held these values; nothing was written.
    Unchanged,
}

// ---------------------------------------------------------------------------
// Gateways
// ---------------------------------------------------------------------------

/// Human-editable specification documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read and parse a document. Unparseable content is [`StoreError::Parse`].
    async fn read_frontmatter(&self, path: &Path) -> Result<SpecDocument, StoreError>;

    /// Path of the document whose frontmatter `id` is `spec_id`.
    async fn locate(&self, spec_id: &SpecId) -> Result<PathBuf, StoreError>;

    /// Apply `updates` to the document for `spec_id` and rewrite it atomically.
    async fn update_frontmatter(
        &self,
        spec_id: &SpecId,
        updates: &[FieldUpdate],
        metadata: &UpdateMetadata,
    ) -> Result<(), StoreError>;

    async fn snapshot(&self, spec_id: &SpecId) -> Result<Backup, StoreError>;

    async fn restore(&self, backup: &Backup) -> Result<(), StoreError>;

    /// Read a document by spec id.
    async fn read_spec(&self, spec_id: &SpecId) -> Result<SpecDocument, StoreError> {
        let path = self.locate(spec_id).await?;
        self.read_frontmatter(&path).await
    }
}

/// Machine-maintained JSON state.
#[async_trait]
pub trait StructuredStore: Send + Sync {
    /// Raw JSON of one state file. Unparseable content is [`StoreError::Parse`].
    async fn read_state(&self, kind: StateKind) -> Result<Value, StoreError>;

    /// Upsert the assignment record for a task and append a history entry.
    async fn assign_task(
        &self,
        spec_id: &SpecId,
        task_id: &TaskId,
        agent: &AgentId,
        metadata: &AssignmentMetadata,
    ) -> Result<AssignOutcome, StoreError>;

    /// Rebuild the per-spec progress record from the document's tasks.
    async fn recompute_spec_state(
        &self,
        spec_id: &SpecId,
        tasks: &[TaskEntry],
        status: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Rebuild the progress aggregate from the per-spec breakdown.
    async fn recompute_aggregates(&self) -> Result<ProgressAggregate, StoreError>;

    /// Copy of the records `spec_id` owns in one state file. Other specs'
    /// records are not captured, and [`StructuredStore::restore`] leaves
    /// them as they are at restore time.
    async fn snapshot(&self, kind: StateKind, spec_id: &SpecId) -> Result<Backup, StoreError>;

    async fn restore(&self, backup: &Backup) -> Result<(), StoreError>;

    async fn read_assignments(&self) -> Result<AssignmentState, StoreError> {
        let raw = self.read_state(StateKind::Assignments).await?;
        typed(StateKind::Assignments, raw)
    }

    async fn read_progress(&self) -> Result<ProgressState, StoreError> {
        let raw = self.read_state(StateKind::Progress).await?;
        typed(StateKind::Progress, raw)
    }
}

fn typed<T: serde::de::DeserializeOwned>(kind: StateKind, raw: Value) -> Result<T, StoreError> {
    serde_json::from_value(raw).map_err(|e| StoreError::Schema {
        path: PathBuf::from(kind.file_name()),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_digest_covers_content() {
        let a = Backup::new(
            BackupTarget::Structured {
                kind: StateKind::Assignments,
                spec_id: SpecId::from("S"),
            },
            Some("{}".to_string()),
        );
        let b = Backup::new(
            BackupTarget::Structured {
                kind: StateKind::Assignments,
                spec_id: SpecId::from("S"),
            },
            None,
        );
        assert_eq!(a.digest, digest_of("{}"));
        assert_eq!(b.digest, digest_of(""));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn digest_ignores_line_ending_style() {
        assert_eq!(digest_of("a\r\nb\r\n"), digest_of("a\nb\n"));
    }
}
