//! File-backed store gateways.
//!
//! # Storage layout
//!
//! ```text
//! <root>/
//!   specs/               (documents_dir: Markdown + YAML frontmatter, any depth)
//!     login.md
//!   .accord/
//!     state/             (state_dir: one JSON file per StateKind)
//!       assignments.json
//!       progress.json
//!       handoffs.json
//! ```
//!
//! Every write goes to a `.tmp` sibling and is renamed over the target, so a
//! reader never observes a half-written file.
//!
//! Structured backups hold only the backed-up spec's records. Restoring one
//! re-reads the file and splices those records back, so writes other specs
//! made in the meantime survive.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{io_err, StoreError};
use crate::frontmatter::{FieldTarget, FieldUpdate, SpecDocument};
use crate::state::{
    empty_state, AssignmentHistoryEntry, AssignmentRecord, AssignmentSlice, AssignmentState,
    ProgressAggregate, ProgressSlice, ProgressState, SpecProgress,
};
use crate::store::{
    AssignOutcome, AssignmentMetadata, Backup, BackupTarget, DocumentStore, StructuredStore,
    UpdateMetadata,
};
use crate::types::{AgentId, SpecId, StateKind, TaskEntry, TaskId};

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Write `content` to `path` via `<path>.tmp` + rename.
pub async fn write_atomic(path: &Path, content: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_err(parent, e))?;
    }
    let tmp = PathBuf::from(format!("{}.tmp", path.display()));
    tokio::fs::write(&tmp, content)
        .await
        .map_err(|e| io_err(&tmp, e))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(io_err(path, e));
    }
    Ok(())
}

async fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_err(path, err)),
    }
}

async fn restore_file(path: &Path, content: Option<&str>) -> Result<(), StoreError> {
    match content {
        Some(content) => write_atomic(path, content).await,
        None => match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_err(path, err)),
        },
    }
}

// ---------------------------------------------------------------------------
// Document store
// ---------------------------------------------------------------------------

/// Specification documents under one directory tree.
#[derive(Debug, Clone)]
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All `*.md` files under the root, sorted.
    async fn markdown_files(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut dirs = vec![self.root.clone()];
        let mut files = Vec::new();
        while let Some(dir) = dirs.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(io_err(&dir, err)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(&dir, e))? {
                let path = entry.path();
                let ty = entry.file_type().await.map_err(|e| io_err(&path, e))?;
                if ty.is_dir() {
                    dirs.push(path);
                } else if path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| ext.eq_ignore_ascii_case("md"))
                    .unwrap_or(false)
                {
                    files.push(path);
                }
            }
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn read_frontmatter(&self, path: &Path) -> Result<SpecDocument, StoreError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| io_err(path, e))?;
        SpecDocument::parse(path, &content)
    }

    async fn locate(&self, spec_id: &SpecId) -> Result<PathBuf, StoreError> {
        // Fast path: file named after the spec.
        let direct = self.root.join(format!("{spec_id}.md"));
        if let Ok(doc) = self.read_frontmatter(&direct).await {
            if doc.spec_id().as_ref() == Some(spec_id) {
                return Ok(direct);
            }
        }
        for path in self.markdown_files().await? {
            // Unparseable neighbours cannot be the document we want.
            let Ok(doc) = self.read_frontmatter(&path).await else {
                continue;
            };
            if doc.spec_id().as_ref() == Some(spec_id) {
                return Ok(path);
            }
        }
        Err(StoreError::SpecNotFound {
            spec_id: spec_id.clone(),
        })
    }

    async fn update_frontmatter(
        &self,
        spec_id: &SpecId,
        updates: &[FieldUpdate],
        metadata: &UpdateMetadata,
    ) -> Result<(), StoreError> {
        let path = self.locate(spec_id).await?;
        let mut doc = self.read_frontmatter(&path).await?;
        doc.apply(updates).map_err(|err| match err {
            StoreError::TaskNotFound { task_id, .. } => StoreError::TaskNotFound {
                spec_id: spec_id.clone(),
                task_id,
            },
            other => other,
        })?;
        let sets_updated = updates
            .iter()
            .any(|u| u.field == "updated" && u.target == FieldTarget::Spec);
        if !sets_updated {
            doc.fields.insert(
                "updated".to_string(),
                Value::String(Utc::now().to_rfc3339()),
            );
        }
        write_atomic(&path, &doc.render()?).await?;
        tracing::debug!(
            spec_id = %spec_id,
            path = %path.display(),
            fields = updates.len(),
            source = %metadata.source,
            "frontmatter updated",
        );
        Ok(())
    }

    async fn snapshot(&self, spec_id: &SpecId) -> Result<Backup, StoreError> {
        let path = self.locate(spec_id).await?;
        let content = read_optional(&path).await?;
        Ok(Backup::new(
            BackupTarget::Document {
                spec_id: spec_id.clone(),
                path,
            },
            content,
        ))
    }

    async fn restore(&self, backup: &Backup) -> Result<(), StoreError> {
        match &backup.target {
            BackupTarget::Document { path, .. } => {
                restore_file(path, backup.content.as_deref()).await
            }
            BackupTarget::Structured { kind, .. } => Err(StoreError::Schema {
                path: PathBuf::from(kind.file_name()),
                message: "structured backup handed to the document store".to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Structured store
// ---------------------------------------------------------------------------

/// JSON state files in one directory.
///
/// Read-modify-write cycles are serialized by an internal mutex so two
/// concurrent writers never interleave on the same file.
#[derive(Debug)]
pub struct FsStructuredStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FsStructuredStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self, kind: StateKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }

    async fn load_typed<T: serde::de::DeserializeOwned>(
        &self,
        kind: StateKind,
    ) -> Result<T, StoreError> {
        let path = self.state_path(kind);
        let raw = self.read_state(kind).await?;
        serde_json::from_value(raw).map_err(|e| StoreError::Schema {
            path,
            message: e.to_string(),
        })
    }

    async fn save<T: serde::Serialize>(&self, kind: StateKind, state: &T) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(state)?;
        write_atomic(&self.state_path(kind), &json).await
    }

    /// A state that reads as empty is stored as no file at all.
    async fn save_or_remove<T: serde::Serialize>(
        &self,
        kind: StateKind,
        state: &T,
        empty: bool,
    ) -> Result<(), StoreError> {
        if empty {
            restore_file(&self.state_path(kind), None).await
        } else {
            self.save(kind, state).await
        }
    }

    /// Serialized records `spec_id` owns in `kind`. Handoffs are not keyed
    /// by spec, so their slice is the whole file.
    async fn read_slice(
        &self,
        kind: StateKind,
        spec_id: &SpecId,
    ) -> Result<Option<String>, StoreError> {
        match kind {
            StateKind::Assignments => {
                let state: AssignmentState = self.load_typed(kind).await?;
                Ok(Some(serde_json::to_string(&AssignmentSlice::of(&state, spec_id))?))
            }
            StateKind::Progress => {
                let state: ProgressState = self.load_typed(kind).await?;
                Ok(Some(serde_json::to_string(&ProgressSlice::of(&state, spec_id))?))
            }
            StateKind::Handoffs => read_optional(&self.state_path(kind)).await,
        }
    }

    fn parse_slice<T: serde::de::DeserializeOwned + Default>(
        &self,
        kind: StateKind,
        content: Option<&str>,
    ) -> Result<T, StoreError> {
        match content {
            Some(content) => serde_json::from_str(content).map_err(|e| StoreError::Schema {
                path: self.state_path(kind),
                message: format!("backup slice: {e}"),
            }),
            None => Ok(T::default()),
        }
    }
}

#[async_trait]
impl StructuredStore for FsStructuredStore {
    async fn read_state(&self, kind: StateKind) -> Result<Value, StoreError> {
        let path = self.state_path(kind);
        let Some(content) = read_optional(&path).await? else {
            return Ok(empty_state(kind));
        };
        serde_json::from_str(&content).map_err(|e| StoreError::Parse {
            path,
            message: e.to_string(),
        })
    }

    async fn assign_task(
        &self,
        spec_id: &SpecId,
        task_id: &TaskId,
        agent: &AgentId,
        metadata: &AssignmentMetadata,
    ) -> Result<AssignOutcome, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut state: AssignmentState = self.load_typed(StateKind::Assignments).await?;
        let now = metadata.timestamp.unwrap_or_else(Utc::now);

        let tasks = state.assignments.entry(spec_id.clone()).or_default();
        let (outcome, status) = match tasks.get_mut(task_id) {
            Some(record) => {
                let status = metadata.status.unwrap_or(record.status);
                let notes = metadata.notes.clone().or_else(|| record.notes.clone());
                if &record.agent == agent && record.status == status && record.notes == notes {
                    return Ok(AssignOutcome::Unchanged);
                }
                let outcome = if &record.agent == agent {
                    AssignOutcome::Updated {
                        previous_agent: record.agent.clone(),
                    }
                } else {
                    let previous = std::mem::replace(&mut record.agent, agent.clone());
                    record.assigned_at = now;
                    AssignOutcome::Updated {
                        previous_agent: previous,
                    }
                };
                record.status = status;
                record.notes = notes;
                record.updated_at = now;
                (outcome, status)
            }
            None => {
                let status = metadata.status.unwrap_or_default();
                tasks.insert(
                    task_id.clone(),
                    AssignmentRecord {
                        agent: agent.clone(),
                        status,
                        assigned_at: now,
                        updated_at: now,
                        notes: metadata.notes.clone(),
                    },
                );
                (AssignOutcome::Created, status)
            }
        };

        let previous_agent = match &outcome {
            AssignOutcome::Updated { previous_agent } if previous_agent != agent => {
                Some(previous_agent.clone())
            }
            _ => None,
        };
        state.history.push(AssignmentHistoryEntry {
            spec_id: spec_id.clone(),
            task_id: task_id.clone(),
            agent: agent.clone(),
            previous_agent,
            status,
            source: metadata.source.clone(),
            timestamp: now,
        });

        self.save(StateKind::Assignments, &state).await?;
        tracing::debug!(
            spec_id = %spec_id,
            task_id = %task_id,
            agent = %agent,
            source = %metadata.source,
            "assignment written",
        );
        Ok(outcome)
    }

    async fn recompute_spec_state(
        &self,
        spec_id: &SpecId,
        tasks: &[TaskEntry],
        status: Option<&str>,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut progress: ProgressState = self.load_typed(StateKind::Progress).await?;
        let fresh = SpecProgress::from_tasks(tasks, status, Utc::now());
        if let Some(existing) = progress.specs.get(spec_id) {
            if existing.same_counts(&fresh) {
                return Ok(());
            }
        }
        progress.specs.insert(spec_id.clone(), fresh);
        self.save(StateKind::Progress, &progress).await
    }

    async fn recompute_aggregates(&self) -> Result<ProgressAggregate, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut progress: ProgressState = self.load_typed(StateKind::Progress).await?;
        let aggregate = ProgressAggregate::from_specs(&progress.specs);
        if !progress.aggregate.same_counts(&aggregate) {
            progress.aggregate = aggregate.clone();
            self.save(StateKind::Progress, &progress).await?;
        }
        Ok(aggregate)
    }

    async fn snapshot(&self, kind: StateKind, spec_id: &SpecId) -> Result<Backup, StoreError> {
        let _guard = self.write_lock.lock().await;
        let content = self.read_slice(kind, spec_id).await?;
        Ok(Backup::new(
            BackupTarget::Structured {
                kind,
                spec_id: spec_id.clone(),
            },
            content,
        ))
    }

    async fn restore(&self, backup: &Backup) -> Result<(), StoreError> {
        match &backup.target {
            BackupTarget::Structured { kind, spec_id } => {
                let _guard = self.write_lock.lock().await;
                let content = backup.content.as_deref();
                match kind {
                    StateKind::Assignments => {
                        let slice: AssignmentSlice = self.parse_slice(*kind, content)?;
                        let mut state: AssignmentState = self.load_typed(*kind).await?;
                        slice.restore_into(&mut state, spec_id);
                        let empty = state == AssignmentState::default();
                        self.save_or_remove(*kind, &state, empty).await
                    }
                    StateKind::Progress => {
                        let slice: ProgressSlice = self.parse_slice(*kind, content)?;
                        let mut state: ProgressState = self.load_typed(*kind).await?;
                        slice.restore_into(&mut state, spec_id);
                        let empty = state == ProgressState::default();
                        self.save_or_remove(*kind, &state, empty).await
                    }
                    StateKind::Handoffs => restore_file(&self.state_path(*kind), content).await,
                }
            }
            BackupTarget::Document { path, .. } => Err(StoreError::Schema {
                path: path.clone(),
                message: "document backup handed to the structured store".to_string(),
            }),
        }
    }
}
