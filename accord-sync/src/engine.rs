//! Sync engine: field-level synchronization between the two stores.
//!
//! Every operation follows the same sequence under the spec's lock:
//!
//! 1. Snapshot each document about to be written, and the spec's records
//!    in each state file about to be written.
//! 2. Apply the writes through the store gateways, recording each field.
//! 3. Re-run the consistency check for the touched tasks (validation gate).
//! 4. On any failure, restore the snapshots in reverse order and verify
//!    their digests. Other specs' state records are never rolled back.
//!
//! Operations never return errors. The outcome is the returned
//! [`SyncOperation`] plus a `sync_completed` / `sync_failed` event.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use accord_bus::{
    detached, handler_fn, topics, BusError, EventBus, HandlerError, HandlerId, HandlerOptions,
    PublishOptions,
};
use accord_core::audit::{AuditEntry, AuditLog};
use accord_core::config::SyncConfig;
use accord_core::frontmatter::{FieldUpdate, SpecDocument};
use accord_core::health::{ComponentHealth, HealthStatus};
use accord_core::lock::SpecLocks;
use accord_core::store::{
    AssignmentMetadata, Backup, BackupTarget, DocumentStore, StructuredStore, UpdateMetadata,
};
use accord_core::types::{
    AgentId, ChangeKind, ChangePayload, SemanticChange, SourceType, SpecId, StateKind, TaskId,
    TaskStatus,
};

use crate::error::EngineError;
use crate::validator::{StateValidator, ValidationResult};

const ENGINE_SOURCE: &str = "sync_engine";

// ---------------------------------------------------------------------------
// Operation model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    DocumentToStructured,
    StructuredToDocument,
    /// Writes one value to whichever store differs from it.
    Bidirectional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Pending,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Failed | OperationState::RolledBack
        )
    }
}

/// A backup as listed on an operation; the content stays with the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub target: BackupTarget,
    pub digest: String,
    pub taken_at: DateTime<Utc>,
}

impl From<&Backup> for BackupRecord {
    fn from(backup: &Backup) -> Self {
        Self {
            id: backup.id.clone(),
            target: backup.target.clone(),
            digest: backup.digest.clone(),
            taken_at: backup.taken_at,
        }
    }
}

/// One field written by an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedChange {
    /// Store that was written.
    pub store: SourceType,
    pub spec_id: SpecId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub field: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: String,
    #[serde(rename = "type")]
    pub op_type: SyncDirection,
    pub spec_ids: Vec<SpecId>,
    pub state: OperationState,
    pub backups: Vec<BackupRecord>,
    pub applied_changes: Vec<AppliedChange>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub rollback_performed: bool,
}

impl SyncOperation {
    fn new(op_type: SyncDirection, spec_ids: Vec<SpecId>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            op_type,
            spec_ids,
            state: OperationState::Pending,
            backups: Vec::new(),
            applied_changes: Vec::new(),
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            error: None,
            rollback_performed: false,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == OperationState::Completed
    }
}

/// Per-call overrides of the engine's configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncOptions {
    #[serde(default)]
    pub skip_backup: bool,
    #[serde(default)]
    pub skip_validation: bool,
    /// Recorded as the writer in store history; defaults to `sync_engine`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl SyncOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    fn writer(&self) -> &str {
        self.source.as_deref().unwrap_or(ENGINE_SOURCE)
    }
}

/// A structured-store field to be written into a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub spec_id: SpecId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub field: String,
    pub value: Value,
}

impl StateChange {
    pub fn new(spec_id: impl Into<SpecId>, field: impl Into<String>, value: Value) -> Self {
        Self {
            spec_id: spec_id.into(),
            task_id: None,
            field: field.into(),
            value,
        }
    }

    pub fn for_task(mut self, task_id: impl Into<TaskId>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

/// Frontmatter field a structured-store field is written to, if any.
pub fn document_field(field: &str) -> Option<&'static str> {
    match field {
        "updated" | "updated_at" | "assigned_at" | "completed_at" => Some("updated"),
        "notes" => Some("notes"),
        "progress" | "completion_rate" => Some("progress"),
        "agent" | "assigned_agent" | "assignment" => Some("assigned_agent"),
        "status" => Some("status"),
        _ => None,
    }
}

fn is_assignment_field(field: &str) -> bool {
    matches!(field, "assigned_agent" | "agent" | "assignment")
}

fn is_structure_change(change: &SemanticChange) -> bool {
    matches!(change.field.as_str(), "tasks" | "task" | "task_structure")
        || (change.task_id.is_some() && change.kind != ChangeKind::Modified)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStats {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub rolled_back: u64,
    pub slow: u64,
    pub average_duration_ms: f64,
}

/// What the validation gate must re-check after an operation.
#[derive(Default)]
struct GateScope {
    specs: BTreeMap<SpecId, (BTreeSet<TaskId>, bool)>,
}

impl GateScope {
    fn tasks(&mut self, spec_id: &SpecId, tasks: impl IntoIterator<Item = TaskId>) {
        self.specs.entry(spec_id.clone()).or_default().0.extend(tasks);
    }

    /// Include progress and aggregate findings for `spec_id`.
    fn spec_wide(&mut self, spec_id: &SpecId) {
        self.specs.entry(spec_id.clone()).or_default().1 = true;
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SyncEngine {
    documents: Arc<dyn DocumentStore>,
    structured: Arc<dyn StructuredStore>,
    validator: Arc<StateValidator>,
    bus: Arc<EventBus>,
    locks: Arc<SpecLocks>,
    config: SyncConfig,
    active: Mutex<HashMap<String, SyncOperation>>,
    history: Mutex<VecDeque<SyncOperation>>,
    stats: Mutex<SyncStats>,
    audit: AuditLog,
}

impl SyncEngine {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        structured: Arc<dyn StructuredStore>,
        validator: Arc<StateValidator>,
        bus: Arc<EventBus>,
        locks: Arc<SpecLocks>,
        config: SyncConfig,
    ) -> Self {
        let audit = AuditLog::new(config.audit_capacity);
        Self {
            documents,
            structured,
            validator,
            bus,
            locks,
            config,
            active: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            stats: Mutex::new(SyncStats::default()),
            audit,
        }
    }

    /// Subscribe to `validation_complete` so clean changes are propagated
    /// to the other store. The sync runs detached from the handler task, so
    /// a handler timeout never cuts an operation off before its rollback.
    pub fn subscribe(self: &Arc<Self>) -> Result<HandlerId, BusError> {
        let engine: Weak<SyncEngine> = Arc::downgrade(self);
        self.bus.register(
            topics::VALIDATION_COMPLETE,
            handler_fn(move |event| {
                let engine = engine.clone();
                async move {
                    let Some(engine) = engine.upgrade() else { return Ok(()) };
                    detached(async move { engine.handle_validation_complete(&event.data).await }).await
                }
            }),
            HandlerOptions::new(),
        )
    }

    /// Propagate a validated change. Changes whose validation raised
    /// conflicts are left to the resolver.
    pub async fn handle_validation_complete(&self, data: &Value) -> Result<(), HandlerError> {
        let payload: ChangePayload = serde_json::from_value(data["payload"].clone())
            .map_err(HandlerError::failed)?;
        let result: ValidationResult = serde_json::from_value(data["result"].clone())
            .map_err(HandlerError::failed)?;
        if !result.conflicts.is_empty() {
            tracing::debug!(
                file = %payload.file_path.display(),
                conflicts = result.conflicts.len(),
                "skipping sync, conflicts pending resolution",
            );
            return Ok(());
        }
        let Some(spec_id) = result.spec_id.clone().or_else(|| payload.spec_id.clone()) else {
            return Ok(());
        };

        let op = match payload.source_type {
            SourceType::Document => {
                self.sync_document_to_structured(
                    &spec_id,
                    Some(&payload.file_path),
                    &payload.semantic_changes,
                    SyncOptions::new(),
                )
                .await
            }
            SourceType::Structured => {
                let changes: Vec<StateChange> = payload
                    .semantic_changes
                    .iter()
                    .filter(|c| document_field(&c.field).is_some())
                    .filter_map(|c| {
                        let value = c.new_value.clone()?;
                        let change = StateChange::new(spec_id.clone(), c.field.clone(), value);
                        Some(match &c.task_id {
                            Some(task) => change.for_task(task.clone()),
                            None => change,
                        })
                    })
                    .collect();
                if changes.is_empty() {
                    return Ok(());
                }
                let kind = StateKind::from_path(&payload.file_path).unwrap_or(StateKind::Assignments);
                self.sync_structured_to_document(&changes, kind, SyncOptions::new())
                    .await
            }
        };

        match op.state {
            OperationState::Failed => Err(HandlerError::Failed(
                op.error.unwrap_or_else(|| "sync failed".to_string()),
            )),
            _ => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// Write a document's assignment/status/structure changes into the
    /// structured store. With no semantic changes every task is synced.
    pub async fn sync_document_to_structured(
        &self,
        spec_id: &SpecId,
        file_path: Option<&Path>,
        changes: &[SemanticChange],
        options: SyncOptions,
    ) -> SyncOperation {
        let mut op = self.begin(SyncDirection::DocumentToStructured, vec![spec_id.clone()]);
        let _guard = self.locks.acquire(spec_id).await;
        op.state = OperationState::InProgress;
        let started = Instant::now();
        let mut backups = Vec::new();
        let outcome = self
            .document_to_structured(&mut op, &mut backups, spec_id, file_path, changes, &options)
            .await;
        self.finish(op, backups, outcome, started).await
    }

    /// Write structured-store fields into their documents.
    pub async fn sync_structured_to_document(
        &self,
        changes: &[StateChange],
        kind: StateKind,
        options: SyncOptions,
    ) -> SyncOperation {
        let specs: BTreeSet<SpecId> = changes.iter().map(|c| c.spec_id.clone()).collect();
        let mut op = self.begin(SyncDirection::StructuredToDocument, specs.iter().cloned().collect());
        // Sorted acquisition order keeps multi-spec operations deadlock-free.
        let mut guards = Vec::with_capacity(specs.len());
        for spec_id in &specs {
            guards.push(self.locks.acquire(spec_id).await);
        }
        op.state = OperationState::InProgress;
        let started = Instant::now();
        let mut backups = Vec::new();
        tracing::debug!(operation_id = %op.id, kind = %kind, changes = changes.len(), "structured to document sync");
        let outcome = self
            .structured_to_document(&mut op, &mut backups, changes, &options)
            .await;
        self.finish(op, backups, outcome, started).await
    }

    /// Make both stores hold `value` for one field, writing only the side
    /// that differs. Used by the conflict resolver and manual decisions.
    pub async fn reconcile_field(
        &self,
        spec_id: &SpecId,
        task_id: Option<&TaskId>,
        field: &str,
        value: &Value,
        options: SyncOptions,
    ) -> SyncOperation {
        let mut op = self.begin(SyncDirection::Bidirectional, vec![spec_id.clone()]);
        let _guard = self.locks.acquire(spec_id).await;
        op.state = OperationState::InProgress;
        let started = Instant::now();
        let mut backups = Vec::new();
        let outcome = self
            .reconcile(&mut op, &mut backups, spec_id, task_id, field, value, &options)
            .await;
        self.finish(op, backups, outcome, started).await
    }

    // -----------------------------------------------------------------------
    // Apply steps
    // -----------------------------------------------------------------------

    async fn document_to_structured(
        &self,
        op: &mut SyncOperation,
        backups: &mut Vec<Backup>,
        spec_id: &SpecId,
        file_path: Option<&Path>,
        changes: &[SemanticChange],
        options: &SyncOptions,
    ) -> Result<(), EngineError> {
        let doc = match file_path {
            Some(path) => self.documents.read_frontmatter(path).await?,
            None => self.documents.read_spec(spec_id).await?,
        };
        if doc.spec_id().as_ref() != Some(spec_id) {
            return Err(EngineError::InvalidRequest(format!(
                "{} does not hold spec '{spec_id}'",
                doc.path.display()
            )));
        }
        let tasks = doc.tasks();

        let full = changes.is_empty();
        let mut assign: BTreeSet<TaskId> = BTreeSet::new();
        let mut recompute = full;
        for change in changes {
            if is_structure_change(change) || (change.field == "status" && change.task_id.is_none()) {
                recompute = true;
            }
            if let Some(task_id) = &change.task_id {
                if is_assignment_field(&change.field) {
                    assign.insert(task_id.clone());
                } else if change.field == "status" {
                    assign.insert(task_id.clone());
                    recompute = true;
                }
            }
        }
        if full || changes.iter().any(is_structure_change) {
            assign.extend(tasks.iter().map(|t| t.id.clone()));
        }
        // Tasks without an agent have no assignment record to write.
        let assign: Vec<_> = tasks
            .iter()
            .filter(|t| assign.contains(&t.id) && t.assigned_agent.is_some())
            .collect();

        if self.backups_enabled(options) {
            if !assign.is_empty() {
                self.backup_structured(op, backups, StateKind::Assignments, spec_id).await?;
            }
            if recompute {
                self.backup_structured(op, backups, StateKind::Progress, spec_id).await?;
            }
        }

        let metadata_for = |status: Option<TaskStatus>| AssignmentMetadata {
            source: options.writer().to_string(),
            status,
            notes: None,
            timestamp: None,
        };
        for task in &assign {
            let Some(agent) = &task.assigned_agent else { continue };
            let outcome = self
                .structured
                .assign_task(spec_id, &task.id, agent, &metadata_for(task.task_status()))
                .await?;
            tracing::debug!(operation_id = %op.id, spec_id = %spec_id, task_id = %task.id, ?outcome, "assignment synced");
            op.applied_changes.push(AppliedChange {
                store: SourceType::Structured,
                spec_id: spec_id.clone(),
                task_id: Some(task.id.clone()),
                field: "assigned_agent".to_string(),
                value: json!(agent),
            });
        }

        if recompute {
            self.structured
                .recompute_spec_state(spec_id, &tasks, doc.str_field("status"))
                .await?;
            let aggregate = self.structured.recompute_aggregates().await?;
            op.applied_changes.push(AppliedChange {
                store: SourceType::Structured,
                spec_id: spec_id.clone(),
                task_id: None,
                field: "progress".to_string(),
                value: json!(aggregate),
            });
        }

        let mut scope = GateScope::default();
        scope.tasks(spec_id, assign.iter().map(|t| t.id.clone()));
        if recompute {
            scope.spec_wide(spec_id);
        }
        self.gate(scope, options).await
    }

    async fn structured_to_document(
        &self,
        op: &mut SyncOperation,
        backups: &mut Vec<Backup>,
        changes: &[StateChange],
        options: &SyncOptions,
    ) -> Result<(), EngineError> {
        if let Some(bad) = changes.iter().find(|c| document_field(&c.field).is_none()) {
            return Err(EngineError::InvalidRequest(format!(
                "field '{}' has no document mapping",
                bad.field
            )));
        }

        let mut by_spec: BTreeMap<&SpecId, Vec<&StateChange>> = BTreeMap::new();
        for change in changes {
            by_spec.entry(&change.spec_id).or_default().push(change);
        }

        if self.backups_enabled(options) {
            for spec_id in by_spec.keys() {
                self.backup_document(op, backups, spec_id).await?;
            }
        }

        let metadata = UpdateMetadata::new(options.writer()).with_operation(op.id.clone());
        let mut scope = GateScope::default();
        for (spec_id, changes) in &by_spec {
            let updates: Vec<FieldUpdate> = changes
                .iter()
                .filter_map(|c| {
                    let field = document_field(&c.field)?;
                    Some(match &c.task_id {
                        Some(task) => FieldUpdate::task(task.clone(), field, c.value.clone()),
                        None => FieldUpdate::spec(field, c.value.clone()),
                    })
                })
                .collect();
            self.documents
                .update_frontmatter(spec_id, &updates, &metadata)
                .await?;

            for change in changes {
                op.applied_changes.push(AppliedChange {
                    store: SourceType::Document,
                    spec_id: (*spec_id).clone(),
                    task_id: change.task_id.clone(),
                    field: document_field(&change.field).unwrap_or_default().to_string(),
                    value: change.value.clone(),
                });
            }
            scope.tasks(spec_id, changes.iter().filter_map(|c| c.task_id.clone()));
        }
        self.gate(scope, options).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn reconcile(
        &self,
        op: &mut SyncOperation,
        backups: &mut Vec<Backup>,
        spec_id: &SpecId,
        task_id: Option<&TaskId>,
        field: &str,
        value: &Value,
        options: &SyncOptions,
    ) -> Result<(), EngineError> {
        let doc_field = document_field(field).unwrap_or(field);
        let doc = self.documents.read_spec(spec_id).await?;
        let current = document_value(&doc, task_id, doc_field);
        let write_document = current.as_ref() != Some(value);

        // Operational task fields also live in the assignment record.
        let record = match task_id {
            Some(task) if matches!(doc_field, "assigned_agent" | "status" | "notes") => self
                .structured
                .read_assignments()
                .await?
                .record(spec_id, task)
                .cloned(),
            _ => None,
        };
        let structured_write = match (task_id, doc_field) {
            (Some(_), "assigned_agent") => {
                let agent = value.as_str().filter(|s| !s.trim().is_empty()).ok_or_else(|| {
                    EngineError::InvalidRequest(format!("agent must be a non-empty string, got {value}"))
                })?;
                let agent = AgentId::from(agent);
                match &record {
                    Some(r) if r.agent == agent => None,
                    _ => Some((agent, None, None)),
                }
            }
            (Some(_), "status") => {
                let status = value.as_str().and_then(TaskStatus::parse).ok_or_else(|| {
                    EngineError::InvalidRequest(format!("{value} is not a task status"))
                })?;
                match &record {
                    Some(r) if r.status != status => Some((r.agent.clone(), Some(status), None)),
                    _ => None,
                }
            }
            (Some(_), "notes") => match (&record, value.as_str()) {
                (Some(r), Some(notes)) if r.notes.as_deref() != Some(notes) => {
                    Some((r.agent.clone(), None, Some(notes.to_string())))
                }
                _ => None,
            },
            _ => None,
        };
        let recompute = doc_field == "status" && write_document;

        if self.backups_enabled(options) {
            if write_document {
                self.backup_document(op, backups, spec_id).await?;
            }
            if structured_write.is_some() {
                self.backup_structured(op, backups, StateKind::Assignments, spec_id).await?;
            }
            if recompute {
                self.backup_structured(op, backups, StateKind::Progress, spec_id).await?;
            }
        }

        if write_document {
            let update = match task_id {
                Some(task) => FieldUpdate::task(task.clone(), doc_field, value.clone()),
                None => FieldUpdate::spec(doc_field, value.clone()),
            };
            let metadata = UpdateMetadata::new(options.writer()).with_operation(op.id.clone());
            self.documents
                .update_frontmatter(spec_id, &[update], &metadata)
                .await?;
            op.applied_changes.push(AppliedChange {
                store: SourceType::Document,
                spec_id: spec_id.clone(),
                task_id: task_id.cloned(),
                field: doc_field.to_string(),
                value: value.clone(),
            });
        }

        if let (Some(task), Some((agent, status, notes))) = (task_id, structured_write) {
            let metadata = AssignmentMetadata {
                source: options.writer().to_string(),
                status,
                notes,
                timestamp: None,
            };
            self.structured
                .assign_task(spec_id, task, &agent, &metadata)
                .await?;
            op.applied_changes.push(AppliedChange {
                store: SourceType::Structured,
                spec_id: spec_id.clone(),
                task_id: Some(task.clone()),
                field: doc_field.to_string(),
                value: value.clone(),
            });
        }

        if recompute {
            let doc = self.documents.read_spec(spec_id).await?;
            self.structured
                .recompute_spec_state(spec_id, &doc.tasks(), doc.str_field("status"))
                .await?;
            self.structured.recompute_aggregates().await?;
        }

        let mut scope = GateScope::default();
        scope.tasks(spec_id, task_id.cloned());
        if recompute {
            scope.spec_wide(spec_id);
        }
        self.gate(scope, options).await
    }

    // -----------------------------------------------------------------------
    // Backup / gate / rollback
    // -----------------------------------------------------------------------

    fn backups_enabled(&self, options: &SyncOptions) -> bool {
        self.config.backup && !options.skip_backup
    }

    async fn backup_structured(
        &self,
        op: &mut SyncOperation,
        backups: &mut Vec<Backup>,
        kind: StateKind,
        spec_id: &SpecId,
    ) -> Result<(), EngineError> {
        let backup = self.structured.snapshot(kind, spec_id).await?;
        op.backups.push(BackupRecord::from(&backup));
        backups.push(backup);
        Ok(())
    }

    async fn backup_document(
        &self,
        op: &mut SyncOperation,
        backups: &mut Vec<Backup>,
        spec_id: &SpecId,
    ) -> Result<(), EngineError> {
        let backup = self.documents.snapshot(spec_id).await?;
        op.backups.push(BackupRecord::from(&backup));
        backups.push(backup);
        Ok(())
    }

    async fn gate(&self, scope: GateScope, options: &SyncOptions) -> Result<(), EngineError> {
        if !self.config.validation_gate || options.skip_validation {
            return Ok(());
        }
        for (spec_id, (tasks, spec_wide)) in scope.specs {
            let report = self
                .validator
                .check_consistency(&spec_id, None)
                .await?
                .concerning(&tasks, spec_wide);
            if !report.is_consistent() {
                return Err(EngineError::ValidationGate {
                    spec_id,
                    details: report.summary(),
                });
            }
        }
        Ok(())
    }

    /// Restore `backups` newest first, then prove each file matches its
    /// snapshot digest.
    async fn rollback(&self, backups: &[Backup]) -> Result<(), EngineError> {
        for backup in backups.iter().rev() {
            match &backup.target {
                BackupTarget::Document { .. } => self.documents.restore(backup).await?,
                BackupTarget::Structured { .. } => self.structured.restore(backup).await?,
            }
        }
        for backup in backups {
            let current = match &backup.target {
                BackupTarget::Document { spec_id, .. } => self.documents.snapshot(spec_id).await?,
                BackupTarget::Structured { kind, spec_id } => {
                    self.structured.snapshot(*kind, spec_id).await?
                }
            };
            if current.digest != backup.digest {
                return Err(EngineError::RollbackMismatch {
                    target: describe_target(&backup.target),
                    expected: backup.digest.clone(),
                    actual: current.digest,
                });
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Bookkeeping
    // -----------------------------------------------------------------------

    fn begin(&self, op_type: SyncDirection, spec_ids: Vec<SpecId>) -> SyncOperation {
        let op = SyncOperation::new(op_type, spec_ids);
        self.active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(op.id.clone(), op.clone());
        op
    }

    async fn finish(
        &self,
        mut op: SyncOperation,
        backups: Vec<Backup>,
        outcome: Result<(), EngineError>,
        started: Instant,
    ) -> SyncOperation {
        match outcome {
            Ok(()) => op.state = OperationState::Completed,
            Err(err) => {
                op.error = Some(err.to_string());
                op.state = OperationState::Failed;
                if backups.is_empty() {
                    tracing::error!(operation_id = %op.id, error = %err, "sync failed before any backup was taken");
                } else {
                    match self.rollback(&backups).await {
                        Ok(()) => {
                            op.state = OperationState::RolledBack;
                            op.rollback_performed = true;
                            tracing::warn!(
                                operation_id = %op.id,
                                error = %err,
                                backups = backups.len(),
                                "sync failed, stores rolled back",
                            );
                        }
                        Err(rollback_err) => {
                            op.error = Some(format!("{err}; rollback failed: {rollback_err}"));
                            tracing::error!(
                                operation_id = %op.id,
                                error = %err,
                                rollback_error = %rollback_err,
                                "sync failed and rollback failed",
                            );
                        }
                    }
                }
            }
        }

        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        op.end_time = Some(Utc::now());
        op.duration_ms = Some(duration_ms);
        let slow = duration_ms > self.config.performance_target_ms as f64;
        if slow {
            tracing::warn!(
                operation_id = %op.id,
                duration_ms,
                target_ms = self.config.performance_target_ms,
                "sync exceeded performance target",
            );
        }

        self.record(&op, slow);
        self.announce(&op);
        op
    }

    fn record(&self, op: &SyncOperation, slow: bool) {
        self.active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&op.id);
        {
            let mut history = self.history.lock().unwrap_or_else(|p| p.into_inner());
            if history.len() >= self.config.history_capacity.max(1) {
                history.pop_front();
            }
            history.push_back(op.clone());
        }
        {
            let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
            stats.total += 1;
            match op.state {
                OperationState::Completed => stats.completed += 1,
                OperationState::RolledBack => {
                    stats.failed += 1;
                    stats.rolled_back += 1;
                }
                _ => stats.failed += 1,
            }
            if slow {
                stats.slow += 1;
            }
            let duration = op.duration_ms.unwrap_or_default();
            stats.average_duration_ms += (duration - stats.average_duration_ms) / stats.total as f64;
        }
        self.audit.record(
            "sync_operation",
            json!({
                "operation_id": op.id,
                "type": op.op_type,
                "spec_ids": op.spec_ids,
                "state": op.state,
                "changes": op.applied_changes.len(),
                "error": op.error,
            }),
        );
    }

    fn announce(&self, op: &SyncOperation) {
        let (event_type, data) = if op.succeeded() {
            (
                topics::SYNC_COMPLETED,
                json!({
                    "operationId": op.id,
                    "type": op.op_type,
                    "specIds": op.spec_ids,
                    "changes": op.applied_changes.len(),
                    "appliedChanges": op.applied_changes,
                    "durationMs": op.duration_ms,
                }),
            )
        } else {
            (
                topics::SYNC_FAILED,
                json!({
                    "operationId": op.id,
                    "type": op.op_type,
                    "specIds": op.spec_ids,
                    "state": op.state,
                    "error": op.error,
                    "rollbackPerformed": op.rollback_performed,
                }),
            )
        };
        if let Err(err) = self
            .bus
            .publish(event_type, data, PublishOptions::new().source(ENGINE_SOURCE))
        {
            tracing::warn!(operation_id = %op.id, error = %err, "failed to publish {event_type}");
        }
    }

    pub fn history(&self) -> Vec<SyncOperation> {
        self.history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn stats(&self) -> SyncStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn audit_entries(&self, limit: usize) -> Vec<AuditEntry> {
        self.audit.recent(limit)
    }

    pub fn health(&self) -> ComponentHealth {
        let stats = self.stats();
        let mut health = ComponentHealth::healthy("sync_engine").with_details(json!({
            "stats": stats,
            "active": self.active_count(),
        }));

        let recent_failures = self
            .history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .rev()
            .take_while(|op| !op.succeeded())
            .count();
        if recent_failures >= 3 {
            health.flag(
                HealthStatus::Error,
                format!("last {recent_failures} sync operations failed"),
            );
        } else if recent_failures > 0 {
            health.flag(HealthStatus::Degraded, "most recent sync operation failed");
        }
        if stats.average_duration_ms > self.config.performance_target_ms as f64 {
            health.flag(
                HealthStatus::Degraded,
                format!(
                    "average sync duration {:.0}ms above {}ms target",
                    stats.average_duration_ms, self.config.performance_target_ms
                ),
            );
        }
        health
    }
}

fn document_value(doc: &SpecDocument, task_id: Option<&TaskId>, field: &str) -> Option<Value> {
    match task_id {
        Some(task) => doc
            .raw_tasks()
            .iter()
            .find(|t| t.get("id").and_then(Value::as_str) == Some(task.as_str()))
            .and_then(|t| t.get(field))
            .cloned(),
        None => doc.fields.get(field).cloned(),
    }
    .filter(|v| !v.is_null())
}

fn describe_target(target: &BackupTarget) -> String {
    match target {
        BackupTarget::Document { spec_id, path } => format!("document {spec_id} ({})", path.display()),
        BackupTarget::Structured { kind, spec_id } => {
            format!("state {} ({spec_id})", kind.file_name())
        }
    }
}
