//! State validator: structural checks on each changed file, the cross-store
//! consistency check, and loss-free automated repair.
//!
//! Value disagreements between the stores are never repaired here; they are
//! reported as [`Conflict`]s for the resolver. Only inconsistencies whose fix
//! is derivable from one side (a missing assignment record, a stale progress
//! count) are repaired, and only when `repairs_enabled` is set. Repairs hold
//! the spec's lock, the one the sync engine and resolver write under.

use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use accord_core::audit::{AuditEntry, AuditLog};
use accord_core::config::ValidatorConfig;
use accord_core::error::StoreError;
use accord_core::frontmatter::SpecDocument;
use accord_core::health::{ComponentHealth, HealthStatus};
use accord_core::lock::SpecLocks;
use accord_core::state::{AssignmentState, ProgressAggregate, ProgressState, SpecProgress};
use accord_core::store::{AssignmentMetadata, DocumentStore, StructuredStore};
use accord_core::types::{
    ChangePayload, Severity, SourceType, SpecId, SpecPriority, SpecStatus, SpecType, StateKind,
    TaskEntry, TaskId, TaskStatus,
};

use crate::conflict::{Conflict, ConflictTimestamps, ConflictType};

const REQUIRED_FIELDS: [&str; 5] = ["id", "title", "status", "type", "priority"];
const REPAIR_SOURCE: &str = "validator_repair";

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InconsistencyType {
    Unreadable,
    UnknownStateFile,
    MissingRequiredField,
    InvalidEnumValue,
    InvalidTaskEntry,
    InvalidStructure,
    MissingStructuredAssignment,
    OrphanedAssignment,
    MissingProgressRecord,
    TaskCountMismatch,
    AggregateMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStrategy {
    /// Create the missing assignment record from document data.
    CreateAssignmentRecord,
    /// Rebuild the spec's progress record from its document tasks.
    RecomputeSpecState,
    RecomputeAggregates,
    /// Needs a human edit.
    Manual,
}

impl RepairStrategy {
    pub fn is_automatic(&self) -> bool {
        !matches!(self, RepairStrategy::Manual)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inconsistency {
    #[serde(rename = "type")]
    pub kind: InconsistencyType,
    pub severity: Severity,
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub description: String,
    pub repair_strategy: RepairStrategy,
    #[serde(default)]
    pub repaired: bool,
}

impl Inconsistency {
    fn new(
        kind: InconsistencyType,
        severity: Severity,
        field: impl Into<String>,
        description: impl Into<String>,
        repair_strategy: RepairStrategy,
    ) -> Self {
        Self {
            kind,
            severity,
            field: field.into(),
            task_id: None,
            description: description.into(),
            repair_strategy,
            repaired: false,
        }
    }

    fn manual(
        kind: InconsistencyType,
        severity: Severity,
        field: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self::new(kind, severity, field, description, RepairStrategy::Manual)
    }

    fn for_task(mut self, task_id: &TaskId) -> Self {
        self.task_id = Some(task_id.clone());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairRecord {
    #[serde(rename = "type")]
    pub kind: InconsistencyType,
    pub strategy: RepairStrategy,
    pub spec_id: Option<SpecId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Performance {
    pub duration_ms: f64,
    pub target_ms: u64,
    pub exceeded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub change_type: SourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_id: Option<SpecId>,
    pub file_path: PathBuf,
    pub inconsistencies: Vec<Inconsistency>,
    pub repairs_performed: Vec<RepairRecord>,
    pub conflicts: Vec<Conflict>,
    pub performance: Performance,
    pub validated_at: DateTime<Utc>,
}

impl ValidationResult {
    /// Inconsistencies still present after repair.
    pub fn unresolved(&self) -> impl Iterator<Item = &Inconsistency> {
        self.inconsistencies.iter().filter(|i| !i.repaired)
    }

    pub fn is_consistent(&self) -> bool {
        self.conflicts.is_empty() && self.unresolved().next().is_none()
    }
}

/// Outcome of the cross-store comparison for one spec, without repair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub spec_id: SpecId,
    pub inconsistencies: Vec<Inconsistency>,
    pub conflicts: Vec<Conflict>,
}

impl ConsistencyReport {
    fn new(spec_id: SpecId) -> Self {
        Self {
            spec_id,
            inconsistencies: Vec::new(),
            conflicts: Vec::new(),
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.inconsistencies.is_empty() && self.conflicts.is_empty()
    }

    /// Restrict to findings about `tasks`. Spec-wide findings (progress,
    /// aggregate) are kept only when `spec_wide` is set.
    pub fn concerning(&self, tasks: &BTreeSet<TaskId>, spec_wide: bool) -> ConsistencyReport {
        let relevant = |task: &Option<TaskId>| task.as_ref().map_or(spec_wide, |t| tasks.contains(t));
        ConsistencyReport {
            spec_id: self.spec_id.clone(),
            inconsistencies: self
                .inconsistencies
                .iter()
                .filter(|i| relevant(&i.task_id))
                .cloned()
                .collect(),
            conflicts: self
                .conflicts
                .iter()
                .filter(|c| relevant(&c.task_id))
                .cloned()
                .collect(),
        }
    }

    pub fn summary(&self) -> String {
        let mut parts: Vec<String> = self
            .inconsistencies
            .iter()
            .map(|i| i.description.clone())
            .collect();
        parts.extend(self.conflicts.iter().map(|c| c.description.clone()));
        parts.join("; ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidatorStats {
    pub validations: u64,
    pub inconsistencies_found: u64,
    pub repairs_performed: u64,
    pub repair_failures: u64,
    pub conflicts_raised: u64,
    pub slow_validations: u64,
    /// Rolling average over the configured stats window.
    pub average_latency_ms: f64,
}

#[derive(Default)]
struct StatsState {
    stats: ValidatorStats,
    latencies: VecDeque<f64>,
    consecutive_repair_failures: u32,
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

pub struct StateValidator {
    documents: Arc<dyn DocumentStore>,
    structured: Arc<dyn StructuredStore>,
    config: ValidatorConfig,
    locks: Arc<SpecLocks>,
    stats: Mutex<StatsState>,
    audit: AuditLog,
}

impl StateValidator {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        structured: Arc<dyn StructuredStore>,
        config: ValidatorConfig,
    ) -> Self {
        let audit = AuditLog::new(config.audit_capacity);
        Self {
            documents,
            structured,
            config,
            locks: Arc::new(SpecLocks::new()),
            stats: Mutex::new(StatsState::default()),
            audit,
        }
    }

    /// Share spec locks with the components that write the same stores.
    pub fn with_locks(mut self, locks: Arc<SpecLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Validate one change notification. Never fails: read and parse errors
    /// are reported inside the result.
    pub async fn validate_change(&self, payload: &ChangePayload) -> ValidationResult {
        let started = Instant::now();
        let mut result = ValidationResult {
            change_type: payload.source_type,
            spec_id: payload.spec_id.clone(),
            file_path: payload.file_path.clone(),
            inconsistencies: Vec::new(),
            repairs_performed: Vec::new(),
            conflicts: Vec::new(),
            performance: Performance {
                duration_ms: 0.0,
                target_ms: self.config.performance_target_ms,
                exceeded: false,
            },
            validated_at: Utc::now(),
        };

        let checked_doc = match payload.source_type {
            SourceType::Document => self.validate_document(payload, &mut result).await,
            SourceType::Structured => self.validate_structured(payload, &mut result).await,
        };

        if self.config.repairs_enabled {
            self.repair(checked_doc.as_ref(), &mut result).await;
        }

        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        result.performance.duration_ms = duration_ms;
        result.performance.exceeded = duration_ms > self.config.performance_target_ms as f64;
        if result.performance.exceeded {
            tracing::warn!(
                file = %payload.file_path.display(),
                duration_ms,
                target_ms = self.config.performance_target_ms,
                "validation exceeded performance target",
            );
        }
        self.record(&result);
        result
    }

    /// Cross-store check for one spec, without repair.
    pub async fn check_consistency(
        &self,
        spec_id: &SpecId,
        path: Option<&Path>,
    ) -> Result<ConsistencyReport, StoreError> {
        let doc = match path {
            Some(path) => self.documents.read_frontmatter(path).await?,
            None => self.documents.read_spec(spec_id).await?,
        };
        Ok(self.cross_check(spec_id, &doc, SourceType::Document).await)
    }

    // -----------------------------------------------------------------------
    // Document side
    // -----------------------------------------------------------------------

    async fn validate_document(
        &self,
        payload: &ChangePayload,
        result: &mut ValidationResult,
    ) -> Option<(SpecId, SpecDocument)> {
        let doc = match self.documents.read_frontmatter(&payload.file_path).await {
            Ok(doc) => doc,
            Err(err) => {
                self.read_failure(SourceType::Document, &payload.file_path, payload.spec_id.as_ref(), err, result);
                return None;
            }
        };
        if let Some(id) = doc.spec_id() {
            result.spec_id = Some(id);
        }
        check_document_structure(&doc, &self.config, &mut result.inconsistencies);

        let spec_id = result.spec_id.clone()?;
        if !payload.touches_critical_fields() {
            return None;
        }
        let report = self.cross_check(&spec_id, &doc, SourceType::Document).await;
        result.inconsistencies.extend(report.inconsistencies);
        result.conflicts.extend(report.conflicts);
        Some((spec_id, doc))
    }

    // -----------------------------------------------------------------------
    // Structured side
    // -----------------------------------------------------------------------

    async fn validate_structured(
        &self,
        payload: &ChangePayload,
        result: &mut ValidationResult,
    ) -> Option<(SpecId, SpecDocument)> {
        let Some(kind) = StateKind::from_path(&payload.file_path) else {
            result.inconsistencies.push(Inconsistency::manual(
                InconsistencyType::UnknownStateFile,
                Severity::Low,
                "file",
                format!("{} is not a known state file", payload.file_path.display()),
            ));
            return None;
        };

        let raw = match self.structured.read_state(kind).await {
            Ok(raw) => raw,
            Err(err) => {
                self.read_failure(SourceType::Structured, &payload.file_path, payload.spec_id.as_ref(), err, result);
                return None;
            }
        };
        if !check_state_shape(kind, &raw, &mut result.inconsistencies) {
            return None;
        }

        let cross = match (&payload.spec_id, payload.touches_critical_fields()) {
            (Some(spec_id), true) => match self.documents.read_spec(spec_id).await {
                Ok(doc) => Some((spec_id.clone(), doc)),
                Err(StoreError::SpecNotFound { .. }) => {
                    result.inconsistencies.push(Inconsistency::manual(
                        InconsistencyType::OrphanedAssignment,
                        Severity::Low,
                        "spec_id",
                        format!("state references spec '{spec_id}' but no document has that id"),
                    ));
                    None
                }
                Err(err) => {
                    let path = err_path(&err).unwrap_or_else(|| payload.file_path.clone());
                    self.read_failure(SourceType::Document, &path, Some(spec_id), err, result);
                    None
                }
            },
            _ => None,
        };

        match &cross {
            Some((spec_id, doc)) => {
                let report = self.cross_check(spec_id, doc, SourceType::Structured).await;
                result.inconsistencies.extend(report.inconsistencies);
                result.conflicts.extend(report.conflicts);
            }
            None if kind == StateKind::Progress => {
                if let Ok(progress) = serde_json::from_value::<ProgressState>(raw) {
                    check_aggregate(&progress, &mut result.inconsistencies);
                }
            }
            None => {}
        }
        cross
    }

    // -----------------------------------------------------------------------
    // Cross-store comparison
    // -----------------------------------------------------------------------

    async fn cross_check(
        &self,
        spec_id: &SpecId,
        doc: &SpecDocument,
        surfaced_by: SourceType,
    ) -> ConsistencyReport {
        let mut report = ConsistencyReport::new(spec_id.clone());
        let tasks = doc.tasks();

        match self.structured.read_assignments().await {
            Ok(assignments) => {
                compare_assignments(spec_id, doc, &tasks, &assignments, surfaced_by, &mut report)
            }
            Err(err) => self.state_read_failure(StateKind::Assignments, spec_id, err, &mut report),
        }
        match self.structured.read_progress().await {
            Ok(progress) => {
                compare_progress(spec_id, doc, &tasks, &progress, &mut report.inconsistencies)
            }
            Err(err) => self.state_read_failure(StateKind::Progress, spec_id, err, &mut report),
        }
        report
    }

    fn state_read_failure(
        &self,
        kind: StateKind,
        spec_id: &SpecId,
        err: StoreError,
        report: &mut ConsistencyReport,
    ) {
        match err {
            StoreError::Parse { path, message } => {
                report.conflicts.push(parse_conflict(SourceType::Structured, &path, Some(spec_id), &message));
            }
            StoreError::Schema { message, .. } => report.inconsistencies.push(Inconsistency::manual(
                InconsistencyType::InvalidStructure,
                Severity::High,
                kind.as_str(),
                message,
            )),
            other => report.inconsistencies.push(Inconsistency::manual(
                InconsistencyType::Unreadable,
                Severity::High,
                kind.as_str(),
                other.to_string(),
            )),
        }
    }

    fn read_failure(
        &self,
        source: SourceType,
        path: &Path,
        spec_id: Option<&SpecId>,
        err: StoreError,
        result: &mut ValidationResult,
    ) {
        match err {
            StoreError::Parse { path, message } => {
                tracing::warn!(file = %path.display(), error = %message, "unparseable content, manual intervention required");
                result.conflicts.push(parse_conflict(source, &path, spec_id, &message));
            }
            other => result.inconsistencies.push(Inconsistency::manual(
                InconsistencyType::Unreadable,
                Severity::High,
                "file",
                format!("{}: {other}", path.display()),
            )),
        }
    }

    // -----------------------------------------------------------------------
    // Repair
    // -----------------------------------------------------------------------

    async fn repair(&self, checked: Option<&(SpecId, SpecDocument)>, result: &mut ValidationResult) {
        let wanted: BTreeSet<RepairStrategy> = result
            .inconsistencies
            .iter()
            .filter(|i| !i.repaired)
            .map(|i| i.repair_strategy)
            .filter(RepairStrategy::is_automatic)
            .collect();
        if wanted.is_empty() {
            return;
        }

        let mut done: BTreeSet<RepairStrategy> = BTreeSet::new();
        let mut repaired_tasks: BTreeSet<TaskId> = BTreeSet::new();
        let mut failures = 0u32;

        let _guard = match checked {
            Some((spec_id, _)) => Some(self.locks.acquire(spec_id).await),
            None => None,
        };
        if let Some((spec_id, doc)) = checked {
            if wanted.contains(&RepairStrategy::CreateAssignmentRecord) {
                for inc in result.inconsistencies.iter().filter(|i| {
                    i.repair_strategy == RepairStrategy::CreateAssignmentRecord && !i.repaired
                }) {
                    let Some(task) = inc.task_id.as_ref().and_then(|id| doc.task(id)) else { continue };
                    let Some(agent) = task.assigned_agent.clone() else { continue };
                    let metadata = AssignmentMetadata {
                        source: REPAIR_SOURCE.to_string(),
                        status: task.task_status(),
                        notes: None,
                        timestamp: task.updated_at().or_else(|| doc.updated_at()),
                    };
                    match self.structured.assign_task(spec_id, &task.id, &agent, &metadata).await {
                        Ok(_) => {
                            repaired_tasks.insert(task.id.clone());
                        }
                        Err(err) => {
                            failures += 1;
                            tracing::error!(spec_id = %spec_id, task_id = %task.id, error = %err, "assignment repair failed");
                        }
                    }
                }
            }

            if wanted.contains(&RepairStrategy::RecomputeSpecState) {
                match self
                    .structured
                    .recompute_spec_state(spec_id, &doc.tasks(), doc.str_field("status"))
                    .await
                {
                    Ok(()) => {
                        done.insert(RepairStrategy::RecomputeSpecState);
                    }
                    Err(err) => {
                        failures += 1;
                        tracing::error!(spec_id = %spec_id, error = %err, "progress recompute failed");
                    }
                }
            }
        }

        if wanted.contains(&RepairStrategy::RecomputeAggregates) || done.contains(&RepairStrategy::RecomputeSpecState) {
            match self.structured.recompute_aggregates().await {
                Ok(_) => {
                    done.insert(RepairStrategy::RecomputeAggregates);
                }
                Err(err) => {
                    failures += 1;
                    done.remove(&RepairStrategy::RecomputeSpecState);
                    tracing::error!(error = %err, "aggregate recompute failed");
                }
            }
        }

        let spec_id = result.spec_id.clone();
        let mut records = Vec::new();
        for inc in result.inconsistencies.iter_mut().filter(|i| !i.repaired) {
            let fixed = match inc.repair_strategy {
                RepairStrategy::CreateAssignmentRecord => inc
                    .task_id
                    .as_ref()
                    .is_some_and(|t| repaired_tasks.contains(t)),
                RepairStrategy::RecomputeSpecState | RepairStrategy::RecomputeAggregates => {
                    done.contains(&inc.repair_strategy)
                }
                RepairStrategy::Manual => false,
            };
            if fixed {
                inc.repaired = true;
                records.push(RepairRecord {
                    kind: inc.kind,
                    strategy: inc.repair_strategy,
                    spec_id: spec_id.clone(),
                    task_id: inc.task_id.clone(),
                    description: inc.description.clone(),
                });
            }
        }

        for record in &records {
            tracing::info!(
                spec_id = ?record.spec_id,
                task_id = ?record.task_id,
                repair = ?record.strategy,
                "inconsistency repaired",
            );
            self.audit.record("repair_performed", json!(record));
        }
        result.repairs_performed.extend(records);

        let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        stats.stats.repair_failures += failures as u64;
        if failures > 0 {
            stats.consecutive_repair_failures += 1;
        } else {
            stats.consecutive_repair_failures = 0;
        }
    }

    // -----------------------------------------------------------------------
    // Stats / health
    // -----------------------------------------------------------------------

    fn record(&self, result: &ValidationResult) {
        {
            let mut state = self.stats.lock().unwrap_or_else(|p| p.into_inner());
            state.stats.validations += 1;
            state.stats.inconsistencies_found += result.inconsistencies.len() as u64;
            state.stats.repairs_performed += result.repairs_performed.len() as u64;
            state.stats.conflicts_raised += result.conflicts.len() as u64;
            if result.performance.exceeded {
                state.stats.slow_validations += 1;
            }
            let window = self.config.stats_window.max(1);
            if state.latencies.len() == window {
                state.latencies.pop_front();
            }
            state.latencies.push_back(result.performance.duration_ms);
            state.stats.average_latency_ms =
                state.latencies.iter().sum::<f64>() / state.latencies.len() as f64;
        }

        tracing::debug!(
            spec_id = ?result.spec_id,
            inconsistencies = result.inconsistencies.len(),
            repairs = result.repairs_performed.len(),
            conflicts = result.conflicts.len(),
            duration_ms = result.performance.duration_ms,
            "validation finished",
        );
        self.audit.record(
            "validation",
            json!({
                "spec_id": result.spec_id,
                "file": result.file_path,
                "inconsistencies": result.inconsistencies.len(),
                "repairs": result.repairs_performed.len(),
                "conflicts": result.conflicts.iter().map(|c| c.conflict_type).collect::<Vec<_>>(),
            }),
        );
    }

    pub fn stats(&self) -> ValidatorStats {
        self.stats
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .stats
            .clone()
    }

    pub fn audit_entries(&self, limit: usize) -> Vec<AuditEntry> {
        self.audit.recent(limit)
    }

    pub fn health(&self) -> ComponentHealth {
        let state = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        let mut health = ComponentHealth::healthy("state_validator").with_details(json!(state.stats));
        if state.consecutive_repair_failures >= 3 {
            health.flag(
                HealthStatus::Error,
                format!("{} consecutive validations with failed repairs", state.consecutive_repair_failures),
            );
        }
        if state.stats.average_latency_ms > self.config.performance_target_ms as f64 {
            health.flag(
                HealthStatus::Degraded,
                format!(
                    "average validation latency {:.1}ms above {}ms target",
                    state.stats.average_latency_ms, self.config.performance_target_ms
                ),
            );
        }
        health
    }
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

fn check_document_structure(
    doc: &SpecDocument,
    config: &ValidatorConfig,
    out: &mut Vec<Inconsistency>,
) {
    for field in REQUIRED_FIELDS {
        let present = match doc.fields.get(field) {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.trim().is_empty(),
            Some(_) => true,
        };
        if !present {
            out.push(Inconsistency::manual(
                InconsistencyType::MissingRequiredField,
                Severity::Medium,
                field,
                format!("required field '{field}' is missing"),
            ));
        }
    }

    check_enum(doc, "status", SpecStatus::parse, &SpecStatus::allowed_values(), out);
    check_enum(doc, "type", SpecType::parse, &SpecType::allowed_values(), out);
    check_enum(doc, "priority", SpecPriority::parse, &SpecPriority::allowed_values(), out);
    if let Some(agent) = doc.str_field("assigned_agent") {
        check_agent("assigned_agent", agent, config, out);
    }

    let Some(raw_tasks) = doc.fields.get("tasks") else { return };
    let Some(raw_tasks) = raw_tasks.as_array() else {
        out.push(Inconsistency::manual(
            InconsistencyType::InvalidTaskEntry,
            Severity::High,
            "tasks",
            "'tasks' must be a list",
        ));
        return;
    };

    let mut seen = BTreeSet::new();
    for (index, raw) in raw_tasks.iter().enumerate() {
        let Some(entry) = raw.as_object() else {
            out.push(Inconsistency::manual(
                InconsistencyType::InvalidTaskEntry,
                Severity::Medium,
                format!("tasks[{index}]"),
                format!("task #{index} is not a mapping"),
            ));
            continue;
        };
        let text = |key: &str| {
            entry
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.trim().is_empty())
        };
        for key in ["id", "title"] {
            if text(key).is_none() {
                out.push(Inconsistency::manual(
                    InconsistencyType::InvalidTaskEntry,
                    Severity::Medium,
                    format!("tasks[{index}].{key}"),
                    format!("task #{index} has no {key}"),
                ));
            }
        }
        if let Some(id) = text("id") {
            if !seen.insert(id.to_string()) {
                out.push(
                    Inconsistency::manual(
                        InconsistencyType::InvalidTaskEntry,
                        Severity::Medium,
                        format!("tasks[{index}].id"),
                        format!("duplicate task id '{id}'"),
                    )
                    .for_task(&TaskId::from(id)),
                );
            }
        }
        if let Some(status) = entry.get("status").and_then(Value::as_str) {
            if TaskStatus::parse(status).is_none() {
                out.push(Inconsistency::manual(
                    InconsistencyType::InvalidEnumValue,
                    Severity::Medium,
                    format!("tasks[{index}].status"),
                    format!(
                        "task status '{status}' is not one of {}",
                        TaskStatus::allowed_values().join(", ")
                    ),
                ));
            }
        }
        if let Some(agent) = entry.get("assigned_agent").and_then(Value::as_str) {
            check_agent(&format!("tasks[{index}].assigned_agent"), agent, config, out);
        }
    }
}

fn check_enum<T>(
    doc: &SpecDocument,
    field: &str,
    parse: fn(&str) -> Option<T>,
    allowed: &[&str],
    out: &mut Vec<Inconsistency>,
) {
    let Some(value) = doc.fields.get(field) else { return };
    let valid = value.as_str().is_some_and(|s| parse(s).is_some());
    if !valid && !value.is_null() {
        out.push(Inconsistency::manual(
            InconsistencyType::InvalidEnumValue,
            Severity::Medium,
            field,
            format!("{field} {value} is not one of {}", allowed.join(", ")),
        ));
    }
}

fn check_agent(field: &str, agent: &str, config: &ValidatorConfig, out: &mut Vec<Inconsistency>) {
    if !config.agent_allowed(agent) {
        out.push(Inconsistency::manual(
            InconsistencyType::InvalidEnumValue,
            Severity::Medium,
            field,
            format!(
                "agent '{agent}' is not one of {}",
                config.allowed_agents.join(", ")
            ),
        ));
    }
}

/// Top-level shape of a state file. Returns `false` if it is unusable.
fn check_state_shape(kind: StateKind, raw: &Value, out: &mut Vec<Inconsistency>) -> bool {
    // (key, expected to be a list rather than a map)
    let expect: &[(&str, bool)] = match kind {
        StateKind::Assignments => &[("assignments", false), ("history", true)],
        StateKind::Progress => &[("aggregate", false), ("specs", false)],
        StateKind::Handoffs => &[("pending", true), ("active", true), ("completed", true)],
    };

    if !raw.is_object() {
        out.push(Inconsistency::manual(
            InconsistencyType::InvalidStructure,
            Severity::High,
            kind.as_str(),
            format!("{} must contain a JSON object", kind.file_name()),
        ));
        return false;
    }
    let before = out.len();
    for &(key, list) in expect {
        let ok = raw
            .get(key)
            .is_some_and(|v| if list { v.is_array() } else { v.is_object() });
        if !ok {
            out.push(Inconsistency::manual(
                InconsistencyType::InvalidStructure,
                Severity::High,
                format!("{}.{key}", kind.as_str()),
                format!(
                    "{}: '{key}' must be a {}",
                    kind.file_name(),
                    if list { "list" } else { "map" }
                ),
            ));
        }
    }
    if out.len() > before {
        return false;
    }

    let typed = match kind {
        StateKind::Assignments => serde_json::from_value::<AssignmentState>(raw.clone()).err(),
        StateKind::Progress => serde_json::from_value::<ProgressState>(raw.clone()).err(),
        StateKind::Handoffs => None,
    };
    if let Some(err) = typed {
        out.push(Inconsistency::manual(
            InconsistencyType::InvalidStructure,
            Severity::High,
            kind.as_str(),
            format!("{}: {err}", kind.file_name()),
        ));
        return false;
    }
    true
}

fn compare_assignments(
    spec_id: &SpecId,
    doc: &SpecDocument,
    tasks: &[TaskEntry],
    assignments: &AssignmentState,
    surfaced_by: SourceType,
    report: &mut ConsistencyReport,
) {
    for task in tasks {
        let record = assignments.record(spec_id, &task.id);
        let doc_agent = task
            .assigned_agent
            .as_ref()
            .filter(|a| !a.as_str().trim().is_empty());
        let doc_time = task.updated_at().or_else(|| doc.updated_at());

        match (doc_agent, record) {
            (None, None) => {}
            (Some(agent), None) => report.inconsistencies.push(
                Inconsistency::new(
                    InconsistencyType::MissingStructuredAssignment,
                    Severity::Medium,
                    "assigned_agent",
                    format!("task {} is assigned to '{agent}' in the document but has no assignment record", task.id),
                    RepairStrategy::CreateAssignmentRecord,
                )
                .for_task(&task.id),
            ),
            (None, Some(record)) => report.inconsistencies.push(
                Inconsistency::manual(
                    InconsistencyType::OrphanedAssignment,
                    Severity::Low,
                    "assigned_agent",
                    format!(
                        "task {} is assigned to '{}' in the state but unassigned in the document",
                        task.id, record.agent
                    ),
                )
                .for_task(&task.id),
            ),
            (Some(agent), Some(record)) if agent != &record.agent => {
                let mut conflict = Conflict::new(
                    ConflictType::AgentAssignmentMismatch,
                    Severity::Medium,
                    surfaced_by,
                    "assigned_agent",
                    doc.path.clone(),
                );
                conflict.spec_id = Some(spec_id.clone());
                conflict.task_id = Some(task.id.clone());
                conflict.timestamps = ConflictTimestamps::between(doc_time, Some(record.updated_at));
                conflict.document_data = json!({
                    "value": agent,
                    "status": task.status,
                    "updated": doc_time,
                });
                conflict.structured_data = json!({
                    "value": record.agent,
                    "status": record.status,
                    "updated": record.updated_at,
                });
                conflict.description = format!(
                    "task {} assigned to '{agent}' in the document but '{}' in the state",
                    task.id, record.agent
                );
                report.conflicts.push(conflict);
            }
            (Some(_), Some(record)) => {
                let Some(status) = task.task_status() else { continue };
                if status == record.status {
                    continue;
                }
                let mut conflict = Conflict::new(
                    ConflictType::StatusMismatch,
                    Severity::Low,
                    surfaced_by,
                    "status",
                    doc.path.clone(),
                );
                conflict.spec_id = Some(spec_id.clone());
                conflict.task_id = Some(task.id.clone());
                conflict.timestamps = ConflictTimestamps::between(doc_time, Some(record.updated_at));
                conflict.document_data = json!({
                    "value": status,
                    "agent": record.agent,
                    "updated": doc_time,
                });
                conflict.structured_data = json!({
                    "value": record.status,
                    "agent": record.agent,
                    "updated": record.updated_at,
                });
                conflict.description = format!(
                    "task {} is '{status}' in the document but '{}' in the state",
                    task.id, record.status
                );
                report.conflicts.push(conflict);
            }
        }
    }

    if let Some(records) = assignments.assignments.get(spec_id) {
        let known: BTreeSet<&TaskId> = tasks.iter().map(|t| &t.id).collect();
        for (task_id, record) in records {
            if !known.contains(task_id) {
                report.inconsistencies.push(
                    Inconsistency::manual(
                        InconsistencyType::OrphanedAssignment,
                        Severity::Low,
                        "tasks",
                        format!(
                            "assignment record for task {task_id} ('{}') has no matching task in the document",
                            record.agent
                        ),
                    )
                    .for_task(task_id),
                );
            }
        }
    }
}

fn compare_progress(
    spec_id: &SpecId,
    doc: &SpecDocument,
    tasks: &[TaskEntry],
    progress: &ProgressState,
    out: &mut Vec<Inconsistency>,
) {
    let fresh = SpecProgress::from_tasks(tasks, doc.str_field("status"), Utc::now());
    match progress.specs.get(spec_id) {
        None if !tasks.is_empty() => out.push(Inconsistency::new(
            InconsistencyType::MissingProgressRecord,
            Severity::Low,
            "progress",
            format!("spec '{spec_id}' has {} task(s) but no progress record", tasks.len()),
            RepairStrategy::RecomputeSpecState,
        )),
        Some(existing) if !existing.same_counts(&fresh) => out.push(Inconsistency::new(
            InconsistencyType::TaskCountMismatch,
            Severity::Medium,
            "progress",
            format!(
                "progress for '{spec_id}' records {}/{} completed, document has {}/{}",
                existing.completed_tasks, existing.total_tasks, fresh.completed_tasks, fresh.total_tasks
            ),
            RepairStrategy::RecomputeSpecState,
        )),
        _ => {}
    }
    check_aggregate(progress, out);
}

fn check_aggregate(progress: &ProgressState, out: &mut Vec<Inconsistency>) {
    let expected = ProgressAggregate::from_specs(&progress.specs);
    if !progress.aggregate.same_counts(&expected) {
        out.push(Inconsistency::new(
            InconsistencyType::AggregateMismatch,
            Severity::Low,
            "aggregate",
            format!(
                "aggregate records {} task(s) across {} spec(s), breakdown sums to {} across {}",
                progress.aggregate.total_tasks,
                progress.aggregate.total_specs,
                expected.total_tasks,
                expected.total_specs
            ),
            RepairStrategy::RecomputeAggregates,
        ));
    }
}

fn parse_conflict(
    source: SourceType,
    path: &Path,
    spec_id: Option<&SpecId>,
    message: &str,
) -> Conflict {
    let mut conflict = Conflict::new(ConflictType::ParseError, Severity::High, source, "file", path);
    conflict.spec_id = spec_id.cloned();
    conflict.data_integrity = Some(0.0);
    conflict.description = format!("{} could not be parsed: {message}", path.display());
    let data = json!({ "error": message });
    match source {
        SourceType::Document => conflict.document_data = data,
        SourceType::Structured => conflict.structured_data = data,
    }
    conflict
}

fn err_path(err: &StoreError) -> Option<PathBuf> {
    match err {
        StoreError::Io { path, .. } | StoreError::Parse { path, .. } | StoreError::Schema { path, .. } => {
            Some(path.clone())
        }
        _ => None,
    }
}
