//! Conflict resolver: confidence-scored automatic resolution with human
//! escalation.
//!
//! Every conflict passed to [`ConflictResolver::resolve_conflict`] ends in
//! exactly one of two ways: its value is applied to both stores through
//! [`SyncEngine::reconcile_field`], or exactly one
//! [`ManualInterventionTicket`] is queued for it. A failed automatic apply
//! is rolled back by the engine and then escalated.

pub mod confidence;
pub mod strategy;
pub mod tickets;

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use accord_bus::{
    detached, handler_fn, topics, BusError, EventBus, HandlerId, HandlerOptions, Priority,
    PublishOptions,
};
use accord_core::audit::{AuditEntry, AuditLog};
use accord_core::config::{ResolverConfig, ValidatorConfig};
use accord_core::health::{ComponentHealth, HealthStatus};
use accord_core::store::StructuredStore;
use accord_core::types::SourceType;

use crate::conflict::{Conflict, ConflictType};
use crate::engine::{SyncEngine, SyncOperation, SyncOptions};
use crate::error::ResolverError;
use crate::validator::ValidationResult;

pub use confidence::{confidence, time_score, ConfidenceFactors};
pub use strategy::{AssignmentRules, StrategyEvaluation, StrategyKind};
pub use tickets::{ManualInterventionTicket, TicketContext, TicketStatus};

use tickets::TicketQueue;

const RESOLVER_SOURCE: &str = "conflict_resolver";
const MANUAL_SOURCE: &str = "manual_resolution";

/// Callback invoked with every newly queued ticket.
pub type Notifier = Arc<dyn Fn(&ManualInterventionTicket) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionState {
    Analyzing,
    AutoResolving,
    Resolved,
    AwaitingManualIntervention,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionRecord {
    pub id: String,
    pub conflict: Conflict,
    pub state: ResolutionState,
    pub strategy: StrategyKind,
    pub confidence: f64,
    pub automatic: bool,
    pub backup_created: bool,
    pub resolution_steps: Vec<String>,
    pub evaluations: Vec<StrategyEvaluation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
}

impl ResolutionRecord {
    fn new(conflict: Conflict) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conflict,
            state: ResolutionState::Analyzing,
            strategy: StrategyKind::Manual,
            confidence: 0.0,
            automatic: false,
            backup_created: false,
            resolution_steps: Vec::new(),
            evaluations: Vec::new(),
            operation_id: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
        }
    }

    fn step(&mut self, step: impl Into<String>) {
        self.resolution_steps.push(step.into());
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionOutcome {
    Resolved(ResolutionRecord),
    Escalated {
        record: ResolutionRecord,
        ticket: ManualInterventionTicket,
    },
}

impl ResolutionOutcome {
    pub fn record(&self) -> &ResolutionRecord {
        match self {
            ResolutionOutcome::Resolved(record) => record,
            ResolutionOutcome::Escalated { record, .. } => record,
        }
    }

    pub fn ticket(&self) -> Option<&ManualInterventionTicket> {
        match self {
            ResolutionOutcome::Resolved(_) => None,
            ResolutionOutcome::Escalated { ticket, .. } => Some(ticket),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolveOptions {
    /// Overrides the conflict's own integrity score.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_integrity: Option<f64>,
    /// Skip scoring and queue a ticket.
    #[serde(default)]
    pub force_manual: bool,
}

/// A human's decision on a ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "value", rename_all = "snake_case")]
pub enum ManualDecision {
    UseDocument,
    UseStructured,
    Custom(Value),
    /// Close the ticket without writing; the stores were fixed by hand.
    Dismiss,
}

struct ApplyFailure {
    error: String,
    /// Absent when the conflict could not be applied at all.
    operation: Option<SyncOperation>,
}

impl ApplyFailure {
    fn rolled_back(&self) -> bool {
        self.operation.as_ref().is_some_and(|op| op.rollback_performed)
    }

    fn backup_created(&self) -> bool {
        self.operation.as_ref().is_some_and(|op| !op.backups.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolverStats {
    pub total_conflicts: u64,
    pub automatic_resolutions: u64,
    pub manual_resolutions: u64,
    pub escalations: u64,
    pub rollbacks: u64,
    pub failed_applications: u64,
    pub high_confidence: u64,
    pub low_confidence: u64,
    pub average_resolution_ms: f64,
    #[serde(skip)]
    resolved_count: u64,
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

pub struct ConflictResolver {
    engine: Arc<SyncEngine>,
    structured: Arc<dyn StructuredStore>,
    bus: Arc<EventBus>,
    config: ResolverConfig,
    allowed_agents: Vec<String>,
    max_tasks_per_agent: usize,
    tickets: Mutex<TicketQueue>,
    active: Mutex<HashMap<String, ResolutionRecord>>,
    history: Mutex<VecDeque<ResolutionRecord>>,
    notifiers: Mutex<Vec<Notifier>>,
    stats: Mutex<ResolverStats>,
    audit: AuditLog,
}

impl ConflictResolver {
    pub fn new(
        engine: Arc<SyncEngine>,
        structured: Arc<dyn StructuredStore>,
        bus: Arc<EventBus>,
        config: ResolverConfig,
        validator: &ValidatorConfig,
    ) -> Self {
        let audit = AuditLog::new(config.audit_capacity);
        Self {
            engine,
            structured,
            bus,
            allowed_agents: validator.allowed_agents.clone(),
            max_tasks_per_agent: validator.max_tasks_per_agent,
            config,
            tickets: Mutex::new(TicketQueue::default()),
            active: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            notifiers: Mutex::new(Vec::new()),
            stats: Mutex::new(ResolverStats::default()),
            audit,
        }
    }

    /// Resolve every conflict carried by a `validation_complete` event.
    pub fn subscribe(self: &Arc<Self>) -> Result<HandlerId, BusError> {
        let resolver: Weak<ConflictResolver> = Arc::downgrade(self);
        self.bus.register(
            topics::VALIDATION_COMPLETE,
            handler_fn(move |event| {
                let resolver = resolver.clone();
                async move {
                    let Some(resolver) = resolver.upgrade() else { return Ok(()) };
                    let result: ValidationResult =
                        serde_json::from_value(event.data["result"].clone())
                            .map_err(accord_bus::HandlerError::failed)?;
                    // Resolutions write both stores; keep them out of reach of
                    // the handler timeout.
                    detached(async move {
                        for conflict in result.conflicts {
                            resolver.resolve_conflict(conflict, ResolveOptions::default()).await;
                        }
                        Ok(())
                    })
                    .await
                }
            }),
            HandlerOptions::new().priority(Priority::HIGH),
        )
    }

    pub fn register_notifier(&self, notifier: Notifier) {
        self.notifiers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(notifier);
    }

    pub async fn resolve_conflict(&self, conflict: Conflict, options: ResolveOptions) -> ResolutionOutcome {
        let started = Instant::now();
        let mut record = ResolutionRecord::new(conflict);
        self.track(&record);
        self.stats_mut(|s| s.total_conflicts += 1);
        tracing::debug!(
            conflict_id = %record.conflict.id,
            conflict_type = %record.conflict.conflict_type,
            spec_id = ?record.conflict.spec_id,
            "resolving conflict",
        );

        let integrity = options
            .data_integrity
            .or(record.conflict.data_integrity)
            .unwrap_or(self.config.default_data_integrity)
            .clamp(0.0, 1.0);

        if record.conflict.conflict_type == ConflictType::ParseError {
            record.step("unparseable content is never resolved automatically");
            return self.escalate(record, integrity, "content could not be parsed", started);
        }
        if options.force_manual {
            record.step("manual resolution requested");
            return self.escalate(record, integrity, "manual resolution requested", started);
        }

        let rules = self.rules().await;
        record.evaluations = strategy::evaluate_all(&record.conflict, integrity, &self.config, &rules);
        let steps: Vec<String> = record
            .evaluations
            .iter()
            .map(|eval| {
                format!(
                    "{}: {} (confidence {:.3}, threshold {:.2})",
                    eval.strategy, eval.reason, eval.confidence, eval.threshold
                )
            })
            .collect();
        for step in steps {
            record.step(step);
        }

        let chosen = strategy::best(&record.evaluations).cloned();
        let chosen = match chosen {
            None => {
                return self.escalate(record, integrity, "no automatic strategy applies", started);
            }
            Some(best) if best.confidence < self.config.confidence_floor => {
                let reason = format!(
                    "best confidence {:.3} ({}) is below the floor {:.2}",
                    best.confidence, best.strategy, self.config.confidence_floor
                );
                return self.escalate(record, integrity, reason, started);
            }
            Some(best) if !best.clears_threshold() => {
                let reason = format!(
                    "best confidence {:.3} ({}) is below its threshold {:.2}",
                    best.confidence, best.strategy, best.threshold
                );
                return self.escalate(record, integrity, reason, started);
            }
            Some(best) => best,
        };

        record.state = ResolutionState::AutoResolving;
        record.strategy = chosen.strategy;
        record.confidence = chosen.confidence;
        record.automatic = true;
        self.track(&record);

        let Some(value) = chosen.proposed_value.clone() else {
            return self.escalate(record, integrity, "chosen strategy proposed no value", started);
        };
        record.step(format!(
            "applying {} value {value} with {}",
            chosen.proposed_source.map(|s| s.as_str()).unwrap_or("?"),
            chosen.strategy
        ));

        match self.apply(&record.conflict, &value, RESOLVER_SOURCE).await {
            Ok(op) => {
                record.backup_created = !op.backups.is_empty();
                record.operation_id = Some(op.id.clone());
                record.state = ResolutionState::Resolved;
                record.step(format!("applied by operation {}", op.id));
                let high = record.confidence >= self.config.high_confidence;
                self.stats_mut(|s| {
                    s.automatic_resolutions += 1;
                    if high {
                        s.high_confidence += 1;
                    } else {
                        s.low_confidence += 1;
                    }
                });
                tracing::info!(
                    conflict_id = %record.conflict.id,
                    strategy = %record.strategy,
                    confidence = record.confidence,
                    "conflict resolved automatically",
                );
                self.complete(&mut record, started);
                self.announce_resolved(&record, &value);
                ResolutionOutcome::Resolved(record)
            }
            Err(failure) => {
                record.backup_created = failure.backup_created();
                record.operation_id = failure.operation.as_ref().map(|op| op.id.clone());
                record.state = ResolutionState::Failed;
                record.step(format!("application failed: {}", failure.error));
                if failure.rolled_back() {
                    record.step("stores rolled back");
                }
                self.stats_mut(|s| {
                    s.failed_applications += 1;
                    if failure.rolled_back() {
                        s.rollbacks += 1;
                    }
                });
                tracing::warn!(
                    conflict_id = %record.conflict.id,
                    strategy = %record.strategy,
                    error = %failure.error,
                    rollback = failure.rolled_back(),
                    "automatic resolution failed, escalating",
                );
                let reason = format!("automatic application failed: {}", failure.error);
                self.escalate(record, integrity, reason, started)
            }
        }
    }

    /// Apply a human decision to a pending or failed ticket.
    pub async fn process_manual_resolution(
        &self,
        ticket_id: &str,
        decision: ManualDecision,
    ) -> Result<ResolutionRecord, ResolverError> {
        let started = Instant::now();
        let ticket = {
            let mut queue = self.tickets.lock().unwrap_or_else(|p| p.into_inner());
            let ticket = queue
                .get_mut(ticket_id)
                .ok_or_else(|| ResolverError::TicketNotFound(ticket_id.to_string()))?;
            if ticket.status == TicketStatus::Processing {
                return Err(ResolverError::TicketBusy(ticket_id.to_string()));
            }
            ticket.status = TicketStatus::Processing;
            ticket.clone()
        };

        let mut record = ResolutionRecord::new(ticket.conflict.clone());
        record.evaluations = ticket.context.evaluations.clone();
        record.strategy = StrategyKind::Manual;

        let value = match self.decision_value(&ticket, &decision) {
            Ok(Some(value)) => value,
            Ok(None) => {
                self.remove_ticket(ticket_id);
                record.state = ResolutionState::Resolved;
                record.step(format!("ticket {ticket_id} dismissed"));
                self.stats_mut(|s| s.manual_resolutions += 1);
                self.complete(&mut record, started);
                self.audit.record("ticket_dismissed", json!({ "ticket_id": ticket_id }));
                return Ok(record);
            }
            Err(err) => {
                self.set_ticket_status(ticket_id, TicketStatus::Pending, None);
                return Err(err);
            }
        };

        record.step(format!("applying manual decision {value}"));
        match self.apply(&ticket.conflict, &value, MANUAL_SOURCE).await {
            Ok(op) => {
                self.remove_ticket(ticket_id);
                record.backup_created = !op.backups.is_empty();
                record.operation_id = Some(op.id.clone());
                record.state = ResolutionState::Resolved;
                self.stats_mut(|s| s.manual_resolutions += 1);
                tracing::info!(ticket_id, conflict_id = %record.conflict.id, "manual resolution applied");
                self.complete(&mut record, started);
                self.announce_resolved(&record, &value);
                Ok(record)
            }
            Err(failure) => {
                self.stats_mut(|s| {
                    s.failed_applications += 1;
                    if failure.rolled_back() {
                        s.rollbacks += 1;
                    }
                });
                self.set_ticket_status(ticket_id, TicketStatus::Failed, Some(failure.error.clone()));
                tracing::warn!(ticket_id, error = %failure.error, "manual resolution failed");
                Err(ResolverError::ApplyFailed(failure.error))
            }
        }
    }

    fn decision_value(
        &self,
        ticket: &ManualInterventionTicket,
        decision: &ManualDecision,
    ) -> Result<Option<Value>, ResolverError> {
        let conflict = &ticket.conflict;
        if conflict.conflict_type == ConflictType::ParseError && *decision != ManualDecision::Dismiss {
            return Err(ResolverError::InvalidDecision(
                "parse errors are fixed by editing the file, then dismissed".to_string(),
            ));
        }
        let from = |source: SourceType| {
            conflict.value_from(source).cloned().map(Some).ok_or_else(|| {
                ResolverError::InvalidDecision(format!("the {source} value is unknown"))
            })
        };
        match decision {
            ManualDecision::Dismiss => Ok(None),
            ManualDecision::UseDocument => from(SourceType::Document),
            ManualDecision::UseStructured => from(SourceType::Structured),
            ManualDecision::Custom(Value::Null) => Err(ResolverError::InvalidDecision(
                "custom value must not be null".to_string(),
            )),
            ManualDecision::Custom(value) => Ok(Some(value.clone())),
        }
    }

    /// Write `value` into both stores.
    async fn apply(&self, conflict: &Conflict, value: &Value, source: &str) -> Result<SyncOperation, ApplyFailure> {
        let Some(spec_id) = &conflict.spec_id else {
            return Err(ApplyFailure {
                error: "conflict names no spec".to_string(),
                operation: None,
            });
        };
        let op = self
            .engine
            .reconcile_field(
                spec_id,
                conflict.task_id.as_ref(),
                &conflict.field,
                value,
                SyncOptions::new().source(source),
            )
            .await;
        if op.succeeded() {
            Ok(op)
        } else {
            Err(ApplyFailure {
                error: op.error.clone().unwrap_or_else(|| "unknown failure".to_string()),
                operation: Some(op),
            })
        }
    }

    async fn rules(&self) -> AssignmentRules {
        let assignments = match self.structured.read_assignments().await {
            Ok(state) => Some(state),
            Err(err) => {
                tracing::warn!(error = %err, "assignment state unreadable, rule-based strategy disabled");
                None
            }
        };
        AssignmentRules {
            allowed_agents: self.allowed_agents.clone(),
            max_tasks_per_agent: self.max_tasks_per_agent,
            assignments,
        }
    }

    fn escalate(
        &self,
        mut record: ResolutionRecord,
        integrity: f64,
        reason: impl Into<String>,
        started: Instant,
    ) -> ResolutionOutcome {
        let reason = reason.into();
        if record.state != ResolutionState::Failed {
            record.state = ResolutionState::AwaitingManualIntervention;
        }
        record.strategy = StrategyKind::Manual;
        record.confidence = 0.0;
        record.automatic = false;

        let (ticket, created) = {
            let mut queue = self.tickets.lock().unwrap_or_else(|p| p.into_inner());
            match queue.find_duplicate(&record.conflict) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let priority =
                        tickets::ticket_priority(&record.conflict, integrity, self.config.corruption_integrity);
                    let ticket = ManualInterventionTicket::new(
                        record.conflict.clone(),
                        record.evaluations.clone(),
                        reason.clone(),
                        priority,
                    );
                    queue.insert(ticket.clone());
                    (ticket, true)
                }
            }
        };

        if created {
            record.step(format!("queued ticket {} (priority {}): {reason}", ticket.id, ticket.priority));
            self.stats_mut(|s| s.escalations += 1);
            tracing::warn!(
                ticket_id = %ticket.id,
                conflict_id = %record.conflict.id,
                priority = ticket.priority,
                reason = %reason,
                "manual intervention required",
            );
            self.notify(&ticket);
            let data = serde_json::to_value(&ticket).unwrap_or(Value::Null);
            if let Err(err) = self.bus.publish(
                topics::MANUAL_INTERVENTION_REQUIRED,
                data,
                PublishOptions::new().priority(Priority::HIGH).source(RESOLVER_SOURCE),
            ) {
                tracing::warn!(error = %err, "failed to publish manual_intervention_required");
            }
        } else {
            record.step(format!("already tracked by ticket {}", ticket.id));
            tracing::debug!(ticket_id = %ticket.id, "conflict already has an open ticket");
        }

        self.complete(&mut record, started);
        ResolutionOutcome::Escalated { record, ticket }
    }

    fn notify(&self, ticket: &ManualInterventionTicket) {
        let notifiers = self
            .notifiers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        for notifier in notifiers {
            if catch_unwind(AssertUnwindSafe(|| notifier(ticket))).is_err() {
                tracing::error!(ticket_id = %ticket.id, "ticket notifier panicked");
            }
        }
    }

    fn announce_resolved(&self, record: &ResolutionRecord, value: &Value) {
        let data = json!({
            "resolutionId": record.id,
            "conflictId": record.conflict.id,
            "type": record.conflict.conflict_type,
            "specId": record.conflict.spec_id,
            "taskId": record.conflict.task_id,
            "field": record.conflict.field,
            "value": value,
            "strategy": record.strategy,
            "confidence": record.confidence,
            "automatic": record.automatic,
            "operationId": record.operation_id,
        });
        if let Err(err) = self
            .bus
            .publish(topics::CONFLICT_RESOLVED, data, PublishOptions::new().source(RESOLVER_SOURCE))
        {
            tracing::warn!(error = %err, "failed to publish conflict_resolved");
        }
    }

    // -----------------------------------------------------------------------
    // Bookkeeping
    // -----------------------------------------------------------------------

    fn track(&self, record: &ResolutionRecord) {
        self.active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(record.id.clone(), record.clone());
    }

    fn complete(&self, record: &mut ResolutionRecord, started: Instant) {
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        record.completed_at = Some(Utc::now());
        record.duration_ms = Some(duration_ms);

        self.active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&record.id);
        {
            let mut history = self.history.lock().unwrap_or_else(|p| p.into_inner());
            if history.len() >= self.config.history_capacity.max(1) {
                history.pop_front();
            }
            history.push_back(record.clone());
        }
        if record.state == ResolutionState::Resolved {
            self.stats_mut(|s| {
                s.resolved_count += 1;
                s.average_resolution_ms += (duration_ms - s.average_resolution_ms) / s.resolved_count as f64;
            });
        }
        self.audit.record(
            "resolution",
            json!({
                "resolution_id": record.id,
                "conflict_id": record.conflict.id,
                "state": record.state,
                "strategy": record.strategy,
                "confidence": record.confidence,
                "automatic": record.automatic,
            }),
        );
    }

    fn remove_ticket(&self, id: &str) {
        self.tickets
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(id);
    }

    fn set_ticket_status(&self, id: &str, status: TicketStatus, error: Option<String>) {
        let mut queue = self.tickets.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(ticket) = queue.get_mut(id) {
            ticket.status = status;
            ticket.error = error;
        }
    }

    fn stats_mut(&self, f: impl FnOnce(&mut ResolverStats)) {
        f(&mut self.stats.lock().unwrap_or_else(|p| p.into_inner()));
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Open tickets, highest priority first.
    pub fn pending_tickets(&self) -> Vec<ManualInterventionTicket> {
        self.tickets.lock().unwrap_or_else(|p| p.into_inner()).all()
    }

    pub fn ticket(&self, id: &str) -> Option<ManualInterventionTicket> {
        self.tickets
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }

    /// Resolutions currently being analyzed or applied.
    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn history(&self) -> Vec<ResolutionRecord> {
        self.history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> ResolverStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn audit_entries(&self, limit: usize) -> Vec<AuditEntry> {
        self.audit.recent(limit)
    }

    pub fn health(&self) -> ComponentHealth {
        let (pending, failed) = {
            let queue = self.tickets.lock().unwrap_or_else(|p| p.into_inner());
            (queue.len(), queue.count(TicketStatus::Failed))
        };
        let mut health = ComponentHealth::healthy("conflict_resolver").with_details(json!({
            "stats": self.stats(),
            "pending_tickets": pending,
            "active": self.active_count(),
        }));
        if pending > self.config.max_pending_tickets {
            health.flag(
                HealthStatus::Error,
                format!("{pending} tickets pending, limit {}", self.config.max_pending_tickets),
            );
        }
        if failed > 0 {
            health.flag(
                HealthStatus::Degraded,
                format!("{failed} ticket(s) failed to apply"),
            );
        }
        health
    }
}
