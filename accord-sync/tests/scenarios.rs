//! End-to-end validation, synchronization and resolution over file stores.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;

use accord_bus::topics;
use accord_core::store::{DocumentStore, StructuredStore};
use accord_core::{
    AgentId, AssignmentMetadata, ChangePayload, SemanticChange, SourceType, SpecId, StateKind,
    TaskId, TaskStatus,
};
use accord_sync::{
    ConflictType, InconsistencyType, ManualDecision, OperationState, ResolutionOutcome,
    ResolutionState, ResolveOptions, ResolverError, StateChange, StrategyKind, SyncOptions,
};
use common::{spec_with_task, Harness};

fn at(ts: &str) -> DateTime<Utc> {
    ts.parse().unwrap()
}

fn spec() -> SpecId {
    SpecId::from("SPEC-1")
}

fn t1() -> TaskId {
    TaskId::from("T1")
}

fn assignment_change(h: &Harness) -> ChangePayload {
    ChangePayload::new(SourceType::Document, h.spec_path())
        .with_spec("SPEC-1")
        .with_changes(vec![SemanticChange::modified("assigned_agent", json!("alice")).for_task("T1")])
}

/// Structured store holds `agent` for T1 written at `written`, with
/// progress already matching the document.
async fn seed_structured(h: &Harness, agent: &str, written: &str) {
    let metadata = AssignmentMetadata {
        source: "seed".to_string(),
        status: Some(TaskStatus::InProgress),
        notes: None,
        timestamp: Some(at(written)),
    };
    h.fs_structured
        .assign_task(&spec(), &t1(), &AgentId::from(agent), &metadata)
        .await
        .unwrap();
    let doc = h.fs_documents.read_spec(&spec()).await.unwrap();
    h.fs_structured
        .recompute_spec_state(&spec(), &doc.tasks(), doc.str_field("status"))
        .await
        .unwrap();
    h.fs_structured.recompute_aggregates().await.unwrap();
}

async fn document_agent(h: &Harness) -> Option<AgentId> {
    let doc = h.fs_documents.read_spec(&spec()).await.unwrap();
    doc.task(&t1()).and_then(|t| t.assigned_agent)
}

// ---------------------------------------------------------------------------
// Validation and repair
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_assignment_record_is_created_from_the_document() {
    let h = Harness::new();
    h.write_spec(&spec_with_task("alice", "2026-01-01T10:00:00Z"));

    let result = h.validator.validate_change(&assignment_change(&h)).await;

    let missing = result
        .inconsistencies
        .iter()
        .find(|i| i.kind == InconsistencyType::MissingStructuredAssignment)
        .expect("missing assignment reported");
    assert_eq!(missing.task_id, Some(t1()));
    assert!(missing.repaired);
    assert!(!result.repairs_performed.is_empty());
    assert!(result.conflicts.is_empty());

    let assignments = h.fs_structured.read_assignments().await.unwrap();
    let record = assignments.record(&spec(), &t1()).expect("record written");
    assert_eq!(record.agent, AgentId::from("alice"));
    assert_eq!(record.status, TaskStatus::InProgress);

    let again = h.validator.validate_change(&assignment_change(&h)).await;
    assert!(again.is_consistent(), "{:?}", again.inconsistencies);
    assert!(again.repairs_performed.is_empty());
}

#[tokio::test]
async fn repairing_twice_changes_nothing_the_second_time() {
    let h = Harness::new();
    h.write_spec(&spec_with_task("alice", "2026-01-01T10:00:00Z"));

    h.validator.validate_change(&assignment_change(&h)).await;
    let assignments = h.read(&h.state_path("assignments.json"));
    let progress = h.read(&h.state_path("progress.json"));
    assert!(assignments.is_some() && progress.is_some());

    let second = h.validator.validate_change(&assignment_change(&h)).await;
    assert!(second.repairs_performed.is_empty());
    assert_eq!(h.read(&h.state_path("assignments.json")), assignments);
    assert_eq!(h.read(&h.state_path("progress.json")), progress);
}

#[tokio::test]
async fn repair_waits_for_the_specs_lock() {
    let h = Harness::new();
    h.write_spec(&spec_with_task("alice", "2026-01-01T10:00:00Z"));
    let guard = h.locks.acquire(&spec()).await;

    let validator = h.validator.clone();
    let payload = assignment_change(&h);
    let repair = tokio::spawn(async move { validator.validate_change(&payload).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!repair.is_finished());
    assert!(h.read(&h.state_path("assignments.json")).is_none());

    drop(guard);
    let result = repair.await.unwrap();
    assert!(!result.repairs_performed.is_empty());
    let assignments = h.fs_structured.read_assignments().await.unwrap();
    assert_eq!(assignments.record(&spec(), &t1()).unwrap().agent, AgentId::from("alice"));
}

#[tokio::test]
async fn unparseable_document_becomes_a_parse_conflict() {
    let h = Harness::new();
    h.write_spec("---\nid: [SPEC-1\ntitle: broken\n---\nbody\n");

    let result = h.validator.validate_change(&assignment_change(&h)).await;
    assert_eq!(result.conflicts.len(), 1);
    let conflict = &result.conflicts[0];
    assert_eq!(conflict.conflict_type, ConflictType::ParseError);
    assert_eq!(conflict.data_integrity, Some(0.0));

    let outcome = h
        .resolver
        .resolve_conflict(conflict.clone(), ResolveOptions::default())
        .await;
    let ticket = outcome.ticket().expect("parse errors always need a human");
    assert_eq!(ticket.priority, 9);

    let err = h
        .resolver
        .process_manual_resolution(&ticket.id, ManualDecision::UseDocument)
        .await
        .unwrap_err();
    assert!(matches!(err, ResolverError::InvalidDecision(_)));
    assert_eq!(h.resolver.pending_tickets().len(), 1);

    let record = h
        .resolver
        .process_manual_resolution(&ticket.id, ManualDecision::Dismiss)
        .await
        .unwrap();
    assert_eq!(record.state, ResolutionState::Resolved);
    assert!(h.resolver.pending_tickets().is_empty());
}

// ---------------------------------------------------------------------------
// Conflict resolution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn newer_structured_assignment_wins_by_time() {
    let h = Harness::new();
    h.write_spec(&spec_with_task("alice", "2026-01-01T10:00:00Z"));
    seed_structured(&h, "bob", "2026-01-01T12:00:00Z").await;
    let completed = h.record(topics::SYNC_COMPLETED);
    let resolved = h.record(topics::CONFLICT_RESOLVED);

    let result = h.validator.validate_change(&assignment_change(&h)).await;
    assert_eq!(result.conflicts.len(), 1, "{:?}", result.conflicts);
    let conflict = result.conflicts[0].clone();
    assert_eq!(conflict.conflict_type, ConflictType::AgentAssignmentMismatch);
    assert_eq!(conflict.timestamps.newer_source, Some(SourceType::Structured));

    let outcome = h.resolver.resolve_conflict(conflict, ResolveOptions::default()).await;
    let ResolutionOutcome::Resolved(record) = outcome else {
        panic!("expected automatic resolution, got {outcome:?}");
    };
    assert_eq!(record.strategy, StrategyKind::TimeBased);
    assert!((record.confidence - 0.8626).abs() < 1e-3, "{}", record.confidence);
    assert!(record.automatic);
    assert!(record.backup_created);
    assert_eq!(document_agent(&h).await, Some(AgentId::from("bob")));

    h.settle().await;
    let events = completed.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["operationId"], json!(record.operation_id));
    assert_eq!(resolved.events().len(), 1);
    assert_eq!(h.resolver.stats().automatic_resolutions, 1);
}

#[tokio::test]
async fn near_simultaneous_writes_queue_a_ticket() {
    let h = Harness::new();
    h.write_spec(&spec_with_task("alice", "2026-01-01T10:00:00Z"));
    seed_structured(&h, "bob", "2026-01-01T10:00:01Z").await;
    let notified = Arc::new(AtomicUsize::new(0));
    let counter = notified.clone();
    h.resolver.register_notifier(Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    let before = h.read(&h.spec_path());

    let result = h.validator.validate_change(&assignment_change(&h)).await;
    let conflict = result.conflicts[0].clone();
    let outcome = h
        .resolver
        .resolve_conflict(conflict.clone(), ResolveOptions::default())
        .await;

    let ticket = outcome.ticket().expect("ticket queued").clone();
    assert_eq!(ticket.priority, 3);
    assert_eq!(ticket.confidence, 0.0);
    assert_eq!(ticket.recommended_strategy, StrategyKind::AuthorityBased);
    assert_eq!(ticket.context.document_value, json!("alice"));
    assert_eq!(ticket.context.structured_value, json!("bob"));
    assert_eq!(outcome.record().state, ResolutionState::AwaitingManualIntervention);
    assert_eq!(h.read(&h.spec_path()), before, "document must not change");
    assert_eq!(notified.load(Ordering::SeqCst), 1);

    // The same disagreement seen again keeps its single ticket.
    let again = h.resolver.resolve_conflict(conflict, ResolveOptions::default()).await;
    assert_eq!(again.ticket().map(|t| t.id.clone()), Some(ticket.id.clone()));
    assert_eq!(h.resolver.pending_tickets().len(), 1);
    assert_eq!(notified.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn manual_decision_writes_the_chosen_value() {
    let h = Harness::new();
    h.write_spec(&spec_with_task("alice", "2026-01-01T10:00:00Z"));
    seed_structured(&h, "bob", "2026-01-01T10:00:01Z").await;

    let result = h.validator.validate_change(&assignment_change(&h)).await;
    let outcome = h
        .resolver
        .resolve_conflict(result.conflicts[0].clone(), ResolveOptions::default())
        .await;
    let ticket_id = outcome.ticket().unwrap().id.clone();

    let missing = h
        .resolver
        .process_manual_resolution("no-such-ticket", ManualDecision::UseStructured)
        .await
        .unwrap_err();
    assert!(matches!(missing, ResolverError::TicketNotFound(_)));

    let record = h
        .resolver
        .process_manual_resolution(&ticket_id, ManualDecision::UseStructured)
        .await
        .unwrap();
    assert_eq!(record.state, ResolutionState::Resolved);
    assert_eq!(record.strategy, StrategyKind::Manual);
    assert!(!record.automatic);
    assert_eq!(document_agent(&h).await, Some(AgentId::from("bob")));
    assert!(h.resolver.ticket(&ticket_id).is_none());

    let recheck = h.validator.check_consistency(&spec(), None).await.unwrap();
    assert!(recheck.is_consistent(), "{}", recheck.summary());
}

#[tokio::test]
async fn force_manual_skips_scoring() {
    let h = Harness::new();
    h.write_spec(&spec_with_task("alice", "2026-01-01T10:00:00Z"));
    seed_structured(&h, "bob", "2026-01-01T12:00:00Z").await;

    let result = h.validator.validate_change(&assignment_change(&h)).await;
    let options = ResolveOptions {
        force_manual: true,
        ..ResolveOptions::default()
    };
    let outcome = h.resolver.resolve_conflict(result.conflicts[0].clone(), options).await;
    assert!(outcome.ticket().is_some());
    assert!(outcome.record().evaluations.is_empty());
    assert_eq!(document_agent(&h).await, Some(AgentId::from("alice")));
}

// ---------------------------------------------------------------------------
// Synchronization
// ---------------------------------------------------------------------------

#[tokio::test]
async fn document_sync_writes_assignments_and_progress() {
    let h = Harness::new();
    h.write_spec(&spec_with_task("carol", "2026-01-01T10:00:00Z"));

    let op = h
        .engine
        .sync_document_to_structured(&spec(), None, &[], SyncOptions::new())
        .await;
    assert_eq!(op.state, OperationState::Completed, "{:?}", op.error);
    assert!(!op.rollback_performed);
    assert!(op.applied_changes.iter().any(|c| c.field == "assigned_agent"));

    let assignments = h.fs_structured.read_assignments().await.unwrap();
    assert_eq!(
        assignments.record(&spec(), &t1()).map(|r| r.agent.clone()),
        Some(AgentId::from("carol"))
    );
    let progress = h.fs_structured.read_progress().await.unwrap();
    assert_eq!(progress.aggregate.total_tasks, 1);
    assert_eq!(progress.aggregate.in_progress_tasks, 1);
    assert_eq!(h.engine.stats().completed, 1);
}

#[tokio::test]
async fn structured_sync_updates_document_fields() {
    let h = Harness::new();
    h.write_spec(&spec_with_task("alice", "2026-01-01T10:00:00Z"));
    seed_structured(&h, "alice", "2026-01-01T10:00:00Z").await;

    let changes = [StateChange::new("SPEC-1", "notes", json!("waiting on design")).for_task("T1")];
    let op = h
        .engine
        .sync_structured_to_document(&changes, StateKind::Assignments, SyncOptions::new())
        .await;
    assert_eq!(op.state, OperationState::Completed, "{:?}", op.error);

    let doc = h.fs_documents.read_spec(&spec()).await.unwrap();
    let task = doc.task(&t1()).unwrap();
    assert_eq!(task.notes.as_deref(), Some("waiting on design"));
}

#[tokio::test]
async fn unmapped_structured_fields_are_rejected() {
    let h = Harness::new();
    h.write_spec(&spec_with_task("alice", "2026-01-01T10:00:00Z"));
    let before = h.read(&h.spec_path());

    let changes = [StateChange::new("SPEC-1", "velocity", json!(3))];
    let op = h
        .engine
        .sync_structured_to_document(&changes, StateKind::Progress, SyncOptions::new())
        .await;
    assert_eq!(op.state, OperationState::Failed);
    assert!(op.error.unwrap().contains("velocity"));
    assert_eq!(h.read(&h.spec_path()), before);
}
