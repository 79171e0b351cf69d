//! Changes submitted to a running orchestrator, observed on disk and on the bus.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::mpsc;

use accord_bus::{handler_fn, topics, EventBus, HandlerOptions};
use accord_core::store::{DocumentStore, StructuredStore};
use accord_core::{
    AgentId, AssignmentMetadata, ChangePayload, FsDocumentStore, FsStructuredStore,
    SemanticChange, SourceType, SpecId, TaskId, TaskStatus,
};
use accord_daemon::{build_orchestrator, dispatch, DaemonError, DaemonRequest, Orchestrator};
use accord_sync::ManualDecision;

struct Workspace {
    dir: TempDir,
    orchestrator: Arc<Orchestrator>,
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let orchestrator = build_orchestrator(dir.path()).unwrap();
        Self { dir, orchestrator }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn spec_path(&self) -> PathBuf {
        self.root().join("specs").join("SPEC-1.md")
    }

    fn write_spec(&self, agent: &str, updated: &str) {
        let path = self.spec_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            path,
            format!(
                r#"---
id: SPEC-1
title: Login
status: active
type: feature
priority: high
updated: "{updated}"
tasks:
  - id: T1
    title: Form
    status: in_progress
    assigned_agent: {agent}
    updated: "{updated}"
---
# Login
"#
            ),
        )
        .unwrap();
    }

    fn documents(&self) -> FsDocumentStore {
        FsDocumentStore::new(self.root().join("specs"))
    }

    fn structured(&self) -> FsStructuredStore {
        FsStructuredStore::new(self.root().join(".accord").join("state"))
    }

    async fn seed_assignment(&self, agent: &str, written: &str) {
        let spec = SpecId::from("SPEC-1");
        let structured = self.structured();
        let metadata = AssignmentMetadata {
            source: "seed".to_string(),
            status: Some(TaskStatus::InProgress),
            notes: None,
            timestamp: Some(written.parse::<DateTime<Utc>>().unwrap()),
        };
        structured
            .assign_task(&spec, &TaskId::from("T1"), &AgentId::from(agent), &metadata)
            .await
            .unwrap();
        let doc = self.documents().read_spec(&spec).await.unwrap();
        structured
            .recompute_spec_state(&spec, &doc.tasks(), doc.str_field("status"))
            .await
            .unwrap();
        structured.recompute_aggregates().await.unwrap();
    }

    async fn document_agent(&self) -> Option<AgentId> {
        let doc = self.documents().read_spec(&SpecId::from("SPEC-1")).await.unwrap();
        doc.task(&TaskId::from("T1")).and_then(|t| t.assigned_agent)
    }

    fn assignment_change(&self) -> ChangePayload {
        ChangePayload::new(SourceType::Document, self.spec_path())
            .with_spec("SPEC-1")
            .with_changes(vec![
                SemanticChange::modified("assigned_agent", json!("alice")).for_task("T1")
            ])
    }

    async fn settle(&self) {
        assert!(
            self.orchestrator
                .bus()
                .wait_idle(Duration::from_secs(5))
                .await,
            "bus did not drain"
        );
    }
}

fn record(bus: &EventBus, event_type: &str) -> Arc<Mutex<Vec<Value>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.register(
        event_type,
        handler_fn(move |event| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(event.data);
                Ok(())
            }
        }),
        HandlerOptions::new(),
    )
    .unwrap();
    seen
}

#[tokio::test]
async fn document_change_is_repaired_and_synced() {
    let ws = Workspace::new();
    ws.write_spec("alice", "2026-01-01T10:00:00Z");
    let repairs = record(ws.orchestrator.bus(), topics::REPAIR_PERFORMED);
    let validations = record(ws.orchestrator.bus(), topics::VALIDATION_COMPLETE);
    ws.orchestrator.start();

    ws.orchestrator
        .submit_change(ws.assignment_change())
        .await
        .unwrap();
    ws.settle().await;

    assert!(!repairs.lock().unwrap().is_empty());
    let validations = validations.lock().unwrap().clone();
    assert_eq!(validations.len(), 1);
    assert_eq!(validations[0]["result"]["conflicts"], json!([]));

    let assignments = ws.structured().read_assignments().await.unwrap();
    let record = assignments
        .record(&SpecId::from("SPEC-1"), &TaskId::from("T1"))
        .expect("assignment written");
    assert_eq!(record.agent, AgentId::from("alice"));

    let stats = ws.orchestrator.stats();
    assert_eq!(stats.changes_received, 1);
    assert_eq!(stats.changes_routed, 1);
    assert!(stats.repairs >= 1);
    assert!(ws.orchestrator.stop().await.drained);
}

#[tokio::test]
async fn close_disagreement_waits_for_a_human_decision() {
    let ws = Workspace::new();
    ws.write_spec("alice", "2026-01-01T10:00:00Z");
    ws.seed_assignment("bob", "2026-01-01T10:00:01Z").await;
    let conflicts = record(ws.orchestrator.bus(), topics::CONFLICT_DETECTED);
    ws.orchestrator.start();

    ws.orchestrator
        .submit_change(ws.assignment_change())
        .await
        .unwrap();
    ws.settle().await;

    assert_eq!(conflicts.lock().unwrap().len(), 1);
    let tickets = ws.orchestrator.resolver().pending_tickets();
    assert_eq!(tickets.len(), 1);
    assert_eq!(ws.document_agent().await, Some(AgentId::from("alice")));
    assert_eq!(ws.orchestrator.status().pending_tickets, 1);

    let request = DaemonRequest {
        ticket: Some(tickets[0].id.clone()),
        decision: Some(ManualDecision::UseStructured),
        ..DaemonRequest::new("resolve")
    };
    let response = dispatch(&ws.orchestrator, request).await;
    assert!(response.ok, "{:?}", response.error);
    assert_eq!(response.data.unwrap()["state"], json!("resolved"));
    assert_eq!(ws.document_agent().await, Some(AgentId::from("bob")));

    let remaining = dispatch(&ws.orchestrator, DaemonRequest::new("tickets")).await;
    assert_eq!(remaining.data, Some(json!([])));
}

#[tokio::test]
async fn low_impact_changes_skip_validation() {
    let ws = Workspace::new();
    ws.write_spec("alice", "2026-01-01T10:00:00Z");
    let validations = record(ws.orchestrator.bus(), topics::VALIDATION_COMPLETE);
    ws.orchestrator.start();

    let change = ChangePayload::new(SourceType::Document, ws.spec_path())
        .with_spec("SPEC-1")
        .with_changes(vec![
            SemanticChange::modified("notes", json!("typo fixed")).for_task("T1")
        ]);
    ws.orchestrator.submit_change(change).await.unwrap();
    ws.settle().await;

    assert!(validations.lock().unwrap().is_empty());
    let stats = ws.orchestrator.stats();
    assert_eq!(stats.changes_skipped, 1);
    assert_eq!(stats.changes_routed, 0);
    assert!(ws.structured().read_assignments().await.unwrap().assignments.is_empty());
}

#[tokio::test]
async fn attached_source_feeds_changes_until_closed() {
    let ws = Workspace::new();
    ws.write_spec("alice", "2026-01-01T10:00:00Z");
    ws.orchestrator.start();

    let (tx, rx) = mpsc::channel(4);
    let handle = ws.orchestrator.attach_change_source(rx);
    tx.send(ws.assignment_change()).await.unwrap();
    drop(tx);
    handle.await.unwrap();
    ws.settle().await;

    assert_eq!(ws.orchestrator.stats().changes_received, 1);
}

#[tokio::test]
async fn stopped_orchestrator_drains_then_rejects() {
    let ws = Workspace::new();
    ws.write_spec("alice", "2026-01-01T10:00:00Z");
    ws.orchestrator.start();
    ws.orchestrator
        .submit_change(ws.assignment_change())
        .await
        .unwrap();

    let report = ws.orchestrator.stop().await;
    assert!(report.drained);
    assert_eq!(report.queued_events, 0);
    assert_eq!(report.active_syncs, 0);
    assert!(!ws.orchestrator.is_running());

    let err = ws
        .orchestrator
        .submit_change(ws.assignment_change())
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::Stopped));
    assert_eq!(ws.orchestrator.stats().changes_rejected, 1);
}
