//! Typed model of the structured store's JSON state files.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::types::{AgentId, SpecId, StateKind, TaskEntry, TaskId, TaskStatus};

/// `assignments.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssignmentState {
    #[serde(default)]
    pub assignments: BTreeMap<SpecId, BTreeMap<TaskId, AssignmentRecord>>,
    #[serde(default)]
    pub history: Vec<AssignmentHistoryEntry>,
}

impl AssignmentState {
    pub fn record(&self, spec_id: &SpecId, task_id: &TaskId) -> Option<&AssignmentRecord> {
        self.assignments.get(spec_id).and_then(|tasks| tasks.get(task_id))
    }

    /// Number of tasks assigned to `agent` that are not yet completed.
    pub fn open_tasks_for(&self, agent: &AgentId) -> usize {
        self.assignments
            .values()
            .flat_map(|tasks| tasks.values())
            .filter(|r| &r.agent == agent && r.status != TaskStatus::Completed)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub agent: AgentId,
    #[serde(default)]
    pub status: TaskStatus,
    pub assigned_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentHistoryEntry {
    pub spec_id: SpecId,
    pub task_id: TaskId,
    pub agent: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_agent: Option<AgentId>,
    pub status: TaskStatus,
    /// Component that performed the write (`sync_engine`, `repair`, ...).
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

/// `progress.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressState {
    #[serde(default)]
    pub aggregate: ProgressAggregate,
    #[serde(default)]
    pub specs: BTreeMap<SpecId, SpecProgress>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressAggregate {
    pub total_specs: usize,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub in_progress_tasks: usize,
    pub blocked_tasks: usize,
    pub completion_rate: f64,
}

impl ProgressAggregate {
    pub fn from_specs(specs: &BTreeMap<SpecId, SpecProgress>) -> Self {
        let mut aggregate = ProgressAggregate {
            total_specs: specs.len(),
            ..Default::default()
        };
        for spec in specs.values() {
            aggregate.total_tasks += spec.total_tasks;
            aggregate.completed_tasks += spec.completed_tasks;
            aggregate.in_progress_tasks += spec.in_progress_tasks;
            aggregate.blocked_tasks += spec.blocked_tasks;
        }
        aggregate.completion_rate = completion_rate(aggregate.completed_tasks, aggregate.total_tasks);
        aggregate
    }

    /// Equality on counts, tolerant of float noise in `completion_rate`.
    pub fn same_counts(&self, other: &ProgressAggregate) -> bool {
        self.total_specs == other.total_specs
            && self.total_tasks == other.total_tasks
            && self.completed_tasks == other.completed_tasks
            && self.in_progress_tasks == other.in_progress_tasks
            && self.blocked_tasks == other.blocked_tasks
            && (self.completion_rate - other.completion_rate).abs() < 1e-9
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecProgress {
    pub total_tasks: usize,
    pub completed_tasks: usize,
    #[serde(default)]
    pub in_progress_tasks: usize,
    #[serde(default)]
    pub blocked_tasks: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SpecProgress {
    pub fn from_tasks(tasks: &[TaskEntry], status: Option<&str>, now: DateTime<Utc>) -> Self {
        let count = |wanted: TaskStatus| {
            tasks
                .iter()
                .filter(|t| t.task_status() == Some(wanted))
                .count()
        };
        SpecProgress {
            total_tasks: tasks.len(),
            completed_tasks: count(TaskStatus::Completed),
            in_progress_tasks: count(TaskStatus::InProgress),
            blocked_tasks: count(TaskStatus::Blocked),
            status: status.map(str::to_string),
            updated_at: now,
        }
    }

    /// Equality ignoring `updated_at`.
    pub fn same_counts(&self, other: &SpecProgress) -> bool {
        self.total_tasks == other.total_tasks
            && self.completed_tasks == other.completed_tasks
            && self.in_progress_tasks == other.in_progress_tasks
            && self.blocked_tasks == other.blocked_tasks
            && self.status == other.status
    }
}

/// `handoffs.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandoffState {
    #[serde(default)]
    pub pending: Vec<Value>,
    #[serde(default)]
    pub active: Vec<Value>,
    #[serde(default)]
    pub completed: Vec<Value>,
}

// ---------------------------------------------------------------------------
// Per-spec slices
// ---------------------------------------------------------------------------

/// The part of `assignments.json` one spec owns: its task records and its
/// history entries, in history order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssignmentSlice {
    pub records: Option<BTreeMap<TaskId, AssignmentRecord>>,
    pub history: Vec<AssignmentHistoryEntry>,
}

impl AssignmentSlice {
    pub fn of(state: &AssignmentState, spec_id: &SpecId) -> Self {
        Self {
            records: state.assignments.get(spec_id).cloned(),
            history: state
                .history
                .iter()
                .filter(|e| &e.spec_id == spec_id)
                .cloned()
                .collect(),
        }
    }

    /// Put this slice back into `state`, leaving other specs untouched.
    ///
    /// History is append-only, so the spec's entries in `state` extend the
    /// slice's; entries past the slice are dropped in place.
    pub fn restore_into(&self, state: &mut AssignmentState, spec_id: &SpecId) {
        match &self.records {
            Some(records) => {
                state.assignments.insert(spec_id.clone(), records.clone());
            }
            None => {
                state.assignments.remove(spec_id);
            }
        }
        let keep = self.history.len();
        let mut seen = 0;
        state.history.retain(|e| {
            if &e.spec_id != spec_id {
                return true;
            }
            seen += 1;
            seen <= keep
        });
    }
}

/// The part of `progress.json` one spec owns. The aggregate is derived
/// from all specs and is rebuilt on restore.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSlice {
    pub spec: Option<SpecProgress>,
}

impl ProgressSlice {
    pub fn of(state: &ProgressState, spec_id: &SpecId) -> Self {
        Self {
            spec: state.specs.get(spec_id).cloned(),
        }
    }

    pub fn restore_into(&self, state: &mut ProgressState, spec_id: &SpecId) {
        match &self.spec {
            Some(spec) => {
                state.specs.insert(spec_id.clone(), spec.clone());
            }
            None => {
                state.specs.remove(spec_id);
            }
        }
        state.aggregate = ProgressAggregate::from_specs(&state.specs);
    }
}

/// The value a missing state file reads as.
pub fn empty_state(kind: StateKind) -> Value {
    match kind {
        StateKind::Assignments => json!({ "assignments": {}, "history": [] }),
        StateKind::Progress => json!({
            "aggregate": ProgressAggregate::default(),
            "specs": {},
        }),
        StateKind::Handoffs => json!({ "pending": [], "active": [], "completed": [] }),
    }
}

fn completion_rate(completed: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        completed as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, status: &str) -> TaskEntry {
        TaskEntry {
            id: TaskId::from(id),
            title: format!("task {id}"),
            status: Some(status.to_string()),
            assigned_agent: None,
            updated: None,
            notes: None,
        }
    }

    #[test]
    fn spec_progress_counts_statuses() {
        let tasks = vec![
            task("T1", "completed"),
            task("T2", "in_progress"),
            task("T3", "blocked"),
            task("T4", "pending"),
        ];
        let progress = SpecProgress::from_tasks(&tasks, Some("active"), Utc::now());
        assert_eq!(progress.total_tasks, 4);
        assert_eq!(progress.completed_tasks, 1);
        assert_eq!(progress.in_progress_tasks, 1);
        assert_eq!(progress.blocked_tasks, 1);
    }

    #[test]
    fn aggregate_sums_specs() {
        let now = Utc::now();
        let mut specs = BTreeMap::new();
        specs.insert(
            SpecId::from("A"),
            SpecProgress::from_tasks(&[task("T1", "completed"), task("T2", "pending")], None, now),
        );
        specs.insert(
            SpecId::from("B"),
            SpecProgress::from_tasks(&[task("T1", "completed")], None, now),
        );
        let aggregate = ProgressAggregate::from_specs(&specs);
        assert_eq!(aggregate.total_specs, 2);
        assert_eq!(aggregate.total_tasks, 3);
        assert_eq!(aggregate.completed_tasks, 2);
        assert!((aggregate.completion_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    fn history(spec: &str, agent: &str) -> AssignmentHistoryEntry {
        AssignmentHistoryEntry {
            spec_id: SpecId::from(spec),
            task_id: TaskId::from("T1"),
            agent: AgentId::from(agent),
            previous_agent: None,
            status: TaskStatus::InProgress,
            source: "test".to_string(),
            timestamp: Utc::now(),
        }
    }

    fn record(agent: &str) -> AssignmentRecord {
        let now = Utc::now();
        AssignmentRecord {
            agent: AgentId::from(agent),
            status: TaskStatus::InProgress,
            assigned_at: now,
            updated_at: now,
            notes: None,
        }
    }

    #[test]
    fn assignment_slice_restore_keeps_other_specs() {
        let (a, b) = (SpecId::from("A"), SpecId::from("B"));
        let mut state = AssignmentState::default();
        state
            .assignments
            .insert(a.clone(), BTreeMap::from([(TaskId::from("T1"), record("alice"))]));
        state.history.push(history("A", "alice"));
        let slice = AssignmentSlice::of(&state, &a);

        // A is reassigned while B is written in between.
        state
            .assignments
            .insert(a.clone(), BTreeMap::from([(TaskId::from("T1"), record("carol"))]));
        state.history.push(history("B", "bob"));
        state.history.push(history("A", "carol"));
        state
            .assignments
            .insert(b.clone(), BTreeMap::from([(TaskId::from("T1"), record("bob"))]));

        slice.restore_into(&mut state, &a);

        assert_eq!(AssignmentSlice::of(&state, &a), slice);
        assert_eq!(state.record(&b, &TaskId::from("T1")).unwrap().agent, AgentId::from("bob"));
        let agents: Vec<&str> = state.history.iter().map(|e| e.agent.as_str()).collect();
        assert_eq!(agents, ["alice", "bob"]);
    }

    #[test]
    fn absent_slice_restores_to_absent() {
        let a = SpecId::from("A");
        let mut state = AssignmentState::default();
        let slice = AssignmentSlice::of(&state, &a);
        state
            .assignments
            .insert(a.clone(), BTreeMap::from([(TaskId::from("T1"), record("alice"))]));
        state.history.push(history("A", "alice"));

        slice.restore_into(&mut state, &a);
        assert_eq!(state, AssignmentState::default());
    }

    #[test]
    fn progress_slice_restore_rebuilds_the_aggregate() {
        let now = Utc::now();
        let (a, b) = (SpecId::from("A"), SpecId::from("B"));
        let mut state = ProgressState::default();
        let slice = ProgressSlice::of(&state, &a);

        state.specs.insert(a.clone(), SpecProgress::from_tasks(&[task("T1", "completed")], None, now));
        state.specs.insert(b.clone(), SpecProgress::from_tasks(&[task("T1", "pending")], None, now));
        state.aggregate = ProgressAggregate::from_specs(&state.specs);

        slice.restore_into(&mut state, &a);
        assert!(!state.specs.contains_key(&a));
        assert_eq!(state.aggregate.total_specs, 1);
        assert_eq!(state.aggregate.completed_tasks, 0);
    }

    #[test]
    fn empty_states_deserialize_into_typed_views() {
        let a: AssignmentState = serde_json::from_value(empty_state(StateKind::Assignments)).unwrap();
        assert!(a.assignments.is_empty());
        let p: ProgressState = serde_json::from_value(empty_state(StateKind::Progress)).unwrap();
        assert_eq!(p.aggregate.total_specs, 0);
        let h: HandoffState = serde_json::from_value(empty_state(StateKind::Handoffs)).unwrap();
        assert!(h.pending.is_empty());
    }
}
