//! Domain types shared by every accord crate.
//!
//! Closed value sets (statuses, priorities, severities, ...) are plain enums
//! with a stable lowercase wire form; the validator checks raw frontmatter
//! strings against [`SpecStatus::parse`] and friends rather than relying on
//! serde failures.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Identifier of a specification document (`id:` in its frontmatter).
    SpecId
);
string_newtype!(
    /// Identifier of a task inside a specification.
    TaskId
);
string_newtype!(
    /// Name of an agent that tasks are assigned to.
    AgentId
);

// ---------------------------------------------------------------------------
// Closed enumerations
// ---------------------------------------------------------------------------

macro_rules! closed_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }

            pub fn parse(value: &str) -> Option<Self> {
                match value {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }

            /// Wire forms of every variant, for error messages.
            pub fn allowed_values() -> Vec<&'static str> {
                Self::ALL.iter().map(|v| v.as_str()).collect()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

closed_enum!(
    /// Lifecycle status of a whole specification.
    SpecStatus {
        Draft => "draft",
        Active => "active",
        InProgress => "in_progress",
        Review => "review",
        Completed => "completed",
        Blocked => "blocked",
        Cancelled => "cancelled",
    }
);

closed_enum!(
    /// Kind of work a specification describes.
    SpecType {
        Feature => "feature",
        Bugfix => "bugfix",
        Refactor => "refactor",
        Docs => "docs",
        Test => "test",
        Chore => "chore",
        Epic => "epic",
    }
);

closed_enum!(
    SpecPriority {
        Low => "low",
        Medium => "medium",
        High => "high",
        Critical => "critical",
    }
);

closed_enum!(
    /// Status of a single task, in both stores.
    TaskStatus {
        Pending => "pending",
        InProgress => "in_progress",
        Review => "review",
        Completed => "completed",
        Blocked => "blocked",
    }
);

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Pending
    }
}

closed_enum!(
    /// Which store a change or value originates from.
    SourceType {
        Document => "document",
        Structured => "structured",
    }
);

impl SourceType {
    pub fn other(&self) -> SourceType {
        match self {
            SourceType::Document => SourceType::Structured,
            SourceType::Structured => SourceType::Document,
        }
    }
}

closed_enum!(
    /// One JSON file of the structured store.
    StateKind {
        Assignments => "assignments",
        Progress => "progress",
        Handoffs => "handoffs",
    }
);

impl StateKind {
    pub fn file_name(&self) -> &'static str {
        match self {
            StateKind::Assignments => "assignments.json",
            StateKind::Progress => "progress.json",
            StateKind::Handoffs => "handoffs.json",
        }
    }

    /// Infer the state kind from a structured-store file path.
    pub fn from_path(path: &Path) -> Option<StateKind> {
        let stem = path.file_stem()?.to_str()?;
        StateKind::parse(stem)
    }
}

closed_enum!(
    Severity {
        Low => "low",
        Medium => "medium",
        High => "high",
    }
);

closed_enum!(
    /// Estimated blast radius of a change, computed by change analysis.
    Impact {
        Low => "low",
        Medium => "medium",
        High => "high",
    }
);

closed_enum!(
    ChangeKind {
        Added => "added",
        Modified => "modified",
        Removed => "removed",
    }
);

// ---------------------------------------------------------------------------
// Field categories
// ---------------------------------------------------------------------------

/// Which store owns a field when the two disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldCategory {
    /// Titles, type, priority, the task list itself: the document store is authoritative.
    Structural,
    /// Status, assignment, progress, notes, timestamps: the structured store is authoritative.
    Operational,
}

impl FieldCategory {
    pub fn of(field: &str) -> FieldCategory {
        match field {
            "status" | "assigned_agent" | "agent" | "assignment" | "progress"
            | "completion_rate" | "notes" | "updated" | "updated_at" | "assigned_at"
            | "completed_at" => FieldCategory::Operational,
            _ => FieldCategory::Structural,
        }
    }

    pub fn authoritative_source(&self) -> SourceType {
        match self {
            FieldCategory::Structural => SourceType::Document,
            FieldCategory::Operational => SourceType::Structured,
        }
    }
}

/// Fields whose change warrants a cross-store consistency check.
pub fn is_critical_field(field: &str) -> bool {
    matches!(
        field,
        "status" | "assigned_agent" | "agent" | "assignment" | "tasks" | "task" | "task_structure"
    )
}

// ---------------------------------------------------------------------------
// Change payloads
// ---------------------------------------------------------------------------

/// One field-level change detected by the change source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticChange {
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
}

impl SemanticChange {
    pub fn modified(field: impl Into<String>, new_value: Value) -> Self {
        Self {
            field: field.into(),
            task_id: None,
            kind: ChangeKind::Modified,
            old_value: None,
            new_value: Some(new_value),
        }
    }

    pub fn for_task(mut self, task_id: impl Into<TaskId>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn is_critical(&self) -> bool {
        is_critical_field(&self.field) || (self.task_id.is_some() && self.kind != ChangeKind::Modified)
    }

    pub fn category(&self) -> FieldCategory {
        FieldCategory::of(&self.field)
    }
}

/// A change notification delivered by the change source. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePayload {
    pub source_type: SourceType,
    pub file_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_id: Option<SpecId>,
    #[serde(default)]
    pub semantic_changes: Vec<SemanticChange>,
    pub timestamp: DateTime<Utc>,
}

impl ChangePayload {
    pub fn new(source_type: SourceType, file_path: impl Into<PathBuf>) -> Self {
        Self {
            source_type,
            file_path: file_path.into(),
            spec_id: None,
            semantic_changes: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_spec(mut self, spec_id: impl Into<SpecId>) -> Self {
        self.spec_id = Some(spec_id.into());
        self
    }

    pub fn with_changes(mut self, changes: Vec<SemanticChange>) -> Self {
        self.semantic_changes = changes;
        self
    }

    /// `true` if any change touches status, assignment, or task structure.
    /// A payload without semantic changes is treated as critical: nothing is known
    /// about what moved.
    pub fn touches_critical_fields(&self) -> bool {
        self.semantic_changes.is_empty() || self.semantic_changes.iter().any(|c| c.is_critical())
    }
}

// ---------------------------------------------------------------------------
// Document tasks
// ---------------------------------------------------------------------------

/// Typed view of one `tasks[]` entry of a specification's frontmatter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEntry {
    pub id: TaskId,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl TaskEntry {
    pub fn task_status(&self) -> Option<TaskStatus> {
        self.status.as_deref().and_then(TaskStatus::parse)
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated.as_deref().and_then(parse_timestamp)
    }
}

/// Parse an RFC 3339 timestamp or a bare `YYYY-MM-DD` date (midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw.trim()) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}
