//! Conflicts: cross-store disagreements that cannot be repaired mechanically.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use accord_core::types::{FieldCategory, Severity, SourceType, SpecId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Document or state file could not be parsed at all.
    ParseError,
    /// Document task and assignment record name different agents.
    AgentAssignmentMismatch,
    /// Document task and assignment record disagree on status.
    StatusMismatch,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::ParseError => "parse_error",
            ConflictType::AgentAssignmentMismatch => "agent_assignment_mismatch",
            ConflictType::StatusMismatch => "status_mismatch",
        }
    }

    pub fn is_assignment(&self) -> bool {
        matches!(self, ConflictType::AgentAssignmentMismatch)
    }
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last-write times of the two conflicting values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConflictTimestamps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub older: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub newer: Option<DateTime<Utc>>,
    /// Store holding the newer write; `None` if either time is unknown or
    /// both are equal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub newer_source: Option<SourceType>,
}

impl ConflictTimestamps {
    pub fn between(document: Option<DateTime<Utc>>, structured: Option<DateTime<Utc>>) -> Self {
        match (document, structured) {
            (Some(d), Some(s)) if d > s => Self {
                older: Some(s),
                newer: Some(d),
                newer_source: Some(SourceType::Document),
            },
            (Some(d), Some(s)) if s > d => Self {
                older: Some(d),
                newer: Some(s),
                newer_source: Some(SourceType::Structured),
            },
            (Some(d), Some(_)) => Self {
                older: Some(d),
                newer: Some(d),
                newer_source: None,
            },
            (one, other) => Self {
                older: None,
                newer: one.or(other),
                newer_source: None,
            },
        }
    }

    /// Gap between the two writes, if both are known.
    pub fn gap(&self) -> Option<chrono::Duration> {
        match (self.older, self.newer) {
            (Some(older), Some(newer)) => Some(newer - older),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: String,
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    pub severity: Severity,
    /// Side of the change that surfaced the conflict.
    pub source_type: SourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_id: Option<SpecId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    /// Logical field in dispute (`assigned_agent`, `status`, ...).
    pub field: String,
    pub file_path: PathBuf,
    pub timestamps: ConflictTimestamps,
    pub document_data: Value,
    pub structured_data: Value,
    /// Caller-supplied consistency score in `[0,1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_integrity: Option<f64>,
    pub description: String,
    pub detected_at: DateTime<Utc>,
}

impl Conflict {
    pub fn new(
        conflict_type: ConflictType,
        severity: Severity,
        source_type: SourceType,
        field: impl Into<String>,
        file_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conflict_type,
            severity,
            source_type,
            spec_id: None,
            task_id: None,
            field: field.into(),
            file_path: file_path.into(),
            timestamps: ConflictTimestamps::default(),
            document_data: Value::Null,
            structured_data: Value::Null,
            data_integrity: None,
            description: String::new(),
            detected_at: Utc::now(),
        }
    }

    pub fn category(&self) -> FieldCategory {
        FieldCategory::of(&self.field)
    }

    /// The disputed value as held by `source`, if known.
    pub fn value_from(&self, source: SourceType) -> Option<&Value> {
        let data = match source {
            SourceType::Document => &self.document_data,
            SourceType::Structured => &self.structured_data,
        };
        data.get("value").filter(|v| !v.is_null())
    }

    /// Identity of the disagreement, independent of when it was detected.
    /// Re-delivered changes produce conflicts with equal fingerprints.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}",
            self.conflict_type,
            self.spec_id.as_ref().map(SpecId::as_str).unwrap_or(""),
            self.task_id.as_ref().map(TaskId::as_str).unwrap_or(""),
            self.field,
            self.value_from(SourceType::Document).cloned().unwrap_or(Value::Null),
            self.value_from(SourceType::Structured).cloned().unwrap_or(Value::Null),
        )
    }
}
