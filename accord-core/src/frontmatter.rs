//! YAML frontmatter codec for specification documents.
//!
//! A specification is Markdown whose first line is `---`, followed by a YAML
//! mapping and a closing `---` line. The body after the closing fence is kept
//! byte-for-byte across rewrites.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::types::{parse_timestamp, SpecId, TaskEntry, TaskId};

const FENCE: &str = "---";

/// A parsed specification document.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecDocument {
    pub path: PathBuf,
    /// Frontmatter fields in file order.
    pub fields: Map<String, Value>,
    pub body: String,
}

impl SpecDocument {
    /// Parse `content` read from `path`.
    ///
    /// Returns [`StoreError::Parse`] when the fence is missing or the YAML is
    /// not a mapping.
    pub fn parse(path: &Path, content: &str) -> Result<SpecDocument, StoreError> {
        let normalized = content.trim_start_matches('\u{feff}').replace("\r\n", "\n");
        let parse_err = |message: String| StoreError::Parse {
            path: path.to_path_buf(),
            message,
        };

        let Some(rest) = normalized.strip_prefix("---\n") else {
            return Err(parse_err("missing opening frontmatter fence".to_string()));
        };

        let (yaml, body) = if let Some(body) = rest.strip_prefix("---\n") {
            ("", body)
        } else if let Some(idx) = rest.find("\n---\n") {
            (&rest[..idx + 1], &rest[idx + 5..])
        } else if let Some(stripped) = rest.strip_suffix("\n---") {
            (stripped, "")
        } else {
            return Err(parse_err("missing closing frontmatter fence".to_string()));
        };

        let fields = if yaml.trim().is_empty() {
            Map::new()
        } else {
            match serde_yaml::from_str::<Value>(yaml) {
                Ok(Value::Object(map)) => map,
                Ok(other) => {
                    return Err(parse_err(format!(
                        "frontmatter must be a mapping, found {}",
                        json_kind(&other)
                    )))
                }
                Err(err) => return Err(parse_err(err.to_string())),
            }
        };

        Ok(SpecDocument {
            path: path.to_path_buf(),
            fields,
            body: body.to_string(),
        })
    }

    /// Render the document back to Markdown.
    pub fn render(&self) -> Result<String, StoreError> {
        let yaml = if self.fields.is_empty() {
            String::new()
        } else {
            serde_yaml::to_string(&self.fields)?
        };
        Ok(format!("{FENCE}\n{yaml}{FENCE}\n{}", self.body))
    }

    pub fn spec_id(&self) -> Option<SpecId> {
        self.str_field("id").map(SpecId::from)
    }

    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    /// The document's own `updated` timestamp, if present and parseable.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.str_field("updated").and_then(parse_timestamp)
    }

    /// Raw `tasks[]` entries; empty if the field is absent or not a list.
    pub fn raw_tasks(&self) -> &[Value] {
        self.fields
            .get("tasks")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Tasks that carry at least an identifier and a title.
    pub fn tasks(&self) -> Vec<TaskEntry> {
        self.raw_tasks()
            .iter()
            .filter_map(|raw| serde_json::from_value::<TaskEntry>(raw.clone()).ok())
            .collect()
    }

    pub fn task(&self, task_id: &TaskId) -> Option<TaskEntry> {
        self.tasks().into_iter().find(|t| &t.id == task_id)
    }

    /// Apply field updates in order. A `Value::Null` removes the field.
    pub fn apply(&mut self, updates: &[FieldUpdate]) -> Result<(), StoreError> {
        for update in updates {
            let target = match &update.target {
                FieldTarget::Spec => &mut self.fields,
                FieldTarget::Task(task_id) => {
                    let spec_id = self.spec_id().unwrap_or_else(|| SpecId::from(""));
                    let task = self
                        .fields
                        .get_mut("tasks")
                        .and_then(Value::as_array_mut)
                        .and_then(|tasks| {
                            tasks.iter_mut().find(|t| {
                                t.get("id").and_then(Value::as_str) == Some(task_id.as_str())
                            })
                        })
                        .and_then(Value::as_object_mut);
                    match task {
                        Some(task) => task,
                        None => {
                            return Err(StoreError::TaskNotFound {
                                spec_id,
                                task_id: task_id.clone(),
                            })
                        }
                    }
                }
            };
            if update.value.is_null() {
                target.remove(&update.field);
            } else {
                target.insert(update.field.clone(), update.value.clone());
            }
        }
        Ok(())
    }
}

/// Where a frontmatter update lands.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "scope", content = "task_id", rename_all = "snake_case")]
pub enum FieldTarget {
    Spec,
    Task(TaskId),
}

/// One frontmatter field write.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FieldUpdate {
    pub target: FieldTarget,
    pub field: String,
    pub value: Value,
}

impl FieldUpdate {
    pub fn spec(field: impl Into<String>, value: Value) -> Self {
        Self {
            target: FieldTarget::Spec,
            field: field.into(),
            value,
        }
    }

    pub fn task(task_id: impl Into<TaskId>, field: impl Into<String>, value: Value) -> Self {
        Self {
            target: FieldTarget::Task(task_id.into()),
            field: field.into(),
            value,
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}
