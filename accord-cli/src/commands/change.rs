//! `accord change`: hand a change notification to the running daemon.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Args;
use serde_json::Value;

use accord_core::{ChangePayload, SemanticChange, SourceType};
use accord_daemon::request_change;

use super::{daemon_call, home_dir};

/// Thin wrapper so clap can parse `SourceType` from CLI args.
#[derive(Debug, Clone, Copy)]
pub struct SourceArg(pub SourceType);

impl FromStr for SourceArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        SourceType::parse(&s.to_ascii_lowercase())
            .map(Self)
            .ok_or_else(|| {
                format!(
                    "unknown source '{s}'; expected: {}",
                    SourceType::allowed_values().join(", ")
                )
            })
    }
}

impl fmt::Display for SourceArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Arguments for `accord change`.
#[derive(Args, Debug)]
pub struct ChangeArgs {
    /// File that changed: a specification document or a state file.
    #[arg(long)]
    pub file: PathBuf,

    /// Which store the file belongs to (document or structured).
    #[arg(long)]
    pub source: SourceArg,

    /// Specification the change belongs to, if known.
    #[arg(long)]
    pub spec: Option<String>,

    /// Task the changed fields belong to.
    #[arg(long)]
    pub task: Option<String>,

    /// Changed field, optionally with its new value as `field=<json>`.
    /// Repeatable. No fields means "unknown change" and is always validated.
    #[arg(long = "field")]
    pub fields: Vec<String>,
}

impl ChangeArgs {
    pub fn run(self) -> Result<()> {
        let home = home_dir()?;
        let payload = self.payload()?;
        let response = daemon_call(request_change(&home, payload), "submit change")?;
        match response.get("event_id").and_then(Value::as_str) {
            Some(id) => println!("change submitted: {id}"),
            None => println!("change submitted"),
        }
        Ok(())
    }

    fn payload(&self) -> Result<ChangePayload> {
        let file = if self.file.is_absolute() {
            self.file.clone()
        } else {
            std::env::current_dir()
                .context("could not determine current directory")?
                .join(&self.file)
        };
        let mut payload = ChangePayload::new(self.source.0, file);
        if let Some(spec) = &self.spec {
            payload = payload.with_spec(spec.as_str());
        }
        let changes = self
            .fields
            .iter()
            .map(|field| {
                let change = parse_field(field);
                match &self.task {
                    Some(task) => change.for_task(task.as_str()),
                    None => change,
                }
            })
            .collect();
        Ok(payload.with_changes(changes))
    }
}

/// `status=completed` and `status="completed"` both yield a string value;
/// valid JSON is taken as-is.
fn parse_field(raw: &str) -> SemanticChange {
    match raw.split_once('=') {
        Some((field, value)) => {
            let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
            SemanticChange::modified(field.trim(), value)
        }
        None => SemanticChange::modified(raw.trim(), Value::Null),
    }
}
