//! `accord validate`: offline check of one specification document.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use accord_core::config;
use accord_core::{ChangePayload, FsDocumentStore, FsStructuredStore, SourceType};
use accord_sync::{StateValidator, ValidationResult};

use super::{home_dir, print_json};

/// Arguments for `accord validate`.
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Specification document to validate.
    pub file: PathBuf,

    /// Apply loss-free repairs to the structured store.
    #[arg(long)]
    pub repair: bool,

    /// Emit the full validation result as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct FindingRow {
    #[tabled(rename = "kind")]
    kind: String,
    #[tabled(rename = "severity")]
    severity: String,
    #[tabled(rename = "task")]
    task: String,
    #[tabled(rename = "description")]
    description: String,
    #[tabled(rename = "state")]
    state: String,
}

impl ValidateArgs {
    pub fn run(self) -> Result<()> {
        let home = home_dir()?;
        let mut config = config::load_at(&home).context("failed to load accord config")?;
        config.validator.repairs_enabled = self.repair;

        let documents = Arc::new(FsDocumentStore::new(config.paths.documents_dir_at(&home)));
        let structured = Arc::new(FsStructuredStore::new(config.paths.state_dir_at(&home)));
        let validator = StateValidator::new(documents, structured, config.validator);
        let payload = ChangePayload::new(SourceType::Document, self.file.clone());

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to start async runtime")?;
        let result = runtime.block_on(validator.validate_change(&payload));

        if self.json {
            print_json(&result)?;
        } else {
            print_report(&result);
        }

        let open = result.unresolved().count() + result.conflicts.len();
        if open > 0 {
            bail!("{} has {open} unresolved finding(s)", self.file.display());
        }
        Ok(())
    }
}

fn print_report(result: &ValidationResult) {
    let spec = result
        .spec_id
        .as_ref()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown spec".to_string());
    println!("{} ({spec})", result.file_path.display());

    let mut rows: Vec<FindingRow> = result
        .inconsistencies
        .iter()
        .map(|i| FindingRow {
            kind: format!("{:?}", i.kind),
            severity: i.severity.to_string(),
            task: i.task_id.as_ref().map(|t| t.to_string()).unwrap_or_default(),
            description: i.description.clone(),
            state: if i.repaired { "repaired" } else { "open" }.to_string(),
        })
        .collect();
    rows.extend(result.conflicts.iter().map(|c| FindingRow {
        kind: c.conflict_type.to_string(),
        severity: c.severity.to_string(),
        task: c.task_id.as_ref().map(|t| t.to_string()).unwrap_or_default(),
        description: c.description.clone(),
        state: "conflict".to_string(),
    }));

    if rows.is_empty() {
        println!("{}", "consistent".green().bold());
    } else {
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
    }
    if !result.repairs_performed.is_empty() {
        println!("{} repair(s) applied", result.repairs_performed.len());
    }
    println!("validated in {:.1} ms", result.performance.duration_ms);
}
