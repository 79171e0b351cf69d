//! `accord tickets` / `accord resolve`: the manual intervention queue.

use anyhow::{Context, Result};
use clap::{ArgGroup, Args};
use colored::Colorize;
use serde_json::Value;
use tabled::{settings::Style, Table, Tabled};

use accord_daemon::{request_resolve, request_tickets};
use accord_sync::{ManualDecision, ManualInterventionTicket, ResolutionRecord};

use super::{daemon_call, home_dir, print_json};

/// Arguments for `accord tickets`.
#[derive(Args, Debug)]
pub struct TicketsArgs {
    /// Emit machine-readable JSON, including each ticket's full context.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct TicketRow {
    #[tabled(rename = "ticket")]
    id: String,
    #[tabled(rename = "priority")]
    priority: u32,
    #[tabled(rename = "conflict")]
    conflict: String,
    #[tabled(rename = "spec / task")]
    location: String,
    #[tabled(rename = "document")]
    document: String,
    #[tabled(rename = "structured")]
    structured: String,
    #[tabled(rename = "recommended")]
    recommended: String,
    #[tabled(rename = "status")]
    status: String,
}

impl TicketsArgs {
    pub fn run(self) -> Result<()> {
        let home = home_dir()?;
        let data = daemon_call(request_tickets(&home), "list tickets")?;
        let tickets: Vec<ManualInterventionTicket> =
            serde_json::from_value(data).context("daemon returned malformed tickets")?;

        if self.json {
            return print_json(&tickets);
        }
        if tickets.is_empty() {
            println!("No tickets awaiting a decision.");
            return Ok(());
        }

        let rows: Vec<TicketRow> = tickets.iter().map(ticket_row).collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        println!(
            "Resolve with 'accord resolve <ticket> --use-document | --use-structured | --value <json> | --dismiss'."
        );
        Ok(())
    }
}

fn ticket_row(ticket: &ManualInterventionTicket) -> TicketRow {
    let conflict = &ticket.conflict;
    let location = match (&conflict.spec_id, &conflict.task_id) {
        (Some(spec), Some(task)) => format!("{spec} / {task}"),
        (Some(spec), None) => spec.to_string(),
        _ => conflict.file_path.display().to_string(),
    };
    TicketRow {
        id: ticket.id.clone(),
        priority: ticket.priority,
        conflict: format!("{} ({})", conflict.conflict_type, conflict.field),
        location,
        document: compact(&ticket.context.document_value),
        structured: compact(&ticket.context.structured_value),
        recommended: ticket.recommended_strategy.to_string(),
        status: format!("{:?}", ticket.status).to_lowercase(),
    }
}

fn compact(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.chars().count() > 32 {
        let head: String = text.chars().take(29).collect();
        format!("{head}...")
    } else {
        text
    }
}

/// Arguments for `accord resolve`.
#[derive(Args, Debug)]
#[command(group(
    ArgGroup::new("decision")
        .required(true)
        .args(["use_document", "use_structured", "value", "dismiss"]),
))]
pub struct ResolveArgs {
    /// Ticket id as shown by `accord tickets`.
    pub ticket: String,

    /// Write the document store's value into the structured store.
    #[arg(long)]
    pub use_document: bool,

    /// Write the structured store's value into the document.
    #[arg(long)]
    pub use_structured: bool,

    /// Write this value (JSON, or bare text) to both stores.
    #[arg(long)]
    pub value: Option<String>,

    /// Close the ticket without writing anything.
    #[arg(long)]
    pub dismiss: bool,
}

impl ResolveArgs {
    pub fn run(self) -> Result<()> {
        let home = home_dir()?;
        let decision = self.decision();
        let data = daemon_call(
            request_resolve(&home, &self.ticket, decision),
            "resolve ticket",
        )?;
        let record: ResolutionRecord =
            serde_json::from_value(data).context("daemon returned a malformed resolution")?;
        println!(
            "{} ticket {} ({:?})",
            "resolved".green().bold(),
            self.ticket,
            record.state
        );
        for step in &record.resolution_steps {
            println!("  - {step}");
        }
        Ok(())
    }

    fn decision(&self) -> ManualDecision {
        if self.use_document {
            ManualDecision::UseDocument
        } else if self.use_structured {
            ManualDecision::UseStructured
        } else if let Some(raw) = &self.value {
            ManualDecision::Custom(
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone())),
            )
        } else {
            ManualDecision::Dismiss
        }
    }
}
