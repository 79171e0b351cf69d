//! `accord dead-letters` / `accord replay`.

use anyhow::{Context, Result};
use clap::Args;
use tabled::{settings::Style, Table, Tabled};

use accord_bus::DeadLetter;
use accord_daemon::{request_dead_letters, request_replay};

use super::{daemon_call, home_dir, print_json};

/// Arguments for `accord dead-letters`.
#[derive(Args, Debug)]
pub struct DeadLettersArgs {
    /// Emit machine-readable JSON, including event payloads.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct DeadLetterRow {
    #[tabled(rename = "event")]
    id: String,
    #[tabled(rename = "type")]
    event_type: String,
    #[tabled(rename = "attempts")]
    attempts: String,
    #[tabled(rename = "handler")]
    handler: String,
    #[tabled(rename = "reason")]
    reason: String,
    #[tabled(rename = "failed at")]
    failed_at: String,
}

impl DeadLettersArgs {
    pub fn run(self) -> Result<()> {
        let home = home_dir()?;
        let data = daemon_call(request_dead_letters(&home), "list dead letters")?;
        let letters: Vec<DeadLetter> =
            serde_json::from_value(data).context("daemon returned malformed dead letters")?;

        if self.json {
            return print_json(&letters);
        }
        if letters.is_empty() {
            println!("Dead-letter queue is empty.");
            return Ok(());
        }

        let rows: Vec<DeadLetterRow> = letters
            .iter()
            .map(|letter| DeadLetterRow {
                id: letter.event.metadata.id.clone(),
                event_type: letter.event.event_type.clone(),
                attempts: format!(
                    "{}/{}",
                    letter.event.metadata.attempt, letter.event.metadata.max_attempts
                ),
                handler: letter
                    .handler_id
                    .map(|h| h.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                reason: letter.reason.clone(),
                failed_at: letter.failed_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            })
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}

/// Arguments for `accord replay`.
#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Event ids to replay; all dead letters when omitted.
    pub ids: Vec<String>,
}

impl ReplayArgs {
    pub fn run(self) -> Result<()> {
        let home = home_dir()?;
        let data = daemon_call(request_replay(&home, self.ids), "replay dead letters")?;
        let replayed: Vec<String> = serde_json::from_value(data["replayed"].clone())
            .context("daemon returned a malformed replay result")?;
        if replayed.is_empty() {
            println!("nothing to replay");
        } else {
            println!("replayed {} event(s):", replayed.len());
            for id in replayed {
                println!("  {id}");
            }
        }
        Ok(())
    }
}
