//! Accord: keep specification documents and structured state in agreement.
//!
//! # Usage
//!
//! ```text
//! accord daemon run|stop|status
//! accord change --file <path> --source document|structured [--spec <id>] [--task <id>] [--field <f>...]
//! accord tickets [--json]
//! accord resolve <ticket> (--use-document | --use-structured | --value <json> | --dismiss)
//! accord dead-letters [--json]
//! accord replay [ids...]
//! accord validate <file> [--repair] [--json]
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    change::ChangeArgs,
    daemon::DaemonCommand,
    dead_letters::{DeadLettersArgs, ReplayArgs},
    tickets::{ResolveArgs, TicketsArgs},
    validate::ValidateArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "accord",
    version,
    about = "Synchronize specification documents with structured agent state",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run, stop, or query the orchestrator daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Submit a change notification to the running daemon.
    Change(ChangeArgs),

    /// List manual intervention tickets, highest priority first.
    Tickets(TicketsArgs),

    /// Apply a decision to a manual intervention ticket.
    Resolve(ResolveArgs),

    /// List events that exhausted their retry or age budget.
    DeadLetters(DeadLettersArgs),

    /// Re-publish dead-lettered events (all of them when no id is given).
    Replay(ReplayArgs),

    /// Validate one specification document without a running daemon.
    Validate(ValidateArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Daemon { command } => commands::daemon::run(command),
        Commands::Change(args) => args.run(),
        Commands::Tickets(args) => args.run(),
        Commands::Resolve(args) => args.run(),
        Commands::DeadLetters(args) => args.run(),
        Commands::Replay(args) => args.run(),
        Commands::Validate(args) => args.run(),
    }
}
