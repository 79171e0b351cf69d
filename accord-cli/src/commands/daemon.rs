//! `accord daemon`: foreground runtime and socket lifecycle.

use anyhow::{Context, Result};
use clap::Subcommand;

use accord_daemon::paths::socket_path;
use accord_daemon::{request_status, request_stop, start_blocking, DaemonError};

use super::{home_dir, print_json};

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the orchestrator in the foreground (socket server + health monitor).
    Run,
    /// Request graceful daemon shutdown over the Unix socket.
    Stop,
    /// Query daemon health and component statistics.
    Status,
}

pub fn run(command: DaemonCommand) -> Result<()> {
    let home = home_dir()?;

    match command {
        DaemonCommand::Run => {
            start_blocking(&home).context("daemon exited with error")?;
        }
        DaemonCommand::Stop => match request_stop(&home) {
            Ok(()) => println!("daemon stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => {
                println!("daemon is not running");
            }
            Err(err) => return Err(err).context("failed to stop daemon"),
        },
        DaemonCommand::Status => match request_status(&home) {
            Ok(status) => print_json(&status)?,
            Err(DaemonError::DaemonNotRunning { .. }) => {
                print_json(&serde_json::json!({
                    "running": false,
                    "socket": socket_path(&home).display().to_string(),
                }))?;
            }
            Err(err) => return Err(err).context("failed to query daemon status"),
        },
    }

    Ok(())
}
