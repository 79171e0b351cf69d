pub mod change;
pub mod daemon;
pub mod dead_letters;
pub mod tickets;
pub mod validate;

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};

use accord_daemon::DaemonError;

pub(crate) fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

/// Turn a daemon call into an `anyhow` result, with a hint when the daemon
/// is simply not running.
pub(crate) fn daemon_call<T>(result: Result<T, DaemonError>, action: &str) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(DaemonError::DaemonNotRunning { socket }) => Err(anyhow!(
            "daemon is not running (no socket at {}); start it with `accord daemon run`",
            socket.display()
        )),
        Err(err) => Err(err).with_context(|| format!("failed to {action}")),
    }
}

pub(crate) fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to render JSON")?
    );
    Ok(())
}
