use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;

use accord_core::config::{self, accord_dir_at};
use accord_core::{FsDocumentStore, FsStructuredStore};

use crate::error::{io_err, DaemonError};
use crate::orchestrator::{Collaborators, Orchestrator};
use crate::paths::socket_path;
use crate::protocol::{DaemonRequest, DaemonResponse};

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(root: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(root.to_path_buf()))
}

/// Build the orchestrator over file-backed stores under `root`.
pub fn build_orchestrator(root: &Path) -> Result<Arc<Orchestrator>, DaemonError> {
    let config = config::load_at(root)?;
    let documents = Arc::new(FsDocumentStore::new(config.paths.documents_dir_at(root)));
    let structured = Arc::new(FsStructuredStore::new(config.paths.state_dir_at(root)));
    tracing::info!(
        documents = %documents.root().display(),
        state = %structured.dir().display(),
        "stores opened",
    );
    Orchestrator::initialize(config, Collaborators::new(documents, structured))
}

/// Run the daemon until `stop` arrives over the socket or ctrl-c.
pub async fn run(root: PathBuf) -> Result<(), DaemonError> {
    let accord_dir = accord_dir_at(&root);
    fs::create_dir_all(&accord_dir).map_err(|e| io_err(&accord_dir, e))?;

    let orchestrator = build_orchestrator(&root)?;
    orchestrator.start();

    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let root = root.clone();
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            let result =
                socket_server_task(root, orchestrator, shutdown.clone(), shutdown.subscribe())
                    .await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (socket_result, signal_result) = tokio::join!(socket_handle, signal_handle);

    let report = orchestrator.stop().await;
    tracing::info!(drained = report.drained, waited_ms = report.waited_ms, "daemon exiting");

    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

pub(crate) async fn socket_server_task(
    root: PathBuf,
    orchestrator: Arc<Orchestrator>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&root);
    if let Some(dir) = socket.parent() {
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    }
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "daemon listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let orchestrator = orchestrator.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, orchestrator, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    orchestrator: Arc<Orchestrator>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let stop = request.cmd == "stop";
        let response = dispatch(&orchestrator, request).await;
        write_response(&mut writer, &response).await?;
        if stop {
            let _ = shutdown_tx.send(());
            break;
        }
    }

    Ok(())
}

/// Execute one protocol command against the orchestrator.
pub async fn dispatch(orchestrator: &Orchestrator, request: DaemonRequest) -> DaemonResponse {
    match request.cmd.as_str() {
        "status" => to_response(orchestrator.status()),
        "change" => {
            let Some(change) = request.change else {
                return DaemonResponse::error("'change' requires a change payload");
            };
            match orchestrator.submit_change(change).await {
                Ok(event_id) => DaemonResponse::ok(json!({ "event_id": event_id })),
                Err(err) => DaemonResponse::error(err.to_string()),
            }
        }
        "tickets" => to_response(orchestrator.resolver().pending_tickets()),
        "resolve" => {
            let (Some(ticket), Some(decision)) = (request.ticket, request.decision) else {
                return DaemonResponse::error("'resolve' requires a ticket and a decision");
            };
            match orchestrator
                .resolver()
                .process_manual_resolution(&ticket, decision)
                .await
            {
                Ok(record) => to_response(record),
                Err(err) => DaemonResponse::error(err.to_string()),
            }
        }
        "dead_letters" => to_response(orchestrator.bus().dead_letters()),
        "replay" => match orchestrator.bus().replay_dead_letter(request.ids.as_deref()) {
            Ok(ids) => DaemonResponse::ok(json!({ "replayed": ids })),
            Err(err) => DaemonResponse::error(err.to_string()),
        },
        "stop" => DaemonResponse::ok(json!({ "stopping": true })),
        other => DaemonResponse::error(format!("unknown command '{other}'")),
    }
}

fn to_response(value: impl serde::Serialize) -> DaemonResponse {
    match serde_json::to_value(value) {
        Ok(data) => DaemonResponse::ok(data),
        Err(err) => DaemonResponse::error(err.to_string()),
    }
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

/// Install the process-wide subscriber. `ACCORD_LOG_FORMAT=json` switches to
/// JSON lines.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("ACCORD_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let _ = if json {
        fmt().with_env_filter(filter).json().try_init()
    } else {
        fmt().with_env_filter(filter).with_target(false).try_init()
    };
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use accord_core::{ChangePayload, SourceType};
    use tempfile::TempDir;

    use crate::protocol::{request_status, request_stop, send_request};

    #[tokio::test]
    async fn dispatch_rejects_incomplete_requests() {
        let root = TempDir::new().unwrap();
        let orchestrator = build_orchestrator(root.path()).unwrap();

        let response = dispatch(&orchestrator, DaemonRequest::new("change")).await;
        assert!(!response.ok);
        let response = dispatch(&orchestrator, DaemonRequest::new("resolve")).await;
        assert!(!response.ok);
        let response = dispatch(&orchestrator, DaemonRequest::new("bogus")).await;
        assert_eq!(response.error.as_deref(), Some("unknown command 'bogus'"));
    }

    #[tokio::test]
    async fn dispatch_reports_status_and_empty_queues() {
        let root = TempDir::new().unwrap();
        let orchestrator = build_orchestrator(root.path()).unwrap();
        orchestrator.start();

        let status = dispatch(&orchestrator, DaemonRequest::new("status")).await;
        assert!(status.ok);
        let data = status.data.unwrap();
        assert_eq!(data["running"], json!(true));
        assert_eq!(data["health"]["status"], json!("healthy"));

        let tickets = dispatch(&orchestrator, DaemonRequest::new("tickets")).await;
        assert_eq!(tickets.data, Some(json!([])));
        let replay = dispatch(&orchestrator, DaemonRequest::new("replay")).await;
        assert_eq!(replay.data, Some(json!({ "replayed": [] })));
    }

    #[tokio::test]
    async fn stopped_orchestrator_refuses_changes_over_dispatch() {
        let root = TempDir::new().unwrap();
        let orchestrator = build_orchestrator(root.path()).unwrap();
        let request = DaemonRequest {
            change: Some(ChangePayload::new(SourceType::Document, "specs/a.md")),
            ..DaemonRequest::new("change")
        };
        let response = dispatch(&orchestrator, request).await;
        assert!(!response.ok);
        assert!(response.error.unwrap().contains("stopped"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn socket_server_answers_status_and_stops() {
        let root = TempDir::new().unwrap();
        let orchestrator = build_orchestrator(root.path()).unwrap();
        orchestrator.start();
        let (shutdown_tx, _) = broadcast::channel::<()>(4);
        let server = tokio::spawn(socket_server_task(
            root.path().to_path_buf(),
            orchestrator,
            shutdown_tx.clone(),
            shutdown_tx.subscribe(),
        ));

        let socket = socket_path(root.path());
        for _ in 0..100 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let path = root.path().to_path_buf();
        let status = tokio::task::spawn_blocking(move || request_status(&path))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status["running"], json!(true));

        let path = root.path().to_path_buf();
        let garbage = tokio::task::spawn_blocking(move || {
            send_request(&path, &DaemonRequest::new("nope"))
        })
        .await
        .unwrap()
        .unwrap();
        assert!(!garbage.ok);

        let path = root.path().to_path_buf();
        tokio::task::spawn_blocking(move || request_stop(&path))
            .await
            .unwrap()
            .unwrap();
        server.await.unwrap().unwrap();
        assert!(!socket.exists());
    }
}
