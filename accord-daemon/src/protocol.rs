//! Newline-delimited JSON control protocol over the daemon's Unix socket.
//!
//! One request per line, one response per line:
//!
//! ```text
//! {"cmd":"status"}
//! {"cmd":"change","change":{"source_type":"document","file_path":"specs/login.md",...}}
//! {"cmd":"resolve","ticket":"<id>","decision":{"decision":"use_structured"}}
//! {"cmd":"replay","ids":["<event id>"]}
//! ```

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use accord_core::ChangePayload;
use accord_sync::ManualDecision;

use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;

/// JSON newline-delimited request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<ChangePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<ManualDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
}

impl DaemonRequest {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            ..Default::default()
        }
    }
}

/// JSON newline-delimited response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Send one JSON request to the daemon socket and return one response.
pub fn send_request(root: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    let socket = socket_path(root);
    if !socket.exists() {
        return Err(DaemonError::DaemonNotRunning { socket });
    }

    let mut stream = UnixStream::connect(&socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            DaemonError::DaemonNotRunning {
                socket: socket.clone(),
            }
        } else {
            io_err(&socket, err)
        }
    })?;

    let payload = serde_json::to_string(request)?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(&socket, e))?;
    stream.write_all(b"\n").map_err(|e| io_err(&socket, e))?;
    stream.flush().map_err(|e| io_err(&socket, e))?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .map_err(|e| io_err(&socket, e))?;
    if read == 0 {
        return Err(DaemonError::Protocol(
            "daemon closed connection before responding".to_string(),
        ));
    }

    let response: DaemonResponse = serde_json::from_str(line.trim_end())?;
    Ok(response)
}

/// `status`, retried briefly so a daemon that is still binding its socket
/// is not reported as down.
pub fn request_status(root: &Path) -> Result<Value, DaemonError> {
    let request = DaemonRequest::new("status");

    let mut last_not_running: Option<DaemonError> = None;
    for attempt in 0..5 {
        match send_request(root, &request) {
            Ok(response) => return response_into_data(response),
            Err(err @ DaemonError::DaemonNotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100));
                    continue;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        DaemonError::Protocol("daemon status retry loop exited unexpectedly".to_string())
    }))
}

pub fn request_stop(root: &Path) -> Result<(), DaemonError> {
    let response = send_request(root, &DaemonRequest::new("stop"))?;
    response_into_data(response).map(|_| ())
}

pub fn request_change(root: &Path, change: ChangePayload) -> Result<Value, DaemonError> {
    let request = DaemonRequest {
        change: Some(change),
        ..DaemonRequest::new("change")
    };
    response_into_data(send_request(root, &request)?)
}

pub fn request_tickets(root: &Path) -> Result<Value, DaemonError> {
    response_into_data(send_request(root, &DaemonRequest::new("tickets"))?)
}

pub fn request_resolve(
    root: &Path,
    ticket: impl Into<String>,
    decision: ManualDecision,
) -> Result<Value, DaemonError> {
    let request = DaemonRequest {
        ticket: Some(ticket.into()),
        decision: Some(decision),
        ..DaemonRequest::new("resolve")
    };
    response_into_data(send_request(root, &request)?)
}

pub fn request_dead_letters(root: &Path) -> Result<Value, DaemonError> {
    response_into_data(send_request(root, &DaemonRequest::new("dead_letters"))?)
}

/// Replay the given dead letters, or all of them when `ids` is empty.
pub fn request_replay(root: &Path, ids: Vec<String>) -> Result<Value, DaemonError> {
    let request = DaemonRequest {
        ids: (!ids.is_empty()).then_some(ids),
        ..DaemonRequest::new("replay")
    };
    response_into_data(send_request(root, &request)?)
}

fn response_into_data(response: DaemonResponse) -> Result<Value, DaemonError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(DaemonError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown daemon error".to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bare_commands_omit_optional_fields() {
        let encoded = serde_json::to_value(DaemonRequest::new("status")).unwrap();
        assert_eq!(encoded, json!({"cmd": "status"}));
    }

    #[test]
    fn resolve_request_carries_a_tagged_decision() {
        let line = r#"{"cmd":"resolve","ticket":"t-1","decision":{"decision":"custom","value":"carol"}}"#;
        let request: DaemonRequest = serde_json::from_str(line).unwrap();
        assert_eq!(request.ticket.as_deref(), Some("t-1"));
        assert_eq!(request.decision, Some(ManualDecision::Custom(json!("carol"))));
    }

    #[test]
    fn missing_socket_means_not_running() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = send_request(dir.path(), &DaemonRequest::new("status")).unwrap_err();
        assert!(matches!(err, DaemonError::DaemonNotRunning { .. }));
    }

    #[test]
    fn error_responses_become_protocol_errors() {
        let err = response_into_data(DaemonResponse::error("no such ticket")).unwrap_err();
        assert!(err.to_string().contains("no such ticket"));
    }
}
