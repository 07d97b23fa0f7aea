//! Local IPC server for `agent-runner-ctl` commands.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! using the `interprocess` crate. Accepts line-delimited JSON requests
//! and routes session commands through the same dispatch validation as
//! the streaming command path, so non-streaming callers get identical
//! rules.
//!
//! ## Protocol
//!
//! Request (one JSON object per line):
//! ```json
//! {"command": "list"}
//! {"command": "status"}
//! {"command": "start", "config": { ... }}
//! {"command": "stop", "id": "sess-1", "graceful": true}
//! ```
//!
//! Response (one JSON object per line):
//! ```json
//! {"ok": true, "data": { ... } }
//! {"ok": false, "error": "capacity: ..."}
//! ```

use std::sync::Arc;

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::models::session::SessionConfig;
use crate::orchestrator::runner::{DispatchOutcome, Runner};
use crate::orchestrator::session_manager::SessionManager;
use crate::protocol::Command;
use crate::{AppError, Result};

/// Inbound IPC request from `agent-runner-ctl`.
#[derive(Debug, Deserialize)]
struct IpcRequest {
    /// Command verb: `list`, `status`, `start`, `stop`.
    command: String,
    /// Session configuration (for `start`).
    config: Option<SessionConfig>,
    /// Session identifier (for `stop`).
    id: Option<String>,
    /// Graceful wind-down flag (for `stop`; defaults to true).
    graceful: Option<bool>,
}

/// Outbound IPC response.
#[derive(Debug, Serialize)]
struct IpcResponse {
    /// Whether the command succeeded.
    ok: bool,
    /// Payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl IpcResponse {
    fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Shared context for IPC handlers.
pub struct IpcState {
    /// Runner used for dispatching start/stop with full validation.
    pub runner: Arc<Runner>,
    /// Manager used for read-only session listings.
    pub manager: Arc<SessionManager>,
}

/// Spawn the IPC server task.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    ipc_name: &str,
    state: Arc<IpcState>,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let name = ipc_name.to_owned();

    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "IPC server listening");

    let handle = tokio::spawn(async move {
        let span = info_span!("ipc_server", name = %name);
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                let state = Arc::clone(&state);
                                tokio::spawn(handle_connection(stream, state));
                            }
                            Err(err) => {
                                warn!(%err, "IPC accept failed");
                            }
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await;
    });

    Ok(handle)
}

/// Handle a single IPC client connection.
async fn handle_connection(
    stream: interprocess::local_socket::tokio::Stream,
    state: Arc<IpcState>,
) {
    let span = info_span!("ipc_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match buf_reader.read_line(&mut line).await {
                Ok(0) => break, // EOF
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let response = match serde_json::from_str::<IpcRequest>(trimmed) {
                        Ok(request) => dispatch_request(&request, &state).await,
                        Err(err) => IpcResponse::error(format!("invalid json: {err}")),
                    };

                    let mut response_line = serde_json::to_string(&response).unwrap_or_else(|_| {
                        r#"{"ok":false,"error":"serialization failed"}"#.to_owned()
                    });
                    response_line.push('\n');

                    if let Err(err) = writer.write_all(response_line.as_bytes()).await {
                        warn!(%err, "failed to write ipc response");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            }
        }
    }
    .instrument(span)
    .await;
}

/// Route an IPC request.
async fn dispatch_request(request: &IpcRequest, state: &Arc<IpcState>) -> IpcResponse {
    let span = info_span!("ipc_command", command = %request.command);
    async move {
        match request.command.as_str() {
            "list" => handle_list(state).await,
            "status" => handle_status(state).await,
            "start" => handle_start(request, state).await,
            "stop" => handle_stop(request, state).await,
            other => IpcResponse::error(format!("unknown command: {other}")),
        }
    }
    .instrument(span)
    .await
}

async fn handle_list(state: &Arc<IpcState>) -> IpcResponse {
    let sessions = state.manager.list_sessions().await;
    let items: Vec<serde_json::Value> = sessions
        .iter()
        .map(|session| {
            serde_json::json!({
                "id": session.id,
                "org_id": session.org_id,
                "provider": session.provider,
                "state": session.state,
                "started_at": session.started_at.to_rfc3339(),
                "usage": session.usage,
            })
        })
        .collect();
    IpcResponse::success(serde_json::json!({ "sessions": items }))
}

async fn handle_status(state: &Arc<IpcState>) -> IpcResponse {
    let runner_state = format!("{:?}", state.runner.state().await).to_lowercase();
    let uptime = state.runner.uptime().await;
    let active = state.manager.live_count().await;
    IpcResponse::success(serde_json::json!({
        "state": runner_state,
        "uptime_seconds": uptime.as_secs(),
        "active_sessions": active,
    }))
}

async fn handle_start(request: &IpcRequest, state: &Arc<IpcState>) -> IpcResponse {
    let Some(config) = request.config.clone() else {
        return IpcResponse::error("start requires a config object");
    };
    match state.runner.dispatch(Command::Start { config }).await {
        Ok(DispatchOutcome::Started(session)) => IpcResponse::success(serde_json::json!({
            "session_id": session.id,
            "state": session.state,
        })),
        Ok(DispatchOutcome::Accepted) => IpcResponse::success(serde_json::json!({})),
        Err(err) => IpcResponse::error(err.to_string()),
    }
}

async fn handle_stop(request: &IpcRequest, state: &Arc<IpcState>) -> IpcResponse {
    let Some(session_id) = request.id.clone() else {
        return IpcResponse::error("stop requires a session id");
    };
    let graceful = request.graceful.unwrap_or(true);
    match state
        .runner
        .dispatch(Command::Stop {
            session_id: session_id.clone(),
            graceful,
        })
        .await
    {
        Ok(_) => IpcResponse::success(serde_json::json!({ "stopped": session_id })),
        Err(err) => IpcResponse::error(err.to_string()),
    }
}
