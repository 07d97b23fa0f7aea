//! Claude Code adapter.
//!
//! Drives the `claude` CLI in non-interactive streaming mode. The CLI
//! emits one JSON message per stdout line; the adapter parses each line
//! into a [`ProviderEvent`]. Outbound traffic (operator input, action
//! verdicts) is written to the CLI's stdin as NDJSON.
//!
//! # Known stream messages
//!
//! | `event`          | Maps to                                  |
//! |------------------|------------------------------------------|
//! | `terminal`       | [`ProviderEvent::Terminal`]              |
//! | `file`           | [`ProviderEvent::FileTouched`]           |
//! | `diff`           | [`ProviderEvent::Diff`]                  |
//! | `test_run`       | [`ProviderEvent::TestRunStarted`] / [`ProviderEvent::TestRunFinished`] |
//! | `action_request` | [`ProviderEvent::ActionRequested`]       |
//! | `status`         | [`ProviderEvent::Status`]                |
//! | *(any other)*    | [`ProviderEvent::Unknown`] (forwarded)   |
//!
//! Non-JSON lines are treated as plain terminal output; real CLIs print
//! the occasional bare warning line.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use crate::config::ProviderCommandConfig;
use crate::models::approval::{ApprovalCategory, RiskTier};
use crate::protocol::{FileChange, InputMode, TerminalStream};
use crate::provider::codec::ProviderCodec;
use crate::provider::proc::{
    detect_cli, emit, event_slot, force_kill, send_interrupt, set_subscriber, EventSlot,
    ALLOWED_ENV_VARS, STOP_GRACE,
};
use crate::provider::{
    CapabilitySet, CredentialKey, Detection, LaunchSpec, PrWorkflowDepth, ProviderAdapter,
    ProviderEvent, ProviderExit, StartedProvider, EVENT_CHANNEL_CAPACITY,
};
use crate::{AppError, Result};

/// Mutable process state guarded by one async mutex.
#[derive(Default)]
struct ProcState {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    pid: Option<u32>,
    last_exit: Option<ProviderExit>,
}

/// Adapter for the Claude Code CLI.
pub struct ClaudeAdapter {
    config: ProviderCommandConfig,
    state: Arc<Mutex<ProcState>>,
    events: EventSlot,
}

impl ClaudeAdapter {
    /// Create an adapter from the configured launch table entry.
    #[must_use]
    pub fn new(config: ProviderCommandConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(ProcState::default())),
            events: event_slot(),
        }
    }

    async fn write_line(&self, line: String) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(stdin) = state.stdin.as_mut() else {
            return Err(AppError::Provider("no running claude process".into()));
        };
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|err| AppError::Provider(format!("stdin write failed: {err}")))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|err| AppError::Provider(format!("stdin write failed: {err}")))?;
        stdin
            .flush()
            .await
            .map_err(|err| AppError::Provider(format!("stdin flush failed: {err}")))
    }
}

impl ProviderAdapter for ClaudeAdapter {
    fn kind(&self) -> &'static str {
        "claude"
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet {
            streaming_terminal: true,
            structured_diffs: true,
            non_interactive: true,
            plan_and_execute: true,
            pr_workflow: PrWorkflowDepth::Full,
        }
    }

    fn required_credential(&self) -> Option<CredentialKey> {
        Some(CredentialKey {
            keyring_key: "anthropic_api_key",
            env_key: "ANTHROPIC_API_KEY",
        })
    }

    fn detect(&self) -> Pin<Box<dyn Future<Output = Detection> + Send + '_>> {
        Box::pin(async move { detect_cli(&self.config.command).await })
    }

    fn start_session(
        &self,
        launch: LaunchSpec,
    ) -> Pin<Box<dyn Future<Output = Result<StartedProvider>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.child.is_some() {
                return Err(AppError::Provider("claude session already started".into()));
            }

            let mut cmd = Command::new(&self.config.command);
            cmd.args(&self.config.args).arg(&launch.prompt);

            // Strip inherited environment, then inject only the safe
            // allowlist plus resolved credentials and session context.
            cmd.env_clear();
            for &key in ALLOWED_ENV_VARS {
                if let Ok(val) = std::env::var(key) {
                    cmd.env(key, val);
                }
            }
            for (key, value) in &launch.credentials {
                cmd.env(key, value);
            }
            cmd.env("RUNNER_SESSION_ID", &launch.session_id);

            cmd.current_dir(&launch.workspace_root)
                .stdin(std::process::Stdio::piped())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped())
                .kill_on_drop(true);

            let mut child = cmd
                .spawn()
                .map_err(|err| AppError::Provider(format!("failed to spawn claude: {err}")))?;

            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| AppError::Provider("failed to capture claude stdin".into()))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| AppError::Provider("failed to capture claude stdout".into()))?;
            let stderr = child
                .stderr
                .take()
                .ok_or_else(|| AppError::Provider("failed to capture claude stderr".into()))?;

            let mut lines = FramedRead::new(stdout, ProviderCodec::new());

            // Wait for the ready signal (first stdout line) within the
            // configured startup window, then hand the stream to the
            // reader task.
            let startup = Duration::from_secs(self.config.startup_timeout_seconds);
            let first = match tokio::time::timeout(startup, lines.next()).await {
                Ok(Some(Ok(line))) => line,
                Ok(Some(Err(err))) => {
                    let _ = child.kill().await;
                    return Err(AppError::Provider(format!("claude stream error: {err}")));
                }
                Ok(None) => {
                    let _ = child.kill().await;
                    return Err(AppError::Provider(
                        "claude exited before ready signal".into(),
                    ));
                }
                Err(_) => {
                    let _ = child.kill().await;
                    return Err(AppError::Provider(format!(
                        "claude startup timeout after {}s",
                        startup.as_secs()
                    )));
                }
            };

            let pid = child.id();
            info!(
                session_id = launch.session_id,
                pid = pid.unwrap_or(0),
                "claude process spawned"
            );

            if let Some(event) = parse_stream_line(&first) {
                emit(&self.events, event).await;
            }

            // Reader task: stdout lines until EOF, then reap the child and
            // report a spontaneous exit. A commanded stop takes the child
            // first, in which case the exit is reported via `stop`.
            let events = Arc::clone(&self.events);
            let proc_state = Arc::clone(&self.state);
            tokio::spawn(async move {
                while let Some(next) = lines.next().await {
                    match next {
                        Ok(line) => {
                            if let Some(event) = parse_stream_line(&line) {
                                emit(&events, event).await;
                            }
                        }
                        Err(err) => {
                            warn!(%err, "claude stream read error");
                            break;
                        }
                    }
                }

                let mut state = proc_state.lock().await;
                if let Some(mut child) = state.child.take() {
                    let code = child.wait().await.ok().and_then(|status| status.code());
                    state.last_exit = Some(ProviderExit { code });
                    state.stdin = None;
                    drop(state);
                    emit(&events, ProviderEvent::Exited { code }).await;
                }
            });

            // Stderr is forwarded as terminal output.
            let events = Arc::clone(&self.events);
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    emit(
                        &events,
                        ProviderEvent::Terminal {
                            data: line,
                            stream: TerminalStream::Stderr,
                        },
                    )
                    .await;
                }
            });

            state.pid = pid;
            state.stdin = Some(stdin);
            state.child = Some(child);
            state.last_exit = None;

            Ok(StartedProvider { pid })
        })
    }

    fn send_input(
        &self,
        data: &str,
        mode: InputMode,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let msg = json!({
            "method": "input",
            "params": { "data": data, "mode": mode },
        });
        Box::pin(async move { self.write_line(msg.to_string()).await })
    }

    fn resolve_action(
        &self,
        request_id: &str,
        allowed: bool,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let msg = json!({
            "method": "action_response",
            "id": request_id,
            "params": { "allow": allowed },
        });
        Box::pin(async move { self.write_line(msg.to_string()).await })
    }

    fn stop(
        &self,
        graceful: bool,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderExit>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let Some(mut child) = state.child.take() else {
                // Already stopped — idempotent.
                return Ok(state.last_exit.unwrap_or_default());
            };
            state.stdin = None;

            let exit = if graceful {
                send_interrupt(&child);
                match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                    Ok(Ok(status)) => ProviderExit {
                        code: status.code(),
                    },
                    Ok(Err(err)) => {
                        return Err(AppError::Provider(format!("wait failed: {err}")));
                    }
                    Err(_) => {
                        warn!("claude did not exit within grace period, forcing kill");
                        force_kill(&mut child).await?
                    }
                }
            } else {
                force_kill(&mut child).await?
            };

            state.last_exit = Some(exit);
            Ok(exit)
        })
    }

    fn subscribe(&self) -> mpsc::Receiver<ProviderEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        set_subscriber(&self.events, tx);
        rx
    }
}

// ── Stream parsing ────────────────────────────────────────────────────────────

/// Top-level stream message envelope (CLI → adapter).
#[derive(Debug, Deserialize)]
struct ClaudeEnvelope {
    /// Message type identifier.
    event: String,
    /// Correlation id for request/response pairs.
    id: Option<String>,
    /// Event-specific payload.
    #[serde(default)]
    params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct TerminalParams {
    data: String,
    #[serde(default = "default_stream")]
    stream: TerminalStream,
}

fn default_stream() -> TerminalStream {
    TerminalStream::Stdout
}

#[derive(Debug, Deserialize)]
struct FileParams {
    path: String,
    change: FileChange,
}

#[derive(Debug, Deserialize)]
struct DiffParams {
    unified: String,
}

#[derive(Debug, Deserialize)]
struct TestRunParams {
    phase: String,
    suite: Option<String>,
    #[serde(default)]
    passed: u64,
    #[serde(default)]
    failed: u64,
    duration_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ActionParams {
    category: ApprovalCategory,
    summary: String,
    risk: RiskTier,
    command: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusParams {
    message: String,
}

/// Parse one stdout line into a [`ProviderEvent`].
///
/// Lines that are not JSON are surfaced as plain terminal output; JSON
/// messages with an unrecognized `event` are forwarded as
/// [`ProviderEvent::Unknown`]. Recognized messages with a malformed
/// payload are dropped with a warning rather than failing the stream.
#[must_use]
pub fn parse_stream_line(line: &str) -> Option<ProviderEvent> {
    if line.trim().is_empty() {
        return None;
    }

    let Ok(raw) = serde_json::from_str::<serde_json::Value>(line) else {
        return Some(ProviderEvent::Terminal {
            data: line.to_owned(),
            stream: TerminalStream::Stdout,
        });
    };

    let envelope: ClaudeEnvelope = match serde_json::from_value(raw.clone()) {
        Ok(envelope) => envelope,
        Err(_) => return Some(ProviderEvent::Unknown { raw }),
    };

    match envelope.event.as_str() {
        "terminal" => match serde_json::from_value::<TerminalParams>(envelope.params) {
            Ok(p) => Some(ProviderEvent::Terminal {
                data: p.data,
                stream: p.stream,
            }),
            Err(err) => drop_malformed("terminal", &err),
        },
        "file" => match serde_json::from_value::<FileParams>(envelope.params) {
            Ok(p) => Some(ProviderEvent::FileTouched {
                path: p.path,
                change: p.change,
            }),
            Err(err) => drop_malformed("file", &err),
        },
        "diff" => match serde_json::from_value::<DiffParams>(envelope.params) {
            Ok(p) => Some(ProviderEvent::Diff { unified: p.unified }),
            Err(err) => drop_malformed("diff", &err),
        },
        "test_run" => match serde_json::from_value::<TestRunParams>(envelope.params) {
            Ok(p) => Some(match p.phase.as_str() {
                "started" => ProviderEvent::TestRunStarted { suite: p.suite },
                _ => ProviderEvent::TestRunFinished {
                    passed: p.passed,
                    failed: p.failed,
                    duration_ms: p.duration_ms,
                },
            }),
            Err(err) => drop_malformed("test_run", &err),
        },
        "action_request" => {
            let request_id = envelope.id.unwrap_or_default();
            match serde_json::from_value::<ActionParams>(envelope.params) {
                Ok(p) => Some(ProviderEvent::ActionRequested {
                    request_id,
                    category: p.category,
                    summary: p.summary,
                    risk: p.risk,
                    command: p.command,
                }),
                Err(err) => drop_malformed("action_request", &err),
            }
        }
        "status" => match serde_json::from_value::<StatusParams>(envelope.params) {
            Ok(p) => Some(ProviderEvent::Status { message: p.message }),
            Err(err) => drop_malformed("status", &err),
        },
        other => {
            debug!(event = other, "forwarding unknown claude stream message");
            Some(ProviderEvent::Unknown { raw })
        }
    }
}

fn drop_malformed(event: &str, err: &serde_json::Error) -> Option<ProviderEvent> {
    warn!(event, %err, "dropping malformed claude stream message");
    None
}
