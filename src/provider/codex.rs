//! Codex adapter.
//!
//! Drives the `codex` CLI in exec mode. Codex has no structured stream:
//! stdout and stderr are plain text, forwarded as terminal chunks, and
//! the only lifecycle signal is process exit. Because the backend never
//! raises action gates, all policy enforcement for codex sessions happens
//! at the session layer before input is forwarded.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::config::ProviderCommandConfig;
use crate::protocol::{InputMode, TerminalStream};
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

/// Adapter for the Codex CLI.
pub struct CodexAdapter {
    config: ProviderCommandConfig,
    state: Arc<Mutex<ProcState>>,
    events: EventSlot,
}

impl CodexAdapter {
    /// Create an adapter from the configured launch table entry.
    #[must_use]
    pub fn new(config: ProviderCommandConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(ProcState::default())),
            events: event_slot(),
        }
    }
}

impl ProviderAdapter for CodexAdapter {
    fn kind(&self) -> &'static str {
        "codex"
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet {
            streaming_terminal: true,
            structured_diffs: false,
            non_interactive: true,
            plan_and_execute: false,
            pr_workflow: PrWorkflowDepth::Draft,
        }
    }

    fn required_credential(&self) -> Option<CredentialKey> {
        Some(CredentialKey {
            keyring_key: "openai_api_key",
            env_key: "OPENAI_API_KEY",
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
                return Err(AppError::Provider("codex session already started".into()));
            }

            let mut cmd = Command::new(&self.config.command);
            cmd.args(&self.config.args).arg(&launch.prompt);

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
                .map_err(|err| AppError::Provider(format!("failed to spawn codex: {err}")))?;

            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| AppError::Provider("failed to capture codex stdin".into()))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| AppError::Provider("failed to capture codex stdout".into()))?;
            let stderr = child
                .stderr
                .take()
                .ok_or_else(|| AppError::Provider("failed to capture codex stderr".into()))?;

            let mut lines = BufReader::new(stdout).lines();

            // First output line is the ready signal.
            let startup = Duration::from_secs(self.config.startup_timeout_seconds);
            let first = match tokio::time::timeout(startup, lines.next_line()).await {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => {
                    let _ = child.kill().await;
                    return Err(AppError::Provider("codex exited before ready signal".into()));
                }
                Ok(Err(err)) => {
                    let _ = child.kill().await;
                    return Err(AppError::Provider(format!("codex stream error: {err}")));
                }
                Err(_) => {
                    let _ = child.kill().await;
                    return Err(AppError::Provider(format!(
                        "codex startup timeout after {}s",
                        startup.as_secs()
                    )));
                }
            };

            let pid = child.id();
            info!(
                session_id = launch.session_id,
                pid = pid.unwrap_or(0),
                "codex process spawned"
            );

            emit(
                &self.events,
                ProviderEvent::Terminal {
                    data: first,
                    stream: TerminalStream::Stdout,
                },
            )
            .await;

            let events = Arc::clone(&self.events);
            let proc_state = Arc::clone(&self.state);
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    emit(
                        &events,
                        ProviderEvent::Terminal {
                            data: line,
                            stream: TerminalStream::Stdout,
                        },
                    )
                    .await;
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
        let mut payload = data.to_owned();
        if mode == InputMode::Line && !payload.ends_with('\n') {
            payload.push('\n');
        }
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let Some(stdin) = state.stdin.as_mut() else {
                return Err(AppError::Provider("no running codex process".into()));
            };
            stdin
                .write_all(payload.as_bytes())
                .await
                .map_err(|err| AppError::Provider(format!("stdin write failed: {err}")))?;
            stdin
                .flush()
                .await
                .map_err(|err| AppError::Provider(format!("stdin flush failed: {err}")))
        })
    }

    fn resolve_action(
        &self,
        request_id: &str,
        _allowed: bool,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let request_id = request_id.to_owned();
        Box::pin(async move {
            Err(AppError::Provider(format!(
                "codex raises no action gates (request '{request_id}')"
            )))
        })
    }

    fn stop(
        &self,
        graceful: bool,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderExit>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let Some(mut child) = state.child.take() else {
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
                        warn!("codex did not exit within grace period, forcing kill");
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
