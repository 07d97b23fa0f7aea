//! Top-level runner lifecycle and command dispatch.
//!
//! The runner wires the session manager to the event stream, advertises
//! detected provider capabilities, reports heartbeats with host load, and
//! validates every inbound command before it reaches a session.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use sysinfo::{Disks, System};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GlobalConfig;
use crate::models::session::Session;
use crate::orchestrator::session_manager::SessionManager;
use crate::protocol::{Command, Heartbeat, LoadSnapshot};
use crate::provider::{build_adapter, CapabilitySet};
use crate::stream::EventStream;
use crate::{AppError, Result};

/// Capacity of the runner notice channel.
const NOTICE_CAPACITY: usize = 16;

/// Runner lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// Not running; `start` is accepted.
    Stopped,
    /// Startup in progress.
    Starting,
    /// Accepting and dispatching commands.
    Running,
    /// Shutdown in progress.
    Stopping,
}

/// What one detected provider advertises.
#[derive(Debug, Clone)]
pub struct ProviderAdvert {
    /// Whether the backend CLI was found.
    pub installed: bool,
    /// Detected version, when installed.
    pub version: Option<String>,
    /// Static capability set.
    pub capabilities: CapabilitySet,
}

/// Typed notifications emitted by the runner.
#[derive(Debug)]
pub enum RunnerNotice {
    /// The runner reached Running.
    Started {
        /// Detected providers and their capabilities.
        providers: HashMap<String, ProviderAdvert>,
    },
    /// The runner reached Stopped.
    Stopped,
}

/// Result of a successfully dispatched command.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// START accepted; the created session snapshot.
    Started(Box<Session>),
    /// Any other command accepted.
    Accepted,
}

/// Top-level orchestrator process.
pub struct Runner {
    config: Arc<GlobalConfig>,
    manager: Arc<SessionManager>,
    stream: Arc<EventStream>,
    state: Mutex<RunnerState>,
    started_at: Mutex<Option<Instant>>,
    heartbeat_cancel: Mutex<Option<CancellationToken>>,
    provider_versions: Mutex<HashMap<String, String>>,
    notice_tx: mpsc::Sender<RunnerNotice>,
    /// Self-handle for the heartbeat task.
    weak: Weak<Self>,
}

impl Runner {
    /// Create a runner plus its notice receiver.
    #[must_use]
    pub fn new(
        config: Arc<GlobalConfig>,
        manager: Arc<SessionManager>,
        stream: Arc<EventStream>,
    ) -> (Arc<Self>, mpsc::Receiver<RunnerNotice>) {
        let (notice_tx, notice_rx) = mpsc::channel(NOTICE_CAPACITY);
        (
            Arc::new_cyclic(|weak: &Weak<Self>| Self {
                config,
                manager,
                stream,
                state: Mutex::new(RunnerState::Stopped),
                started_at: Mutex::new(None),
                heartbeat_cancel: Mutex::new(None),
                provider_versions: Mutex::new(HashMap::new()),
                notice_tx,
                weak: weak.clone(),
            }),
            notice_rx,
        )
    }

    /// Start the runner: detect providers, open the event stream, begin
    /// heartbeats.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Validation`] when the runner is not currently
    /// stopped (no implicit queuing). A failed initial stream connect is
    /// not an error; the stream reconnects and buffers on its own.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if *state != RunnerState::Stopped {
                return Err(AppError::Validation(format!(
                    "runner cannot start from state {:?}",
                    *state
                )));
            }
            *state = RunnerState::Starting;
        }
        info!(runner_id = self.config.runner_id, "runner starting");

        // Probe configured backends; what we advertise is what we can run.
        let mut adverts = HashMap::new();
        {
            let mut versions = self.provider_versions.lock().await;
            versions.clear();
            for (kind, provider_config) in &self.config.providers {
                let Ok(adapter) = build_adapter(kind, provider_config) else {
                    warn!(kind, "provider configured but no adapter registered");
                    continue;
                };
                let detection = adapter.detect().await;
                if let Some(version) = &detection.version {
                    versions.insert(kind.clone(), version.clone());
                }
                info!(
                    kind,
                    installed = detection.installed,
                    version = detection.version.as_deref().unwrap_or("-"),
                    "provider detected"
                );
                adverts.insert(
                    kind.clone(),
                    ProviderAdvert {
                        installed: detection.installed,
                        version: detection.version,
                        capabilities: adapter.capabilities(),
                    },
                );
            }
        }

        if let Err(err) = self.stream.connect().await {
            warn!(%err, "initial stream connect failed; events will buffer");
        }

        let token = CancellationToken::new();
        *self.heartbeat_cancel.lock().await = Some(token.clone());
        self.spawn_heartbeat(token);

        *self.started_at.lock().await = Some(Instant::now());
        *self.state.lock().await = RunnerState::Running;
        let _ = self
            .notice_tx
            .try_send(RunnerNotice::Started { providers: adverts });
        info!(runner_id = self.config.runner_id, "runner started");
        Ok(())
    }

    /// Stop the runner: drain sessions, disconnect the stream.
    ///
    /// Idempotent — stopping an already-stopped runner succeeds without
    /// observable effect.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            match *state {
                RunnerState::Stopped | RunnerState::Stopping => return Ok(()),
                RunnerState::Starting | RunnerState::Running => *state = RunnerState::Stopping,
            }
        }
        info!(runner_id = self.config.runner_id, "runner stopping");

        if let Some(token) = self.heartbeat_cancel.lock().await.take() {
            token.cancel();
        }

        self.manager.shutdown().await;
        self.stream.disconnect().await;

        *self.started_at.lock().await = None;
        *self.state.lock().await = RunnerState::Stopped;
        let _ = self.notice_tx.try_send(RunnerNotice::Stopped);
        info!(runner_id = self.config.runner_id, "runner stopped");
        Ok(())
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> RunnerState {
        *self.state.lock().await
    }

    /// Wall-clock time since `start` succeeded; zero when not running.
    pub async fn uptime(&self) -> Duration {
        self.started_at
            .lock()
            .await
            .map_or(Duration::ZERO, |at| at.elapsed())
    }

    /// Validate and route one inbound command.
    ///
    /// # Errors
    ///
    /// [`AppError::Validation`] for a missing session id or a runner that
    /// is not running; otherwise whatever the session manager returns.
    pub async fn dispatch(&self, command: Command) -> Result<DispatchOutcome> {
        if *self.state.lock().await != RunnerState::Running {
            return Err(AppError::Validation("runner is not running".into()));
        }

        if let Some(session_id) = command.session_id() {
            if session_id.trim().is_empty() {
                return Err(AppError::Validation(
                    "command requires a session id".into(),
                ));
            }
        }

        match command {
            Command::Start { config } => {
                let session = self.manager.start_session(&config).await?;
                Ok(DispatchOutcome::Started(Box::new(session)))
            }
            Command::Input { session_id, input } => {
                self.manager.send_input(&session_id, input).await?;
                Ok(DispatchOutcome::Accepted)
            }
            Command::Stop {
                session_id,
                graceful,
            } => {
                self.manager.stop_session(&session_id, graceful).await?;
                Ok(DispatchOutcome::Accepted)
            }
            Command::Pause { session_id } => {
                self.manager.pause_session(&session_id).await?;
                Ok(DispatchOutcome::Accepted)
            }
            Command::Resume { session_id } => {
                self.manager.resume_session(&session_id).await?;
                Ok(DispatchOutcome::Accepted)
            }
            Command::Approve {
                session_id,
                approval_id,
                decision,
                note,
            } => {
                if approval_id.trim().is_empty() {
                    return Err(AppError::Validation(
                        "APPROVE requires an approval id".into(),
                    ));
                }
                self.manager
                    .resolve_approval(&session_id, &approval_id, decision, note)
                    .await?;
                Ok(DispatchOutcome::Accepted)
            }
        }
    }

    /// Consume inbound command lines from the coordinator connection.
    ///
    /// Malformed JSON and rejected commands are logged; they never reach a
    /// session.
    pub fn spawn_command_pump(
        &self,
        mut commands: mpsc::Receiver<String>,
    ) -> tokio::task::JoinHandle<()> {
        let weak = self.weak.clone();
        tokio::spawn(async move {
            while let Some(line) = commands.recv().await {
                let Some(runner) = weak.upgrade() else {
                    break;
                };
                let command: Command = match serde_json::from_str(&line) {
                    Ok(command) => command,
                    Err(err) => {
                        warn!(%err, "malformed command frame");
                        continue;
                    }
                };
                match runner.dispatch(command).await {
                    Ok(DispatchOutcome::Started(session)) => {
                        info!(session_id = session.id, "session started via stream");
                    }
                    Ok(DispatchOutcome::Accepted) => {}
                    Err(err) => {
                        warn!(%err, "command rejected");
                    }
                }
            }
        })
    }

    fn spawn_heartbeat(&self, token: CancellationToken) {
        let Some(runner) = self.weak.upgrade() else {
            return;
        };
        let interval = Duration::from_secs(self.config.heartbeat_interval_seconds.max(1));
        tokio::spawn(async move {
            let mut system = System::new();
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }

                let heartbeat = runner.build_heartbeat(&mut system).await;
                if let Err(err) = runner.stream.send_heartbeat(&heartbeat).await {
                    debug!(%err, "heartbeat skipped");
                }
            }
        });
    }

    async fn build_heartbeat(&self, system: &mut System) -> Heartbeat {
        let active = self.manager.active_ids().await;
        let load = sample_load(system, &self.config.workspaces_root);
        let providers = self.provider_versions.lock().await.clone();
        Heartbeat::new(self.config.runner_id.clone(), active, load, providers)
    }
}

/// Sample host load as 0–100 percentages.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn sample_load(system: &mut System, workspaces_root: &Path) -> LoadSnapshot {
    system.refresh_cpu_usage();
    system.refresh_memory();

    let cpu = system.global_cpu_usage().clamp(0.0, 100.0) as u8;
    let memory = if system.total_memory() == 0 {
        0
    } else {
        ((system.used_memory() * 100) / system.total_memory()).min(100) as u8
    };

    // Usage of the volume holding the workspaces: the most specific mount
    // point that is a prefix of the root.
    let disks = Disks::new_with_refreshed_list();
    let disk = disks
        .list()
        .iter()
        .filter(|disk| workspaces_root.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map_or(0, |disk| {
            let total = disk.total_space();
            if total == 0 {
                0
            } else {
                (((total - disk.available_space()) * 100) / total).min(100) as u8
            }
        });

    LoadSnapshot { cpu, memory, disk }
}
