//! Single authority over the live-session set.
//!
//! The manager owns session creation, capacity enforcement, command
//! routing, and eviction. The live map has exactly one writer (manager
//! methods plus its reaper task); every other component only sees
//! snapshots. Faults inside one session never touch another.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::config::{GlobalConfig, ProviderCommandConfig};
use crate::models::session::{CheckoutSpec, Session, SessionConfig, SessionState};
use crate::orchestrator::session::SessionRuntime;
use crate::protocol::{Decision, InputChunk};
use crate::provider::{build_adapter, ProviderAdapter, ProviderEvent};
use crate::stream::EventStream;
use crate::workspace::WorkspaceProvisioner;
use crate::{AppError, Result};

/// Capacity of the ended-session channel feeding the reaper.
const ENDED_CAPACITY: usize = 64;

/// Adapter constructor, injectable so tests can drive mock providers.
pub type AdapterFactory =
    Arc<dyn Fn(&str, &ProviderCommandConfig) -> Result<Arc<dyn ProviderAdapter>> + Send + Sync>;

/// One live session: its runtime behind the per-session mutex plus the
/// cancellation token for its background tasks.
struct SessionHandle {
    id: String,
    org_id: String,
    runtime: Arc<Mutex<SessionRuntime>>,
    cancel: CancellationToken,
}

/// Owner of all live sessions.
pub struct SessionManager {
    config: Arc<GlobalConfig>,
    stream: Arc<EventStream>,
    workspaces: Arc<dyn WorkspaceProvisioner>,
    live: Mutex<HashMap<String, Arc<SessionHandle>>>,
    /// Terminal sessions already evicted from the live set, kept so a
    /// known-but-finished id stays distinguishable from an unknown one.
    finished: Mutex<HashMap<String, SessionState>>,
    ended_tx: mpsc::Sender<String>,
    adapters: AdapterFactory,
    /// Self-handle for the reaper task.
    weak: Weak<Self>,
}

impl SessionManager {
    /// Create the manager with the built-in adapter registry and start
    /// its reaper task.
    #[must_use]
    pub fn new(
        config: Arc<GlobalConfig>,
        stream: Arc<EventStream>,
        workspaces: Arc<dyn WorkspaceProvisioner>,
    ) -> Arc<Self> {
        Self::with_adapter_factory(
            config,
            stream,
            workspaces,
            Arc::new(|kind, provider_config| build_adapter(kind, provider_config)),
        )
    }

    /// Create the manager with a custom adapter factory.
    #[must_use]
    pub fn with_adapter_factory(
        config: Arc<GlobalConfig>,
        stream: Arc<EventStream>,
        workspaces: Arc<dyn WorkspaceProvisioner>,
        adapters: AdapterFactory,
    ) -> Arc<Self> {
        let (ended_tx, ended_rx) = mpsc::channel(ENDED_CAPACITY);
        let manager = Arc::new_cyclic(|weak: &Weak<Self>| Self {
            config,
            stream,
            workspaces,
            live: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashMap::new()),
            ended_tx,
            adapters,
            weak: weak.clone(),
        });
        manager.spawn_reaper(ended_rx);
        manager
    }

    /// Start a new session.
    ///
    /// Validates the configuration, enforces global and per-org capacity,
    /// registers the session, and resolves once it reaches Running or
    /// Failed (never waits for task completion).
    ///
    /// # Errors
    ///
    /// [`AppError::Validation`] for malformed configs or duplicate ids,
    /// [`AppError::Capacity`] at a concurrency limit (no side effect), or
    /// the launch failure that ended the session.
    pub async fn start_session(&self, config: &SessionConfig) -> Result<Session> {
        let span = info_span!("start_session", org = config.org_id, provider = config.provider);

        async {
            validate_config(config)?;

            let provider_config = self.config.providers.get(&config.provider).ok_or_else(|| {
                AppError::Validation(format!("provider '{}' is not configured", config.provider))
            })?;

            // Capacity checks, adapter construction, and registration share
            // one critical section so racing STARTs cannot both slip under
            // the limit, and a rejected START has no side effect.
            let (handle, events_rx, session_id) = {
                let mut live = self.live.lock().await;

                let max = self.config.max_concurrent_sessions as usize;
                if live.len() >= max {
                    return Err(AppError::Capacity(format!(
                        "concurrent session limit reached ({}/{max})",
                        live.len()
                    )));
                }

                let org_limit = config.billing.max_org_sessions as usize;
                if org_limit > 0 {
                    let org_count = live
                        .values()
                        .filter(|handle| handle.org_id == config.org_id)
                        .count();
                    if org_count >= org_limit {
                        return Err(AppError::Capacity(format!(
                            "org '{}' session limit reached ({org_count}/{org_limit})",
                            config.org_id
                        )));
                    }
                }

                let adapter = (self.adapters)(&config.provider, provider_config)?;
                let runtime = SessionRuntime::new(
                    config,
                    Arc::clone(&adapter),
                    Arc::clone(&self.stream),
                    Arc::clone(&self.workspaces),
                );
                let session_id = runtime.session.id.clone();

                if live.contains_key(&session_id)
                    || self.finished.lock().await.contains_key(&session_id)
                {
                    return Err(AppError::Validation(format!(
                        "session id '{session_id}' already exists"
                    )));
                }

                let events_rx = adapter.subscribe();
                let handle = Arc::new(SessionHandle {
                    id: session_id.clone(),
                    org_id: config.org_id.clone(),
                    runtime: Arc::new(Mutex::new(runtime)),
                    cancel: CancellationToken::new(),
                });
                live.insert(session_id.clone(), Arc::clone(&handle));
                (handle, events_rx, session_id)
            };

            self.spawn_pump(Arc::clone(&handle), events_rx);
            self.spawn_ticker(Arc::clone(&handle));

            info!(session_id, "session registered");

            let launch_result = {
                let mut runtime = handle.runtime.lock().await;
                runtime.launch().await
            };

            match launch_result {
                Ok(()) => {
                    let runtime = handle.runtime.lock().await;
                    Ok(runtime.session.clone())
                }
                Err(err) => {
                    self.retire(&session_id).await;
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Forward operator input to a session.
    ///
    /// # Errors
    ///
    /// [`AppError::NotFound`] for an unknown id,
    /// [`AppError::SessionFinished`] for a finished one, or the session's
    /// own rejection.
    pub async fn send_input(&self, session_id: &str, chunk: InputChunk) -> Result<()> {
        let handle = self.handle(session_id).await?;
        let mut runtime = handle.runtime.lock().await;
        runtime.input(chunk).await
    }

    /// Stop a session. Idempotent system-wide: stopping a session that
    /// already finished succeeds.
    ///
    /// # Errors
    ///
    /// [`AppError::NotFound`] for an unknown id, or an adapter stop
    /// failure.
    pub async fn stop_session(&self, session_id: &str, graceful: bool) -> Result<()> {
        match self.handle(session_id).await {
            Ok(handle) => {
                let result = {
                    let mut runtime = handle.runtime.lock().await;
                    runtime.stop(graceful, None).await
                };
                self.notify_if_ended(&handle).await;
                result
            }
            // Already terminal and evicted: stop is a no-op.
            Err(AppError::SessionFinished(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Pause a session for manual intervention.
    ///
    /// # Errors
    ///
    /// Identifier errors as in [`send_input`](Self::send_input), or the
    /// session's own rejection.
    pub async fn pause_session(&self, session_id: &str) -> Result<()> {
        let handle = self.handle(session_id).await?;
        let mut runtime = handle.runtime.lock().await;
        runtime.pause().await
    }

    /// Resume a paused session.
    ///
    /// # Errors
    ///
    /// Identifier errors as in [`send_input`](Self::send_input), or the
    /// session's own rejection.
    pub async fn resume_session(&self, session_id: &str) -> Result<()> {
        let handle = self.handle(session_id).await?;
        let mut runtime = handle.runtime.lock().await;
        runtime.resume().await
    }

    /// Resolve a pending approval (exactly once).
    ///
    /// # Errors
    ///
    /// Identifier errors as in [`send_input`](Self::send_input),
    /// [`AppError::NotFound`] for an unknown approval id, or
    /// [`AppError::AlreadyResolved`] on a duplicate resolution.
    pub async fn resolve_approval(
        &self,
        session_id: &str,
        approval_id: &str,
        decision: Decision,
        note: Option<String>,
    ) -> Result<()> {
        let handle = self.handle(session_id).await?;
        let result = {
            let mut runtime = handle.runtime.lock().await;
            runtime.resolve_approval(approval_id, decision, note).await
        };
        // A deny ends the session; let the reaper evict it.
        self.notify_if_ended(&handle).await;
        result
    }

    /// Gracefully stop every live session, bounded by the configured
    /// shutdown grace period, then force-stop stragglers.
    pub async fn shutdown(&self) {
        let handles: Vec<Arc<SessionHandle>> =
            self.live.lock().await.values().map(Arc::clone).collect();
        if handles.is_empty() {
            return;
        }
        info!(sessions = handles.len(), "shutting down live sessions");

        let deadline = Duration::from_secs(self.config.shutdown_grace_seconds);
        let graceful = futures_util::future::join_all(handles.iter().map(|handle| async {
            let mut runtime = handle.runtime.lock().await;
            let _ = runtime.stop(true, None).await;
        }));

        if tokio::time::timeout(deadline, graceful).await.is_err() {
            warn!("shutdown deadline exceeded, force-stopping remaining sessions");
            for handle in &handles {
                let mut runtime = handle.runtime.lock().await;
                let _ = runtime.stop(false, None).await;
            }
        }

        for handle in &handles {
            self.retire(&handle.id).await;
        }
    }

    /// Identifiers of currently live sessions (heartbeat snapshot).
    pub async fn active_ids(&self) -> Vec<String> {
        self.live.lock().await.keys().cloned().collect()
    }

    /// Number of live sessions.
    pub async fn live_count(&self) -> usize {
        self.live.lock().await.len()
    }

    /// Snapshots of all live sessions (for the IPC `list` surface).
    pub async fn list_sessions(&self) -> Vec<Session> {
        let handles: Vec<Arc<SessionHandle>> =
            self.live.lock().await.values().map(Arc::clone).collect();
        let mut sessions = Vec::with_capacity(handles.len());
        for handle in handles {
            sessions.push(handle.runtime.lock().await.session.clone());
        }
        sessions
    }

    // ── Internals ─────────────────────────────────────────────────────────

    /// Look up a live session, distinguishing unknown ids from finished
    /// ones.
    async fn handle(&self, session_id: &str) -> Result<Arc<SessionHandle>> {
        if session_id.trim().is_empty() {
            return Err(AppError::Validation("missing session id".into()));
        }
        if let Some(handle) = self.live.lock().await.get(session_id) {
            return Ok(Arc::clone(handle));
        }
        if let Some(state) = self.finished.lock().await.get(session_id) {
            return Err(AppError::SessionFinished(format!(
                "session {session_id} ended in state {state:?}"
            )));
        }
        Err(AppError::NotFound(format!("unknown session {session_id}")))
    }

    async fn notify_if_ended(&self, handle: &Arc<SessionHandle>) {
        let terminal = handle.runtime.lock().await.session.state.is_terminal();
        if terminal {
            let _ = self.ended_tx.send(handle.id.clone()).await;
        }
    }

    /// Evict a session from the live set once its final event is enqueued.
    async fn retire(&self, session_id: &str) {
        let removed = self.live.lock().await.remove(session_id);
        if let Some(handle) = removed {
            let state = handle.runtime.lock().await.session.state;
            self.finished
                .lock()
                .await
                .insert(session_id.to_owned(), state);
            handle.cancel.cancel();
            info!(session_id, ?state, "session evicted from live set");
        }
    }

    fn spawn_reaper(&self, mut ended_rx: mpsc::Receiver<String>) {
        let weak = self.weak.clone();
        tokio::spawn(async move {
            while let Some(session_id) = ended_rx.recv().await {
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.retire(&session_id).await;
            }
        });
    }

    /// Pump provider events into the session runtime until it ends.
    fn spawn_pump(&self, handle: Arc<SessionHandle>, mut events: mpsc::Receiver<ProviderEvent>) {
        let ended_tx = self.ended_tx.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = handle.cancel.cancelled() => break,
                    maybe = events.recv() => match maybe {
                        Some(event) => event,
                        None => break,
                    },
                };

                let mut runtime = handle.runtime.lock().await;
                runtime.handle_provider_event(event).await;
                let terminal = runtime.session.state.is_terminal();
                drop(runtime);

                if terminal {
                    let _ = ended_tx.send(handle.id.clone()).await;
                    break;
                }
            }
        });
    }

    /// Periodic usage reporting and approval-deadline sweep.
    fn spawn_ticker(&self, handle: Arc<SessionHandle>) {
        let interval = Duration::from_secs(self.config.usage_tick_interval_seconds.max(1));
        let ended_tx = self.ended_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = handle.cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }

                let mut runtime = handle.runtime.lock().await;
                if runtime.session.state.is_terminal() {
                    break;
                }
                runtime.expire_due_approvals().await;
                runtime.usage_tick().await;
                let terminal = runtime.session.state.is_terminal();
                drop(runtime);

                if terminal {
                    let _ = ended_tx.send(handle.id.clone()).await;
                    break;
                }
            }
        });
    }
}

/// Validate a START configuration before any side effect.
///
/// # Errors
///
/// Returns [`AppError::Validation`] naming the offending field.
pub fn validate_config(config: &SessionConfig) -> Result<()> {
    if config.org_id.trim().is_empty() {
        return Err(AppError::Validation("org_id must not be empty".into()));
    }
    if config.provider.trim().is_empty() {
        return Err(AppError::Validation("provider must not be empty".into()));
    }
    if config.repo.owner.trim().is_empty() || config.repo.name.trim().is_empty() {
        return Err(AppError::Validation(
            "repo owner and name must not be empty".into(),
        ));
    }
    let checkout_ref = match &config.checkout {
        CheckoutSpec::Branch(value) | CheckoutSpec::Commit(value) | CheckoutSpec::Tag(value) => {
            value
        }
    };
    if checkout_ref.trim().is_empty() {
        return Err(AppError::Validation("checkout ref must not be empty".into()));
    }
    if config.task.goal.trim().is_empty() {
        return Err(AppError::Validation("task goal must not be empty".into()));
    }
    if let Some(session_id) = &config.session_id {
        if session_id.trim().is_empty() {
            return Err(AppError::Validation(
                "session_id, when provided, must not be empty".into(),
            ));
        }
    }
    Ok(())
}
