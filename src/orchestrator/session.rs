//! Per-session state machine and provider-event translation.
//!
//! A [`SessionRuntime`] drives one engagement through its lifecycle and
//! turns raw [`ProviderEvent`]s into Runner Events with gapless
//! per-session sequence numbers. All methods are called under the
//! session's mutex, so a session processes one transition at a time while
//! distinct sessions run fully in parallel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::resolve_secret;
use crate::diff;
use crate::models::approval::{ApprovalCategory, ApprovalRequest, ApprovalStatus, RiskTier};
use crate::models::policy::CompiledPolicy;
use crate::models::session::{Session, SessionConfig, SessionState, TaskSpec};
use crate::policy::{evaluate, PolicyDecision};
use crate::protocol::{AlertSeverity, Decision, EventPayload, InputChunk, RunnerEvent, epoch_ms};
use crate::provider::{LaunchSpec, ProviderAdapter, ProviderEvent};
use crate::stream::EventStream;
use crate::workspace::{WorkspaceHandle, WorkspaceProvisioner};
use crate::{AppError, Result};

/// A raised gate awaiting its decision.
struct PendingGate {
    request: ApprovalRequest,
    /// Provider-side correlation id for routing the verdict back.
    provider_request_id: String,
    /// Implicit-deny deadline derived from the session policy.
    deadline: Option<DateTime<Utc>>,
}

/// One session's runtime state.
pub struct SessionRuntime {
    /// Session entity (single writer: this runtime).
    pub session: Session,
    adapter: Arc<dyn ProviderAdapter>,
    policy: CompiledPolicy,
    stream: Arc<EventStream>,
    workspaces: Arc<dyn WorkspaceProvisioner>,
    workspace: Option<WorkspaceHandle>,
    pending: HashMap<String, PendingGate>,
    /// Ids of approvals that have been decided, kept for exactly-once
    /// rejection of duplicate resolutions.
    resolved: HashSet<String>,
    /// Input parked while the session is gated or paused.
    queued_input: Vec<InputChunk>,
    touched_files: HashSet<String>,
    terminal_bytes: u64,
    failure_reason: Option<String>,
    /// SESSION_ENDED emitted latch; exactly one per session.
    ended: bool,
}

impl SessionRuntime {
    /// Build the runtime for a freshly accepted START.
    #[must_use]
    pub fn new(
        config: &SessionConfig,
        adapter: Arc<dyn ProviderAdapter>,
        stream: Arc<EventStream>,
        workspaces: Arc<dyn WorkspaceProvisioner>,
    ) -> Self {
        Self {
            session: Session::from_config(config),
            adapter,
            policy: CompiledPolicy::from_spec(config.policy.clone()),
            stream,
            workspaces,
            workspace: None,
            pending: HashMap::new(),
            resolved: HashSet::new(),
            queued_input: Vec::new(),
            touched_files: HashSet::new(),
            terminal_bytes: 0,
            failure_reason: None,
            ended: false,
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    /// Drive the START path: workspace, credential pre-flight, provider
    /// spawn. Resolves once the session is Running or Failed; start
    /// failures are terminal for this session (no retries here).
    ///
    /// # Errors
    ///
    /// Returns the failure that ended the session; SESSION_ENDED has
    /// already been emitted in that case.
    pub async fn launch(&mut self) -> Result<()> {
        self.transition(SessionState::PreparingWorkspace).await?;
        let workspace = match self.workspaces.prepare(&self.session.id).await {
            Ok(handle) => handle,
            Err(err) => {
                let reason = format!("workspace preparation failed: {err}");
                self.finish(SessionState::Failed, Some(reason)).await;
                return Err(err);
            }
        };
        self.workspace = Some(workspace);

        self.transition(SessionState::StartingProvider).await?;

        // Credential pre-flight: a missing key must surface before any
        // process is spawned.
        let mut credentials = Vec::new();
        if let Some(key) = self.adapter.required_credential() {
            match resolve_secret(key.keyring_key, key.env_key).await {
                Ok(value) => credentials.push((key.env_key.to_owned(), value)),
                Err(err) => {
                    let reason = format!("credential pre-flight failed: {err}");
                    self.finish(SessionState::Failed, Some(reason)).await;
                    return Err(err);
                }
            }
        }

        let launch = LaunchSpec {
            session_id: self.session.id.clone(),
            workspace_root: self
                .workspace
                .as_ref()
                .map(|handle| handle.root.clone())
                .unwrap_or_default(),
            prompt: build_prompt(&self.session.task),
            credentials,
        };

        match self.adapter.start_session(launch).await {
            Ok(started) => {
                self.emit(EventPayload::SessionStarted {
                    provider: self.session.provider.clone(),
                    pid: started.pid,
                })
                .await;
                self.transition(SessionState::Running).await?;
                info!(session_id = self.session.id, "session running");
                Ok(())
            }
            Err(err) => {
                let reason = format!("provider start failed: {err}");
                self.finish(SessionState::Failed, Some(reason)).await;
                Err(err)
            }
        }
    }

    /// Stop the session. Idempotent: a terminal or already-stopping
    /// session returns `Ok` without side effects.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Provider`] only when the adapter's stop itself
    /// fails at the OS level; the session still finishes as Failed.
    pub async fn stop(&mut self, graceful: bool, reason: Option<String>) -> Result<()> {
        if self.session.state.is_terminal() || self.session.state == SessionState::Stopping {
            return Ok(());
        }

        if !graceful {
            // Immediate cancellation abandons queued input and gates.
            self.queued_input.clear();
            self.abandon_pending_gates().await;
        }

        if let Some(r) = reason {
            self.failure_reason.get_or_insert(r);
        }

        self.transition(SessionState::Stopping).await?;

        match self.adapter.stop(graceful).await {
            Ok(exit) => {
                let reason = self.failure_reason.take();
                let failed =
                    reason.is_some() || matches!(exit.code, Some(code) if code != 0);
                let final_state = if failed {
                    SessionState::Failed
                } else {
                    SessionState::Completed
                };
                let reason = reason.or_else(|| {
                    exit.code
                        .filter(|code| *code != 0)
                        .map(|code| format!("provider exited with code {code}"))
                });
                self.finish(final_state, reason).await;
                Ok(())
            }
            Err(err) => {
                let reason = format!("provider stop failed: {err}");
                self.finish(SessionState::Failed, Some(reason)).await;
                Err(err)
            }
        }
    }

    /// Pause for manual intervention. Legal from Running and
    /// WaitingForApproval; a pending approval survives the pause.
    ///
    /// # Errors
    ///
    /// [`AppError::SessionFinished`] on a terminal session,
    /// [`AppError::Validation`] from any other state.
    pub async fn pause(&mut self) -> Result<()> {
        match self.session.state {
            SessionState::Running | SessionState::WaitingForApproval => {
                self.transition(SessionState::PausedByHuman).await
            }
            state if state.is_terminal() => Err(AppError::SessionFinished(format!(
                "session {} already ended",
                self.session.id
            ))),
            state => Err(AppError::Validation(format!(
                "cannot pause session in state {state:?}"
            ))),
        }
    }

    /// Resume after a pause. Returns to WaitingForApproval when a gate is
    /// still pending, otherwise to Running with queued input released.
    ///
    /// # Errors
    ///
    /// [`AppError::SessionFinished`] on a terminal session,
    /// [`AppError::Validation`] from any non-paused state.
    pub async fn resume(&mut self) -> Result<()> {
        match self.session.state {
            SessionState::PausedByHuman => {
                if self.pending.is_empty() {
                    self.transition(SessionState::Running).await?;
                    self.release_queued_input().await;
                } else {
                    self.transition(SessionState::WaitingForApproval).await?;
                }
                Ok(())
            }
            state if state.is_terminal() => Err(AppError::SessionFinished(format!(
                "session {} already ended",
                self.session.id
            ))),
            state => Err(AppError::Validation(format!(
                "cannot resume session in state {state:?}"
            ))),
        }
    }

    /// Forward operator input. Queued while gated or paused, rejected on
    /// terminal sessions.
    ///
    /// # Errors
    ///
    /// [`AppError::SessionFinished`] on a terminal session,
    /// [`AppError::Validation`] when the provider is not yet running,
    /// [`AppError::Provider`] on a failed write.
    pub async fn input(&mut self, chunk: InputChunk) -> Result<()> {
        match self.session.state {
            SessionState::Running => {
                self.adapter.send_input(&chunk.data, chunk.mode).await
            }
            SessionState::WaitingForApproval | SessionState::PausedByHuman => {
                self.queued_input.push(chunk);
                Ok(())
            }
            state if state.is_terminal() => Err(AppError::SessionFinished(format!(
                "session {} already ended",
                self.session.id
            ))),
            state => Err(AppError::Validation(format!(
                "session not accepting input in state {state:?}"
            ))),
        }
    }

    /// Resolve a pending approval exactly once.
    ///
    /// # Errors
    ///
    /// [`AppError::AlreadyResolved`] on a second resolution,
    /// [`AppError::NotFound`] for an unknown approval id.
    pub async fn resolve_approval(
        &mut self,
        approval_id: &str,
        decision: Decision,
        note: Option<String>,
    ) -> Result<()> {
        if self.resolved.contains(approval_id) {
            return Err(AppError::AlreadyResolved(format!(
                "approval {approval_id} was already decided"
            )));
        }
        let Some(mut gate) = self.pending.remove(approval_id) else {
            return Err(AppError::NotFound(format!(
                "no pending approval {approval_id}"
            )));
        };
        self.resolved.insert(approval_id.to_owned());

        let allowed = decision == Decision::Allow;
        gate.request.status = if allowed {
            ApprovalStatus::Allowed
        } else {
            ApprovalStatus::Denied
        };

        self.emit(EventPayload::ApprovalResolved {
            approval_id: approval_id.to_owned(),
            allowed,
            note,
        })
        .await;

        if let Err(err) = self
            .adapter
            .resolve_action(&gate.provider_request_id, allowed)
            .await
        {
            warn!(
                session_id = self.session.id,
                approval_id, %err,
                "failed to deliver verdict to provider"
            );
        }

        if allowed {
            if gate.request.category == ApprovalCategory::Shell {
                self.session.usage.commands_run += 1;
            }
            if self.session.state == SessionState::WaitingForApproval && self.pending.is_empty()
            {
                self.transition(SessionState::Running).await?;
                self.release_queued_input().await;
            }
            // A session paused by a human stays paused; the allow takes
            // effect on RESUME.
            Ok(())
        } else {
            let reason = format!("approval denied: {}", gate.request.summary);
            self.stop(true, Some(reason)).await
        }
    }

    // ── Provider events ───────────────────────────────────────────────────

    /// Translate one provider event. Called by the session's pump task.
    pub async fn handle_provider_event(&mut self, event: ProviderEvent) {
        if self.session.state.is_terminal() {
            return;
        }

        match event {
            ProviderEvent::Terminal { data, stream } => {
                self.terminal_bytes += data.len() as u64;
                self.emit(EventPayload::TerminalChunk { data, stream }).await;
            }
            ProviderEvent::FileTouched { path, change } => {
                self.touched_files.insert(path.clone());
                self.session.usage.files_touched = self.touched_files.len() as u64;
                self.emit(EventPayload::FileTouched { path, change }).await;
            }
            ProviderEvent::Diff { unified } => {
                let stats = diff::summarize_unified(&unified);
                self.emit(EventPayload::DiffSummary {
                    files_changed: stats.files_changed,
                    insertions: stats.insertions,
                    deletions: stats.deletions,
                })
                .await;
            }
            ProviderEvent::TestRunStarted { suite } => {
                self.emit(EventPayload::TestRunStarted { suite }).await;
            }
            ProviderEvent::TestRunFinished {
                passed,
                failed,
                duration_ms,
            } => {
                self.emit(EventPayload::TestRunFinished {
                    passed,
                    failed,
                    duration_ms,
                })
                .await;
            }
            ProviderEvent::ActionRequested {
                request_id,
                category,
                summary,
                risk,
                command,
            } => {
                self.handle_action_request(request_id, category, summary, risk, command)
                    .await;
            }
            ProviderEvent::Status { message } => {
                self.emit(EventPayload::ProviderEventForwarded {
                    raw: serde_json::json!({ "event": "status", "message": message }),
                })
                .await;
            }
            ProviderEvent::Unknown { raw } => {
                self.emit(EventPayload::ProviderEventForwarded { raw }).await;
            }
            ProviderEvent::Exited { code } => {
                if self.session.state == SessionState::Stopping {
                    // A commanded stop reports the exit via its own path.
                    return;
                }
                let _ = self.transition(SessionState::Stopping).await;
                let (final_state, reason) = match code {
                    Some(0) => (SessionState::Completed, None),
                    Some(code) => (
                        SessionState::Failed,
                        Some(format!("provider exited with code {code}")),
                    ),
                    None => (
                        SessionState::Failed,
                        Some("provider terminated by signal".to_owned()),
                    ),
                };
                self.finish(final_state, reason).await;
            }
        }
    }

    async fn handle_action_request(
        &mut self,
        request_id: String,
        category: ApprovalCategory,
        summary: String,
        risk: RiskTier,
        command: Option<String>,
    ) {
        match evaluate(&self.policy, category, risk, command.as_deref()) {
            PolicyDecision::Allow => {
                if category == ApprovalCategory::Shell {
                    self.session.usage.commands_run += 1;
                }
                if let Err(err) = self.adapter.resolve_action(&request_id, true).await {
                    warn!(session_id = self.session.id, %err, "allow delivery failed");
                }
            }
            PolicyDecision::Deny { reason } => {
                if let Err(err) = self.adapter.resolve_action(&request_id, false).await {
                    warn!(session_id = self.session.id, %err, "deny delivery failed");
                }
                if let Err(err) = self.stop(true, Some(reason)).await {
                    warn!(session_id = self.session.id, %err, "policy stop failed");
                }
            }
            PolicyDecision::RequireApproval => {
                let timeout = self.policy.raw.approval_timeout_seconds;
                let request = ApprovalRequest::new(
                    self.session.id.clone(),
                    category,
                    summary,
                    risk,
                    timeout,
                );
                self.session.usage.approvals_requested += 1;
                let deadline = timeout
                    .and_then(|secs| i64::try_from(secs).ok())
                    .map(|secs| Utc::now() + chrono::Duration::seconds(secs));
                self.pending.insert(
                    request.id.clone(),
                    PendingGate {
                        request: request.clone(),
                        provider_request_id: request_id,
                        deadline,
                    },
                );
                self.emit(EventPayload::ApprovalRequested { approval: request })
                    .await;
                if self.session.state == SessionState::Running {
                    let _ = self.transition(SessionState::WaitingForApproval).await;
                }
            }
        }
    }

    // ── Periodic work ─────────────────────────────────────────────────────

    /// Emit a USAGE_TICK and enforce the billing duration limit. Called by
    /// the session's ticker task.
    pub async fn usage_tick(&mut self) {
        if self.session.state.is_terminal() || self.session.state == SessionState::Stopping {
            return;
        }
        self.refresh_usage();
        self.emit(EventPayload::UsageTick {
            usage: self.session.usage,
        })
        .await;

        let limit = self.session.billing.max_duration_seconds;
        if limit > 0 && self.session.usage.agent_seconds > limit {
            self.emit(EventPayload::AlertRaised {
                severity: AlertSeverity::Warning,
                message: format!("session exceeded max duration of {limit}s; stopping"),
            })
            .await;
            if let Err(err) = self.stop(true, Some("duration limit exceeded".into())).await {
                warn!(session_id = self.session.id, %err, "duration stop failed");
            }
        }
    }

    /// Implicitly deny approvals whose deadline has passed. Called by the
    /// session's ticker task.
    pub async fn expire_due_approvals(&mut self) {
        let now = Utc::now();
        let due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, gate)| gate.deadline.is_some_and(|deadline| now >= deadline))
            .map(|(id, _)| id.clone())
            .collect();

        for approval_id in due {
            let Some(mut gate) = self.pending.remove(&approval_id) else {
                continue;
            };
            self.resolved.insert(approval_id.clone());
            gate.request.status = ApprovalStatus::TimedOut;
            warn!(
                session_id = self.session.id,
                approval_id, "approval timed out, implicit deny"
            );
            self.emit(EventPayload::ApprovalResolved {
                approval_id,
                allowed: false,
                note: Some("approval timed out".into()),
            })
            .await;
            if let Err(err) = self
                .adapter
                .resolve_action(&gate.provider_request_id, false)
                .await
            {
                warn!(session_id = self.session.id, %err, "deny delivery failed");
            }
            let reason = format!("approval timed out: {}", gate.request.summary);
            if let Err(err) = self.stop(true, Some(reason)).await {
                warn!(session_id = self.session.id, %err, "timeout stop failed");
            }
        }
    }

    // ── Internals ─────────────────────────────────────────────────────────

    async fn transition(&mut self, to: SessionState) -> Result<()> {
        let from = self.session.state;
        if !from.can_transition_to(to) {
            return Err(AppError::Validation(format!(
                "cannot transition session from {from:?} to {to:?}"
            )));
        }
        self.session.state = to;
        self.emit(EventPayload::SessionStateChanged { from, to }).await;
        Ok(())
    }

    async fn emit(&mut self, payload: EventPayload) {
        let seq = self.session.claim_seq();
        let event = RunnerEvent {
            session_id: self.session.id.clone(),
            org_id: self.session.org_id.clone(),
            ts: epoch_ms(),
            seq,
            payload,
        };
        let _ = self.stream.send(event).await;
    }

    /// Emit the single SESSION_ENDED, settle the final state, and release
    /// the workspace.
    async fn finish(&mut self, final_state: SessionState, reason: Option<String>) {
        if self.ended {
            return;
        }
        if self.session.state != final_state {
            if let Err(err) = self.transition(final_state).await {
                warn!(session_id = self.session.id, %err, "final transition rejected");
                return;
            }
        }
        self.ended = true;
        self.refresh_usage();

        let duration_seconds = self.session.usage.agent_seconds;
        self.emit(EventPayload::SessionEnded {
            final_state,
            reason: reason.clone(),
            duration_seconds,
            usage: self.session.usage,
        })
        .await;
        info!(
            session_id = self.session.id,
            ?final_state,
            reason = reason.as_deref().unwrap_or("-"),
            "session ended"
        );

        if let Some(handle) = self.workspace.take() {
            if let Err(err) = self.workspaces.teardown(handle).await {
                warn!(session_id = self.session.id, %err, "workspace teardown failed");
            }
        }
    }

    fn refresh_usage(&mut self) {
        let elapsed = Utc::now() - self.session.started_at;
        self.session.usage.agent_seconds = u64::try_from(elapsed.num_seconds()).unwrap_or(0);
        self.session.usage.terminal_kb = self.terminal_bytes / 1024;
        self.session.usage.files_touched = self.touched_files.len() as u64;
    }

    async fn release_queued_input(&mut self) {
        let queued = std::mem::take(&mut self.queued_input);
        for chunk in queued {
            if let Err(err) = self.adapter.send_input(&chunk.data, chunk.mode).await {
                warn!(
                    session_id = self.session.id,
                    %err,
                    "queued input delivery failed"
                );
            }
        }
    }

    async fn abandon_pending_gates(&mut self) {
        for (approval_id, gate) in self.pending.drain() {
            self.resolved.insert(approval_id);
            let _ = self
                .adapter
                .resolve_action(&gate.provider_request_id, false)
                .await;
        }
    }
}

/// Compose the backend prompt from the task specification.
fn build_prompt(task: &TaskSpec) -> String {
    let mut prompt = format!("{}\n\n{}", task.title, task.goal);
    if !task.constraints.is_empty() {
        prompt.push_str("\n\nConstraints:\n");
        for constraint in &task.constraints {
            prompt.push_str("- ");
            prompt.push_str(constraint);
            prompt.push('\n');
        }
    }
    if !task.acceptance_criteria.is_empty() {
        prompt.push_str("\nAcceptance criteria:\n");
        for criterion in &task.acceptance_criteria {
            prompt.push_str("- ");
            prompt.push_str(criterion);
            prompt.push('\n');
        }
    }
    prompt
}
