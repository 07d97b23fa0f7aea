//! Provider adapter abstraction.
//!
//! The [`ProviderAdapter`] trait decouples the session state machine from
//! the agent backend being driven (Claude Code, Codex). Each adapter
//! instance owns exactly one external CLI process and translates its
//! output into typed [`ProviderEvent`]s.

pub mod claude;
pub mod codec;
pub mod codex;
pub mod proc;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::ProviderCommandConfig;
use crate::models::approval::{ApprovalCategory, RiskTier};
use crate::protocol::{FileChange, InputMode, TerminalStream};
use crate::{AppError, Result};

/// Buffer size for adapter event channels.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Construct the adapter for a configured provider kind.
///
/// # Errors
///
/// Returns [`AppError::Validation`] for a kind with no registered adapter.
pub fn build_adapter(
    kind: &str,
    config: &ProviderCommandConfig,
) -> Result<Arc<dyn ProviderAdapter>> {
    match kind {
        "claude" => Ok(Arc::new(claude::ClaudeAdapter::new(config.clone()))),
        "codex" => Ok(Arc::new(codex::CodexAdapter::new(config.clone()))),
        other => Err(AppError::Validation(format!(
            "unknown provider kind '{other}'"
        ))),
    }
}

/// Result of probing for a backend CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    /// Whether the CLI is present and runnable.
    pub installed: bool,
    /// Reported version string, when installed.
    pub version: Option<String>,
}

/// Depth of pull-request workflow support a backend offers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PrWorkflowDepth {
    /// No PR integration.
    None,
    /// Can push a branch and open a draft.
    Draft,
    /// Full PR lifecycle including review responses.
    Full,
}

/// Static capability declaration for one backend kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CapabilitySet {
    /// Streams terminal output incrementally.
    pub streaming_terminal: bool,
    /// Emits structured diffs rather than raw text.
    pub structured_diffs: bool,
    /// Can run without a TTY.
    pub non_interactive: bool,
    /// Supports a plan-then-execute mode.
    pub plan_and_execute: bool,
    /// PR workflow depth.
    pub pr_workflow: PrWorkflowDepth,
}

/// Credential required by a backend, resolved before spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialKey {
    /// Key within the runner's keychain service.
    pub keyring_key: &'static str,
    /// Environment variable fallback, also the variable injected into the
    /// child process.
    pub env_key: &'static str,
}

/// Everything an adapter needs to launch its process for one session.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Owning session identifier (injected as `RUNNER_SESSION_ID`).
    pub session_id: String,
    /// Isolated workspace root; the child starts in this directory.
    pub workspace_root: PathBuf,
    /// Task prompt handed to the backend.
    pub prompt: String,
    /// Resolved credentials injected as environment variables.
    pub credentials: Vec<(String, String)>,
}

/// Handle returned by a successful [`ProviderAdapter::start_session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartedProvider {
    /// OS process id, when the runtime reports one.
    pub pid: Option<u32>,
}

/// Exit status reported when a provider process ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderExit {
    /// Process exit code; `None` when killed by signal or unknown.
    pub code: Option<i32>,
}

/// Events emitted by adapters into their subscription channel.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// Raw terminal output.
    Terminal {
        /// Output text.
        data: String,
        /// Originating stream.
        stream: TerminalStream,
    },
    /// The agent touched a workspace file.
    FileTouched {
        /// Workspace-relative path.
        path: String,
        /// Kind of change.
        change: FileChange,
    },
    /// The agent produced a unified diff.
    Diff {
        /// Unified diff text.
        unified: String,
    },
    /// A test run began.
    TestRunStarted {
        /// Suite name, when reported.
        suite: Option<String>,
    },
    /// A test run finished.
    TestRunFinished {
        /// Passing count.
        passed: u64,
        /// Failing count.
        failed: u64,
        /// Duration, when reported.
        duration_ms: Option<u64>,
    },
    /// The agent proposes a policy-relevant action and awaits a verdict.
    ActionRequested {
        /// Provider-side request identifier for response routing.
        request_id: String,
        /// Action category.
        category: ApprovalCategory,
        /// Human-readable summary.
        summary: String,
        /// Risk classification.
        risk: RiskTier,
        /// Full command line for shell actions.
        command: Option<String>,
    },
    /// Free-form status message from the backend.
    Status {
        /// Message text.
        message: String,
    },
    /// Backend message with no first-class mapping.
    Unknown {
        /// Raw payload.
        raw: serde_json::Value,
    },
    /// The provider process exited.
    Exited {
        /// Exit code, when known.
        code: Option<i32>,
    },
}

/// Uniform interface over one agent backend process.
///
/// Implementations own their child process and are safe to share behind
/// `Arc`; all methods take `&self` and synchronize internally. `stop` is
/// idempotent. `send_input` and `resolve_action` are undefined before
/// `start_session` succeeds and after `stop` completes — implementations
/// return [`AppError::Provider`](crate::AppError::Provider) rather than
/// panic.
pub trait ProviderAdapter: Send + Sync {
    /// Backend kind identifier (matches the config provider table key).
    fn kind(&self) -> &'static str;

    /// Static capability declaration for this backend.
    fn capabilities(&self) -> CapabilitySet;

    /// Credential that must resolve before the process may spawn.
    fn required_credential(&self) -> Option<CredentialKey>;

    /// Probe whether the backend CLI is installed.
    ///
    /// Never fails — absence is reported as `installed: false`.
    fn detect(&self) -> Pin<Box<dyn Future<Output = Detection> + Send + '_>>;

    /// Spawn the backend process bound to the launch workspace.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Provider`](crate::AppError::Provider) on spawn
    /// failure or startup timeout. Credential pre-flight belongs to the
    /// caller; this method assumes `launch.credentials` is complete.
    fn start_session(
        &self,
        launch: LaunchSpec,
    ) -> Pin<Box<dyn Future<Output = Result<StartedProvider>> + Send + '_>>;

    /// Forward input to the running process.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Provider`](crate::AppError::Provider) if no
    /// process is running or the write fails.
    fn send_input(
        &self,
        data: &str,
        mode: InputMode,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Deliver the verdict for a previously raised action request.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Provider`](crate::AppError::Provider) if the
    /// backend has no response channel for `request_id`.
    fn resolve_action(
        &self,
        request_id: &str,
        allowed: bool,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Stop the process.
    ///
    /// Graceful requests a wind-down (SIGINT + bounded wait) before
    /// force-killing; non-graceful kills immediately. Idempotent —
    /// stopping an already-stopped adapter returns the last known exit.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Provider`](crate::AppError::Provider) only on
    /// OS-level kill/wait failures.
    fn stop(&self, graceful: bool)
        -> Pin<Box<dyn Future<Output = Result<ProviderExit>> + Send + '_>>;

    /// Subscribe to the adapter's event stream.
    ///
    /// A single consumer is supported; subscribing again replaces the
    /// previous receiver. Dropping the receiver unsubscribes. Events
    /// emitted while no subscriber is attached are discarded.
    fn subscribe(&self) -> mpsc::Receiver<ProviderEvent>;
}
