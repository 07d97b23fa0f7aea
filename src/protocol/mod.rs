//! Wire protocol types for the coordinator connection.
//!
//! Commands flow coordinator → runner, Runner Events and heartbeats flow
//! runner → coordinator, JSON-encoded one message per WebSocket text frame.
//! Field casing on the envelope level (`sessionId`, `orgId`, `ts`, `seq`)
//! is dictated by the coordinator protocol.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::models::approval::ApprovalRequest;
use crate::models::session::{SessionConfig, SessionState, UsageMetrics};

/// Current wall-clock time in epoch milliseconds.
#[must_use]
pub fn epoch_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ── Commands (coordinator → runner) ───────────────────────────────────────────

/// Input delivery mode for INPUT commands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    /// Bytes forwarded to the provider as-is.
    Raw,
    /// A newline is appended if missing.
    Line,
}

/// Payload of an INPUT command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InputChunk {
    /// Input text for the provider process.
    pub data: String,
    /// Delivery mode.
    pub mode: InputMode,
}

/// Operator decision on an approval gate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Let the gated action proceed.
    Allow,
    /// Refuse the gated action.
    Deny,
}

/// Inbound command union, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum Command {
    /// Start a new session.
    Start {
        /// Full session configuration.
        config: SessionConfig,
    },
    /// Forward input to a running session's provider.
    Input {
        /// Target session.
        session_id: String,
        /// Input payload.
        input: InputChunk,
    },
    /// Stop a session.
    Stop {
        /// Target session.
        session_id: String,
        /// Graceful wind-down versus immediate termination.
        #[serde(default = "default_graceful")]
        graceful: bool,
    },
    /// Pause a session for manual intervention.
    Pause {
        /// Target session.
        session_id: String,
    },
    /// Resume a paused session.
    Resume {
        /// Target session.
        session_id: String,
    },
    /// Resolve a pending approval.
    Approve {
        /// Target session.
        session_id: String,
        /// Approval to resolve.
        approval_id: String,
        /// Operator decision.
        decision: Decision,
        /// Optional note recorded with the decision.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
}

fn default_graceful() -> bool {
    true
}

impl Command {
    /// Session identifier carried by the command, when one is required.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Start { .. } => None,
            Self::Input { session_id, .. }
            | Self::Stop { session_id, .. }
            | Self::Pause { session_id }
            | Self::Resume { session_id }
            | Self::Approve { session_id, .. } => Some(session_id),
        }
    }
}

// ── Runner Events (runner → coordinator) ──────────────────────────────────────

/// Which provider stream a terminal chunk came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStream {
    /// Provider stdout.
    Stdout,
    /// Provider stderr.
    Stderr,
}

/// Kind of change behind a FILE_TOUCHED event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileChange {
    /// File created.
    Created,
    /// File modified in place.
    Modified,
    /// File deleted.
    Deleted,
}

/// Severity for ALERT_RAISED events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    /// Informational.
    Info,
    /// Needs operator attention soon.
    Warning,
    /// Needs operator attention now.
    Critical,
}

/// Closed union of event payloads, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum EventPayload {
    /// Provider process launched; the session is now running.
    SessionStarted {
        /// Provider kind driving the session.
        provider: String,
        /// OS process id of the provider, when known.
        pid: Option<u32>,
    },
    /// Lifecycle transition.
    SessionStateChanged {
        /// State before the transition.
        from: SessionState,
        /// State after the transition.
        to: SessionState,
    },
    /// Raw terminal output from the provider.
    TerminalChunk {
        /// Output text.
        data: String,
        /// Originating stream.
        stream: TerminalStream,
    },
    /// The agent touched a file in the workspace.
    FileTouched {
        /// Workspace-relative path.
        path: String,
        /// Kind of change.
        change: FileChange,
    },
    /// Digest of a diff the agent produced.
    DiffSummary {
        /// Number of files in the diff.
        files_changed: u64,
        /// Added line count.
        insertions: u64,
        /// Removed line count.
        deletions: u64,
    },
    /// A test run began.
    TestRunStarted {
        /// Suite name, when the provider reports one.
        suite: Option<String>,
    },
    /// A test run finished.
    TestRunFinished {
        /// Passing test count.
        passed: u64,
        /// Failing test count.
        failed: u64,
        /// Wall-clock duration, when reported.
        duration_ms: Option<u64>,
    },
    /// A policy gate was raised and awaits a decision.
    ApprovalRequested {
        /// The pending approval.
        approval: ApprovalRequest,
    },
    /// A pending approval was decided.
    ApprovalResolved {
        /// Approval identifier.
        approval_id: String,
        /// Whether the action may proceed.
        allowed: bool,
        /// Optional operator note.
        note: Option<String>,
    },
    /// Operator-facing alert attached to the session.
    AlertRaised {
        /// Alert severity.
        severity: AlertSeverity,
        /// Human-readable message.
        message: String,
    },
    /// Periodic usage report.
    UsageTick {
        /// Accumulated usage counters.
        usage: UsageMetrics,
    },
    /// Terminal outcome; exactly one per session.
    SessionEnded {
        /// Final lifecycle state (Completed or Failed).
        final_state: SessionState,
        /// Failure reason, when failed.
        reason: Option<String>,
        /// Total session duration.
        duration_seconds: u64,
        /// Final usage counters.
        usage: UsageMetrics,
    },
    /// Provider event with no first-class mapping, forwarded verbatim.
    ProviderEventForwarded {
        /// Raw provider payload.
        raw: serde_json::Value,
    },
}

/// One Runner Event on the wire: envelope plus payload.
///
/// Immutable once constructed; `seq` is strictly increasing and gapless
/// per session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunnerEvent {
    /// Owning session.
    pub session_id: String,
    /// Owning organization.
    pub org_id: String,
    /// Emission timestamp, epoch milliseconds.
    pub ts: i64,
    /// Per-session monotonic sequence number.
    pub seq: u64,
    /// Typed payload.
    #[serde(flatten)]
    pub payload: EventPayload,
}

// ── Heartbeat (runner → coordinator) ──────────────────────────────────────────

/// Host load snapshot, each value a percentage 0–100.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LoadSnapshot {
    /// CPU utilization.
    pub cpu: u8,
    /// Memory utilization.
    pub memory: u8,
    /// Disk utilization of the workspaces volume.
    pub disk: u8,
}

/// Periodic liveness and load report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    /// Fixed frame discriminator (`HEARTBEAT`).
    #[serde(rename = "type")]
    pub frame_type: String,
    /// Reporting runner.
    pub runner_id: String,
    /// Emission timestamp, epoch milliseconds.
    pub ts: i64,
    /// Identifiers of currently live sessions.
    pub active_sessions: Vec<String>,
    /// Host load percentages.
    pub load: LoadSnapshot,
    /// Provider kind → detected version string.
    pub providers: HashMap<String, String>,
}

impl Heartbeat {
    /// Construct a heartbeat stamped with the current time.
    #[must_use]
    pub fn new(
        runner_id: String,
        active_sessions: Vec<String>,
        load: LoadSnapshot,
        providers: HashMap<String, String>,
    ) -> Self {
        Self {
            frame_type: "HEARTBEAT".into(),
            runner_id,
            ts: epoch_ms(),
            active_sessions,
            load,
            providers,
        }
    }
}
