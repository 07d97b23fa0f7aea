//! Session model and lifecycle helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::policy::PolicySpec;

/// Lifecycle state for an agent session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Session accepted but not yet provisioned.
    Created,
    /// Workspace isolation root is being prepared.
    PreparingWorkspace,
    /// Provider process is being launched.
    StartingProvider,
    /// Provider is actively working the task.
    Running,
    /// Paused on a pending approval gate.
    WaitingForApproval,
    /// Paused by an operator for manual intervention.
    PausedByHuman,
    /// Wind-down in progress.
    Stopping,
    /// Terminal: provider finished cleanly.
    Completed,
    /// Terminal: provider or policy failure.
    Failed,
}

impl SessionState {
    /// Whether this state has no outgoing transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::PreparingWorkspace)
                | (
                    Self::PreparingWorkspace,
                    Self::StartingProvider | Self::Failed
                )
                | (Self::StartingProvider, Self::Running | Self::Failed)
                | (Self::Running, Self::WaitingForApproval | Self::PausedByHuman)
                | (Self::WaitingForApproval, Self::Running | Self::PausedByHuman)
                | (Self::PausedByHuman, Self::Running | Self::WaitingForApproval)
                | (
                    Self::Created
                        | Self::PreparingWorkspace
                        | Self::StartingProvider
                        | Self::Running
                        | Self::WaitingForApproval
                        | Self::PausedByHuman,
                    Self::Stopping
                )
                | (Self::Stopping, Self::Completed | Self::Failed)
        )
    }
}

/// Repository reference for the session's checkout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RepoRef {
    /// Hosting provider (e.g., `github`).
    pub provider: String,
    /// Repository owner or organization.
    pub owner: String,
    /// Repository name.
    pub name: String,
    /// Default branch used when the checkout spec needs a base.
    pub default_branch: String,
}

/// What to check out — branch, commit, or tag, mutually exclusive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutSpec {
    /// A branch ref.
    Branch(String),
    /// An exact commit sha.
    Commit(String),
    /// An annotated or lightweight tag.
    Tag(String),
}

/// Task handed to the agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TaskSpec {
    /// Short task title.
    pub title: String,
    /// Goal statement passed to the agent as its prompt.
    pub goal: String,
    /// Hard constraints the agent must respect.
    #[serde(default)]
    pub constraints: Vec<String>,
    /// Acceptance criteria for task completion.
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

/// Billing and limits context attached to a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BillingContext {
    /// Plan tier name (informational, echoed in events).
    pub plan_tier: String,
    /// Maximum concurrent sessions for the owning org.
    pub max_org_sessions: u32,
    /// Maximum session duration in seconds; 0 means unlimited.
    #[serde(default)]
    pub max_duration_seconds: u64,
}

/// Full session configuration carried by a START command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionConfig {
    /// Coordinator-assigned session id; generated when absent.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Owning organization identifier.
    pub org_id: String,
    /// Provider kind to run (must match a configured provider).
    pub provider: String,
    /// Repository reference.
    pub repo: RepoRef,
    /// Checkout specification.
    pub checkout: CheckoutSpec,
    /// Task specification.
    pub task: TaskSpec,
    /// Policy governing gated actions.
    #[serde(default)]
    pub policy: PolicySpec,
    /// Billing and limits context.
    pub billing: BillingContext,
}

/// Accumulated usage counters, reported via USAGE_TICK and SESSION_ENDED.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct UsageMetrics {
    /// Wall-clock seconds the provider process has been alive.
    pub agent_seconds: u64,
    /// Terminal output volume in KiB.
    pub terminal_kb: u64,
    /// Distinct files the agent has touched.
    pub files_touched: u64,
    /// Shell commands the agent has run.
    pub commands_run: u64,
    /// Approval gates raised during the session.
    pub approvals_requested: u64,
}

/// Session domain entity — one unit of agent work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Session {
    /// Unique session identifier.
    pub id: String,
    /// Owning organization identifier.
    pub org_id: String,
    /// Provider kind driving this session.
    pub provider: String,
    /// Repository reference.
    pub repo: RepoRef,
    /// Checkout specification.
    pub checkout: CheckoutSpec,
    /// Task specification.
    pub task: TaskSpec,
    /// Billing and limits context.
    pub billing: BillingContext,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Next event sequence number to assign (starts at 1).
    pub next_seq: u64,
    /// Session start timestamp.
    pub started_at: DateTime<Utc>,
    /// Accumulated usage counters.
    pub usage: UsageMetrics,
}

impl Session {
    /// Construct a new session from a START configuration.
    ///
    /// Uses the coordinator-assigned id when present, otherwise a v4 UUID.
    #[must_use]
    pub fn from_config(config: &SessionConfig) -> Self {
        let id = config
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self {
            id,
            org_id: config.org_id.clone(),
            provider: config.provider.clone(),
            repo: config.repo.clone(),
            checkout: config.checkout.clone(),
            task: config.task.clone(),
            billing: config.billing.clone(),
            state: SessionState::Created,
            next_seq: 1,
            started_at: Utc::now(),
            usage: UsageMetrics::default(),
        }
    }

    /// Claim the next per-session sequence number.
    ///
    /// Strictly increasing by exactly one per call; never reset.
    pub fn claim_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}
