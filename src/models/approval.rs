//! Approval request model for policy-gated actions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Category of the gated action awaiting a decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalCategory {
    /// Merging a branch or landing a PR.
    Merge,
    /// Adding a new dependency.
    DependencyAdd,
    /// Reading or writing secrets.
    Secrets,
    /// Triggering a deployment.
    Deploy,
    /// Running a shell command outside the allowlist.
    Shell,
    /// Network access beyond the session's network mode.
    Network,
}

/// Risk classification for a gated action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    /// Routine action, low blast radius.
    Low,
    /// Needs a careful look.
    Medium,
    /// Potentially destructive or externally visible.
    High,
}

/// Lifecycle status for an approval request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Awaiting a decision.
    Pending,
    /// Decision: allow.
    Allowed,
    /// Decision: deny.
    Denied,
    /// Request timeout elapsed — treated as an implicit deny.
    TimedOut,
}

/// A pending risky-action gate raised by a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ApprovalRequest {
    /// Unique approval identifier.
    pub id: String,
    /// Owning session identifier.
    pub session_id: String,
    /// Gated action category.
    pub category: ApprovalCategory,
    /// Human-readable summary of the proposed action.
    pub summary: String,
    /// Risk classification.
    pub risk: RiskTier,
    /// Optional decision deadline in seconds; `None` waits indefinitely.
    pub timeout_seconds: Option<u64>,
    /// Current lifecycle status.
    pub status: ApprovalStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl ApprovalRequest {
    /// Construct a new pending approval request.
    #[must_use]
    pub fn new(
        session_id: String,
        category: ApprovalCategory,
        summary: String,
        risk: RiskTier,
        timeout_seconds: Option<u64>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id,
            category,
            summary,
            risk,
            timeout_seconds,
            status: ApprovalStatus::Pending,
            created_at: Utc::now(),
        }
    }

    /// Whether a decision has already been recorded.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.status != ApprovalStatus::Pending
    }
}
