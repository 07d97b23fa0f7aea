//! Decides whether a proposed provider action may proceed without a gate.
//!
//! Evaluation order:
//! 1. Shell denylist — a match fails the session outright.
//! 2. Shell allowlist — a match proceeds without a gate, unless the
//!    category is explicitly gated by the policy.
//! 3. Gated categories from `require_approval`.
//! 4. Network actions according to the session's [`NetworkMode`].
//! 5. High-risk actions require approval; everything else proceeds.

use tracing::{debug, info};

use crate::models::approval::{ApprovalCategory, RiskTier};
use crate::models::policy::{CompiledPolicy, NetworkMode};

/// Outcome of evaluating one proposed action against the session policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Forward the action to the provider without a gate.
    Allow,
    /// Fail the session with a policy-violation reason.
    Deny {
        /// Human-readable denial reason.
        reason: String,
    },
    /// Raise an approval gate and wait for an operator decision.
    RequireApproval,
}

/// Evaluate a proposed action.
///
/// `command` carries the full shell command line for
/// [`ApprovalCategory::Shell`] actions and is ignored otherwise.
#[must_use]
pub fn evaluate(
    policy: &CompiledPolicy,
    category: ApprovalCategory,
    risk: RiskTier,
    command: Option<&str>,
) -> PolicyDecision {
    if category == ApprovalCategory::Shell {
        if let Some(cmd) = command {
            if policy.deny_set.is_match(cmd) {
                info!(command = cmd, "shell command hit denylist");
                return PolicyDecision::Deny {
                    reason: format!("shell command denied by policy: {cmd}"),
                };
            }
            if policy.allow_set.is_match(cmd) && !policy.gates_category(category) {
                debug!(command = cmd, "shell command allowlisted");
                return PolicyDecision::Allow;
            }
        }
    }

    if policy.gates_category(category) {
        return PolicyDecision::RequireApproval;
    }

    if category == ApprovalCategory::Network {
        return match policy.raw.network {
            NetworkMode::Off => PolicyDecision::Deny {
                reason: "network access disabled for this session".into(),
            },
            NetworkMode::Restricted => PolicyDecision::RequireApproval,
            NetworkMode::Full => PolicyDecision::Allow,
        };
    }

    if risk == RiskTier::High {
        return PolicyDecision::RequireApproval;
    }

    PolicyDecision::Allow
}
