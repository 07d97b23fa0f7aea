//! Session policy model: shell rules, gated categories, network mode.

use regex::RegexSet;
use serde::{Deserialize, Serialize};

use crate::models::approval::ApprovalCategory;

/// Network access granted to the provider process.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// No outbound network access.
    Off,
    /// Package registries and the repo host only.
    #[default]
    Restricted,
    /// Unrestricted outbound access.
    Full,
}

/// Policy attached to a session at START time.
///
/// Shell patterns are regular expressions matched against the full command
/// line. Plain command names still work because they match themselves
/// literally; use anchors (`^…$`) to cover command families.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PolicySpec {
    /// Shell command patterns that run without an approval gate.
    #[serde(default)]
    pub shell_allow: Vec<String>,
    /// Shell command patterns that fail the session outright.
    #[serde(default)]
    pub shell_deny: Vec<String>,
    /// Action categories that always require operator approval.
    #[serde(default)]
    pub require_approval: Vec<ApprovalCategory>,
    /// Network access mode for the provider process.
    #[serde(default)]
    pub network: NetworkMode,
    /// Deadline for approval decisions in seconds; elapsed requests are
    /// implicitly denied. `None` waits indefinitely.
    #[serde(default)]
    pub approval_timeout_seconds: Option<u64>,
}

/// Pre-compiled form of [`PolicySpec`] with shell patterns compiled into
/// [`RegexSet`]s for efficient per-action matching.
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    /// Original policy data.
    pub raw: PolicySpec,
    /// Compiled allow patterns.
    pub allow_set: RegexSet,
    /// Compiled deny patterns.
    pub deny_set: RegexSet,
}

impl CompiledPolicy {
    /// Construct from a [`PolicySpec`], compiling shell patterns.
    ///
    /// Invalid patterns are skipped with a tracing warning.
    #[must_use]
    pub fn from_spec(raw: PolicySpec) -> Self {
        let allow_set = compile_patterns(&raw.shell_allow);
        let deny_set = compile_patterns(&raw.shell_deny);
        Self {
            raw,
            allow_set,
            deny_set,
        }
    }

    /// Whether the given category is explicitly gated by this policy.
    #[must_use]
    pub fn gates_category(&self, category: ApprovalCategory) -> bool {
        self.raw.require_approval.contains(&category)
    }
}

fn compile_patterns(patterns: &[String]) -> RegexSet {
    let valid: Vec<&String> = patterns
        .iter()
        .filter(|p| {
            let ok = regex::Regex::new(p).is_ok();
            if !ok {
                tracing::warn!(pattern = %p, "invalid regex in policy, skipping");
            }
            ok
        })
        .collect();

    RegexSet::new(valid).unwrap_or_else(|_| RegexSet::empty())
}
