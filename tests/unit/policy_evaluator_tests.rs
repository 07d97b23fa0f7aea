//! Unit tests for policy evaluation ordering and outcomes.

use agent_runner::models::approval::{ApprovalCategory, RiskTier};
use agent_runner::models::policy::{CompiledPolicy, NetworkMode, PolicySpec};
use agent_runner::policy::{evaluate, PolicyDecision};

fn compiled(spec: PolicySpec) -> CompiledPolicy {
    CompiledPolicy::from_spec(spec)
}

#[test]
fn denylist_hit_fails_closed() {
    let policy = compiled(PolicySpec {
        shell_allow: vec!["^cargo .*".into()],
        shell_deny: vec!["rm -rf".into()],
        ..PolicySpec::default()
    });

    let decision = evaluate(
        &policy,
        ApprovalCategory::Shell,
        RiskTier::Low,
        Some("rm -rf /"),
    );
    assert!(matches!(decision, PolicyDecision::Deny { .. }));
}

#[test]
fn denylist_wins_over_allowlist() {
    let policy = compiled(PolicySpec {
        shell_allow: vec![".*".into()],
        shell_deny: vec!["curl".into()],
        ..PolicySpec::default()
    });

    let decision = evaluate(
        &policy,
        ApprovalCategory::Shell,
        RiskTier::Low,
        Some("curl https://example.com"),
    );
    assert!(matches!(decision, PolicyDecision::Deny { .. }));
}

#[test]
fn allowlisted_command_passes_without_gate() {
    let policy = compiled(PolicySpec {
        shell_allow: vec!["^cargo (build|test)(\\s.*)?$".into()],
        ..PolicySpec::default()
    });

    let decision = evaluate(
        &policy,
        ApprovalCategory::Shell,
        RiskTier::Low,
        Some("cargo test --workspace"),
    );
    assert_eq!(decision, PolicyDecision::Allow);
}

#[test]
fn gated_category_overrides_allowlist() {
    let policy = compiled(PolicySpec {
        shell_allow: vec![".*".into()],
        require_approval: vec![ApprovalCategory::Shell],
        ..PolicySpec::default()
    });

    let decision = evaluate(
        &policy,
        ApprovalCategory::Shell,
        RiskTier::Low,
        Some("cargo build"),
    );
    assert_eq!(decision, PolicyDecision::RequireApproval);
}

#[test]
fn unlisted_low_risk_shell_command_passes() {
    let policy = compiled(PolicySpec::default());
    let decision = evaluate(
        &policy,
        ApprovalCategory::Shell,
        RiskTier::Low,
        Some("ls -la"),
    );
    assert_eq!(decision, PolicyDecision::Allow);
}

#[test]
fn high_risk_actions_always_require_approval() {
    let policy = compiled(PolicySpec::default());
    let decision = evaluate(
        &policy,
        ApprovalCategory::Merge,
        RiskTier::High,
        None,
    );
    assert_eq!(decision, PolicyDecision::RequireApproval);
}

#[test]
fn network_off_denies_network_actions() {
    let policy = compiled(PolicySpec {
        network: NetworkMode::Off,
        ..PolicySpec::default()
    });
    let decision = evaluate(&policy, ApprovalCategory::Network, RiskTier::Low, None);
    assert!(matches!(decision, PolicyDecision::Deny { .. }));
}

#[test]
fn restricted_network_requires_approval() {
    let policy = compiled(PolicySpec {
        network: NetworkMode::Restricted,
        ..PolicySpec::default()
    });
    let decision = evaluate(&policy, ApprovalCategory::Network, RiskTier::Low, None);
    assert_eq!(decision, PolicyDecision::RequireApproval);
}

#[test]
fn full_network_allows_network_actions() {
    let policy = compiled(PolicySpec {
        network: NetworkMode::Full,
        ..PolicySpec::default()
    });
    let decision = evaluate(&policy, ApprovalCategory::Network, RiskTier::Low, None);
    assert_eq!(decision, PolicyDecision::Allow);
}

#[test]
fn gated_deploy_category_requires_approval_regardless_of_risk() {
    let policy = compiled(PolicySpec {
        require_approval: vec![ApprovalCategory::Deploy],
        ..PolicySpec::default()
    });
    let decision = evaluate(&policy, ApprovalCategory::Deploy, RiskTier::Low, None);
    assert_eq!(decision, PolicyDecision::RequireApproval);
}

#[test]
fn invalid_regex_patterns_are_skipped_not_fatal() {
    let policy = compiled(PolicySpec {
        shell_deny: vec!["([unclosed".into(), "rm -rf".into()],
        ..PolicySpec::default()
    });

    // The broken pattern is dropped; the valid one still matches.
    let decision = evaluate(
        &policy,
        ApprovalCategory::Shell,
        RiskTier::Low,
        Some("rm -rf /tmp/x"),
    );
    assert!(matches!(decision, PolicyDecision::Deny { .. }));
}
