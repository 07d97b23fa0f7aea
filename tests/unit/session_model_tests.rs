//! Unit tests for the session state machine and entity.

use agent_runner::models::policy::PolicySpec;
use agent_runner::models::session::{
    BillingContext, CheckoutSpec, RepoRef, Session, SessionConfig, SessionState, TaskSpec,
};

use SessionState::{
    Completed, Created, Failed, PausedByHuman, PreparingWorkspace, Running, StartingProvider,
    Stopping, WaitingForApproval,
};

const ALL_STATES: [SessionState; 9] = [
    Created,
    PreparingWorkspace,
    StartingProvider,
    Running,
    WaitingForApproval,
    PausedByHuman,
    Stopping,
    Completed,
    Failed,
];

fn sample_config(session_id: Option<&str>) -> SessionConfig {
    SessionConfig {
        session_id: session_id.map(str::to_owned),
        org_id: "org-1".into(),
        provider: "claude".into(),
        repo: RepoRef {
            provider: "github".into(),
            owner: "acme".into(),
            name: "widgets".into(),
            default_branch: "main".into(),
        },
        checkout: CheckoutSpec::Branch("main".into()),
        task: TaskSpec {
            title: "Fix flaky test".into(),
            goal: "Make the suite deterministic".into(),
            constraints: vec![],
            acceptance_criteria: vec![],
        },
        policy: PolicySpec::default(),
        billing: BillingContext {
            plan_tier: "team".into(),
            max_org_sessions: 2,
            max_duration_seconds: 0,
        },
    }
}

#[test]
fn happy_path_edges_are_legal() {
    assert!(Created.can_transition_to(PreparingWorkspace));
    assert!(PreparingWorkspace.can_transition_to(StartingProvider));
    assert!(StartingProvider.can_transition_to(Running));
    assert!(Running.can_transition_to(Stopping));
    assert!(Stopping.can_transition_to(Completed));
    assert!(Stopping.can_transition_to(Failed));
}

#[test]
fn approval_and_pause_edges_may_cycle() {
    assert!(Running.can_transition_to(WaitingForApproval));
    assert!(WaitingForApproval.can_transition_to(Running));
    assert!(Running.can_transition_to(PausedByHuman));
    assert!(PausedByHuman.can_transition_to(Running));
    assert!(WaitingForApproval.can_transition_to(PausedByHuman));
    assert!(PausedByHuman.can_transition_to(WaitingForApproval));
}

#[test]
fn start_failures_reach_failed_directly() {
    assert!(PreparingWorkspace.can_transition_to(Failed));
    assert!(StartingProvider.can_transition_to(Failed));
}

#[test]
fn every_non_terminal_state_may_begin_stopping() {
    for state in ALL_STATES {
        if state.is_terminal() || state == Stopping {
            continue;
        }
        assert!(
            state.can_transition_to(Stopping),
            "{state:?} should allow Stopping"
        );
    }
}

#[test]
fn no_transition_escapes_a_terminal_state() {
    for terminal in [Completed, Failed] {
        for next in ALL_STATES {
            assert!(
                !terminal.can_transition_to(next),
                "{terminal:?} must not transition to {next:?}"
            );
        }
    }
}

#[test]
fn skipping_lifecycle_phases_is_illegal() {
    assert!(!Created.can_transition_to(Running));
    assert!(!Created.can_transition_to(StartingProvider));
    assert!(!PreparingWorkspace.can_transition_to(Running));
    assert!(!Running.can_transition_to(Completed));
    assert!(!Running.can_transition_to(Created));
    assert!(!WaitingForApproval.can_transition_to(Completed));
}

#[test]
fn terminal_predicate_matches_the_two_terminal_states() {
    for state in ALL_STATES {
        assert_eq!(state.is_terminal(), matches!(state, Completed | Failed));
    }
}

#[test]
fn session_from_config_uses_assigned_id() {
    let session = Session::from_config(&sample_config(Some("sess-42")));
    assert_eq!(session.id, "sess-42");
    assert_eq!(session.state, Created);
    assert_eq!(session.next_seq, 1);
}

#[test]
fn session_from_config_generates_id_when_absent() {
    let a = Session::from_config(&sample_config(None));
    let b = Session::from_config(&sample_config(None));
    assert!(!a.id.is_empty());
    assert_ne!(a.id, b.id);
}

#[test]
fn claim_seq_is_gapless_from_one() {
    let mut session = Session::from_config(&sample_config(None));
    assert_eq!(session.claim_seq(), 1);
    assert_eq!(session.claim_seq(), 2);
    assert_eq!(session.claim_seq(), 3);
    assert_eq!(session.next_seq, 4);
}

#[test]
fn checkout_spec_variants_are_mutually_exclusive_on_the_wire() {
    let branch = serde_json::to_value(CheckoutSpec::Branch("main".into())).expect("serialize");
    assert_eq!(branch, serde_json::json!({ "branch": "main" }));

    let commit = serde_json::to_value(CheckoutSpec::Commit("abc123".into())).expect("serialize");
    assert_eq!(commit, serde_json::json!({ "commit": "abc123" }));

    let tag: CheckoutSpec = serde_json::from_value(serde_json::json!({ "tag": "v1.0" }))
        .expect("deserialize tag");
    assert_eq!(tag, CheckoutSpec::Tag("v1.0".into()));
}

#[test]
fn session_state_serializes_to_snake_case() {
    let json = serde_json::to_string(&WaitingForApproval).expect("serialize");
    assert_eq!(json, "\"waiting_for_approval\"");
}
