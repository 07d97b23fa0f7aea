//! End-to-end session lifecycle against a mock provider.

use agent_runner::models::policy::PolicySpec;
use agent_runner::models::session::SessionState;
use agent_runner::protocol::{FileChange, InputChunk, InputMode, TerminalStream};
use agent_runner::provider::{CredentialKey, ProviderEvent};
use agent_runner::AppError;

use super::test_helpers::{
    assert_gapless, env_with_adapters, env_with_adapters_opts, event_types, session_config,
    session_events, wait_for, wait_for_live_count, MockAdapter, MockBehavior,
};

#[tokio::test]
async fn start_reaches_running_with_ordered_events() {
    let adapter = MockAdapter::new(MockBehavior::clean_exit());
    let env = env_with_adapters(4, vec![adapter]).await;

    let session = env
        .manager
        .start_session(&session_config("org-1", PolicySpec::default()))
        .await
        .expect("start should succeed");

    assert_eq!(session.state, SessionState::Running);
    assert_eq!(env.manager.live_count().await, 1);

    let events = session_events(&env.transport, &session.id);
    assert_gapless(&events);
    let types = event_types(&env.transport, &session.id);
    assert_eq!(
        types,
        vec![
            "SESSION_STATE_CHANGED", // created -> preparing_workspace
            "SESSION_STATE_CHANGED", // preparing_workspace -> starting_provider
            "SESSION_STARTED",
            "SESSION_STATE_CHANGED", // starting_provider -> running
        ]
    );
}

#[tokio::test]
async fn provider_output_translates_to_typed_events() {
    let adapter = MockAdapter::new(MockBehavior::clean_exit());
    let driver = adapter.clone();
    let env = env_with_adapters(4, vec![adapter]).await;

    let session = env
        .manager
        .start_session(&session_config("org-1", PolicySpec::default()))
        .await
        .expect("start");

    driver
        .push(ProviderEvent::Terminal {
            data: "compiling widgets v0.1.0".into(),
            stream: TerminalStream::Stdout,
        })
        .await;
    driver
        .push(ProviderEvent::FileTouched {
            path: "src/lib.rs".into(),
            change: FileChange::Modified,
        })
        .await;
    driver
        .push(ProviderEvent::Diff {
            unified: "--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1,1 +1,2 @@\n context\n+added\n"
                .into(),
        })
        .await;
    driver
        .push(ProviderEvent::TestRunStarted {
            suite: Some("unit".into()),
        })
        .await;
    driver
        .push(ProviderEvent::TestRunFinished {
            passed: 12,
            failed: 0,
            duration_ms: Some(950),
        })
        .await;
    driver
        .push(ProviderEvent::Unknown {
            raw: serde_json::json!({ "event": "trace", "detail": "x" }),
        })
        .await;

    let transport = env.transport.clone();
    let id = session.id.clone();
    wait_for(2000, || session_events(&transport, &id).len() >= 10).await;

    let types = event_types(&env.transport, &session.id);
    let tail = &types[4..];
    assert_eq!(
        tail,
        [
            "TERMINAL_CHUNK",
            "FILE_TOUCHED",
            "DIFF_SUMMARY",
            "TEST_RUN_STARTED",
            "TEST_RUN_FINISHED",
            "PROVIDER_EVENT_FORWARDED",
        ]
    );

    let events = session_events(&env.transport, &session.id);
    assert_gapless(&events);
    let diff = &events[6];
    assert_eq!(diff["filesChanged"], 1);
    assert_eq!(diff["insertions"], 1);
    assert_eq!(diff["deletions"], 0);
}

#[tokio::test]
async fn spontaneous_clean_exit_completes_session_with_one_ended_event() {
    let adapter = MockAdapter::new(MockBehavior::clean_exit());
    let driver = adapter.clone();
    let env = env_with_adapters(4, vec![adapter]).await;

    let session = env
        .manager
        .start_session(&session_config("org-1", PolicySpec::default()))
        .await
        .expect("start");

    driver.push(ProviderEvent::Exited { code: Some(0) }).await;

    let transport = env.transport.clone();
    let id = session.id.clone();
    wait_for(2000, || {
        event_types(&transport, &id)
            .iter()
            .any(|t| t == "SESSION_ENDED")
    })
    .await;
    wait_for_live_count(&env.manager, 0, 2000).await;

    let events = session_events(&env.transport, &session.id);
    assert_gapless(&events);
    let ended: Vec<_> = events
        .iter()
        .filter(|e| e["type"] == "SESSION_ENDED")
        .collect();
    assert_eq!(ended.len(), 1, "exactly one SESSION_ENDED");
    assert_eq!(ended[0]["finalState"], "completed");

    // Idempotent stop on a finished session; other commands distinguish
    // finished from unknown.
    env.manager
        .stop_session(&session.id, true)
        .await
        .expect("stop after end should be a no-op");
    let err = env
        .manager
        .send_input(
            &session.id,
            InputChunk {
                data: "hello".into(),
                mode: InputMode::Line,
            },
        )
        .await
        .expect_err("input after end");
    assert!(matches!(err, AppError::SessionFinished(_)));
}

#[tokio::test]
async fn commanded_stop_reports_exit_and_evicts() {
    let adapter = MockAdapter::new(MockBehavior::clean_exit());
    let driver = adapter.clone();
    let env = env_with_adapters(4, vec![adapter]).await;

    let session = env
        .manager
        .start_session(&session_config("org-1", PolicySpec::default()))
        .await
        .expect("start");

    env.manager
        .stop_session(&session.id, true)
        .await
        .expect("stop");

    assert_eq!(driver.stops.lock().unwrap().as_slice(), &[true]);

    wait_for_live_count(&env.manager, 0, 2000).await;

    let types = event_types(&env.transport, &session.id);
    assert!(types.contains(&"SESSION_ENDED".to_owned()));

    // Stop twice: still fine.
    env.manager
        .stop_session(&session.id, true)
        .await
        .expect("second stop");
}

#[tokio::test]
async fn nonzero_exit_fails_the_session_with_reason() {
    let adapter = MockAdapter::new(MockBehavior {
        exit_code: Some(3),
        ..MockBehavior::default()
    });
    let driver = adapter.clone();
    let env = env_with_adapters(4, vec![adapter]).await;

    let session = env
        .manager
        .start_session(&session_config("org-1", PolicySpec::default()))
        .await
        .expect("start");

    driver.push(ProviderEvent::Exited { code: Some(3) }).await;

    let transport = env.transport.clone();
    let id = session.id.clone();
    wait_for(2000, || {
        event_types(&transport, &id)
            .iter()
            .any(|t| t == "SESSION_ENDED")
    })
    .await;

    let events = session_events(&env.transport, &session.id);
    let ended = events
        .iter()
        .find(|e| e["type"] == "SESSION_ENDED")
        .expect("ended event");
    assert_eq!(ended["finalState"], "failed");
    assert!(ended["reason"]
        .as_str()
        .expect("reason")
        .contains("exited with code 3"));
}

#[tokio::test]
async fn missing_credential_fails_before_spawn_with_single_ended_event() {
    let adapter = MockAdapter::new(MockBehavior {
        credential: Some(CredentialKey {
            keyring_key: "test_absent_credential",
            env_key: "AGENT_RUNNER_TEST_ABSENT_CREDENTIAL",
        }),
        ..MockBehavior::default()
    });
    let env = env_with_adapters(4, vec![adapter]).await;

    let mut config = session_config("org-1", PolicySpec::default());
    config.session_id = Some("cred-fail".into());

    let err = env
        .manager
        .start_session(&config)
        .await
        .expect_err("start should fail pre-flight");
    assert!(matches!(err, AppError::MissingCredential(_)), "got {err:?}");

    let types = event_types(&env.transport, "cred-fail");
    assert!(
        !types.contains(&"SESSION_STARTED".to_owned()),
        "session must never start: {types:?}"
    );
    let ended_count = types.iter().filter(|t| *t == "SESSION_ENDED").count();
    assert_eq!(ended_count, 1);

    // The failed session is known-but-finished, not unknown.
    let err = env
        .manager
        .pause_session("cred-fail")
        .await
        .expect_err("pause after failure");
    assert!(matches!(err, AppError::SessionFinished(_)));
}

#[tokio::test]
async fn provider_start_failure_is_terminal_for_the_session() {
    let adapter = MockAdapter::new(MockBehavior {
        fail_start: Some("simulated spawn failure".into()),
        ..MockBehavior::default()
    });
    let env = env_with_adapters(4, vec![adapter]).await;

    let mut config = session_config("org-1", PolicySpec::default());
    config.session_id = Some("spawn-fail".into());

    let err = env
        .manager
        .start_session(&config)
        .await
        .expect_err("start should fail");
    assert!(matches!(err, AppError::Provider(_)));

    let events = session_events(&env.transport, "spawn-fail");
    let ended = events
        .iter()
        .find(|e| e["type"] == "SESSION_ENDED")
        .expect("ended event");
    assert_eq!(ended["finalState"], "failed");
    assert!(ended["reason"]
        .as_str()
        .expect("reason")
        .contains("provider start failed"));
}

#[tokio::test]
async fn unknown_session_id_is_a_distinct_error() {
    let env = env_with_adapters(4, vec![]).await;

    let err = env
        .manager
        .stop_session("no-such-session", true)
        .await
        .expect_err("unknown id");
    assert!(matches!(err, AppError::NotFound(_)));

    let err = env
        .manager
        .resume_session("no-such-session")
        .await
        .expect_err("unknown id");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn pause_queues_input_and_resume_releases_it() {
    let adapter = MockAdapter::new(MockBehavior::clean_exit());
    let driver = adapter.clone();
    let env = env_with_adapters(4, vec![adapter]).await;

    let session = env
        .manager
        .start_session(&session_config("org-1", PolicySpec::default()))
        .await
        .expect("start");

    env.manager.pause_session(&session.id).await.expect("pause");
    env.manager
        .send_input(
            &session.id,
            InputChunk {
                data: "try another approach".into(),
                mode: InputMode::Line,
            },
        )
        .await
        .expect("input while paused is queued");
    assert!(driver.recorded_inputs().is_empty());

    env.manager
        .resume_session(&session.id)
        .await
        .expect("resume");
    assert_eq!(
        driver.recorded_inputs(),
        vec!["try another approach".to_owned()]
    );

    let types = event_types(&env.transport, &session.id);
    let changes: Vec<_> = session_events(&env.transport, &session.id)
        .into_iter()
        .filter(|e| e["type"] == "SESSION_STATE_CHANGED")
        .map(|e| (e["from"].to_string(), e["to"].to_string()))
        .collect();
    assert!(types.contains(&"SESSION_STATE_CHANGED".to_owned()));
    assert!(changes.contains(&("\"running\"".into(), "\"paused_by_human\"".into())));
    assert!(changes.contains(&("\"paused_by_human\"".into(), "\"running\"".into())));
}

#[tokio::test]
async fn resume_without_pause_is_a_validation_error() {
    let adapter = MockAdapter::new(MockBehavior::clean_exit());
    let env = env_with_adapters(4, vec![adapter]).await;

    let session = env
        .manager
        .start_session(&session_config("org-1", PolicySpec::default()))
        .await
        .expect("start");

    let err = env
        .manager
        .resume_session(&session.id)
        .await
        .expect_err("resume while running");
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn usage_ticks_report_accumulated_metrics() {
    let adapter = MockAdapter::new(MockBehavior::clean_exit());
    let driver = adapter.clone();
    let env = env_with_adapters_opts(4, vec![adapter], true, 1).await;

    let session = env
        .manager
        .start_session(&session_config("org-1", PolicySpec::default()))
        .await
        .expect("start");

    driver
        .push(ProviderEvent::Terminal {
            data: "x".repeat(4096),
            stream: TerminalStream::Stdout,
        })
        .await;
    driver
        .push(ProviderEvent::FileTouched {
            path: "src/a.rs".into(),
            change: FileChange::Created,
        })
        .await;

    let transport = env.transport.clone();
    let id = session.id.clone();
    wait_for(3000, || {
        event_types(&transport, &id)
            .iter()
            .any(|t| t == "USAGE_TICK")
    })
    .await;

    let events = session_events(&env.transport, &session.id);
    let tick = events
        .iter()
        .find(|e| e["type"] == "USAGE_TICK")
        .expect("usage tick");
    assert_eq!(tick["usage"]["terminal_kb"], 4);
    assert_eq!(tick["usage"]["files_touched"], 1);
}

#[tokio::test]
async fn duration_limit_raises_an_alert_and_stops_the_session() {
    let adapter = MockAdapter::new(MockBehavior::clean_exit());
    let env = env_with_adapters_opts(4, vec![adapter], true, 1).await;

    let mut config = session_config("org-1", PolicySpec::default());
    config.billing.max_duration_seconds = 1;

    let session = env
        .manager
        .start_session(&config)
        .await
        .expect("start");

    let transport = env.transport.clone();
    let id = session.id.clone();
    wait_for(6000, || {
        event_types(&transport, &id)
            .iter()
            .any(|t| t == "SESSION_ENDED")
    })
    .await;

    let types = event_types(&env.transport, &session.id);
    assert!(types.contains(&"ALERT_RAISED".to_owned()));

    let events = session_events(&env.transport, &session.id);
    let ended = events
        .iter()
        .find(|e| e["type"] == "SESSION_ENDED")
        .expect("ended");
    assert_eq!(ended["finalState"], "failed");
    assert!(ended["reason"]
        .as_str()
        .expect("reason")
        .contains("duration limit exceeded"));
}

#[tokio::test]
async fn shutdown_drains_every_live_session() {
    let a = MockAdapter::new(MockBehavior::clean_exit());
    let b = MockAdapter::new(MockBehavior::clean_exit());
    let (da, db) = (a.clone(), b.clone());
    let env = env_with_adapters(4, vec![a, b]).await;

    env.manager
        .start_session(&session_config("org-1", PolicySpec::default()))
        .await
        .expect("start a");
    env.manager
        .start_session(&session_config("org-2", PolicySpec::default()))
        .await
        .expect("start b");
    assert_eq!(env.manager.live_count().await, 2);

    env.manager.shutdown().await;

    assert_eq!(env.manager.live_count().await, 0);
    assert_eq!(da.stops.lock().unwrap().as_slice(), &[true]);
    assert_eq!(db.stops.lock().unwrap().as_slice(), &[true]);
}
