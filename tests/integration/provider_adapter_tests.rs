//! Adapter contract tests against real child processes (bash stand-ins)
//! plus stream-dialect parsing.

use std::time::Duration;

use serial_test::serial;

use agent_runner::config::ProviderCommandConfig;
use agent_runner::protocol::{InputMode, TerminalStream};
use agent_runner::provider::claude::{parse_stream_line, ClaudeAdapter};
use agent_runner::provider::codex::CodexAdapter;
use agent_runner::provider::{LaunchSpec, ProviderAdapter, ProviderEvent};

fn launch(session_id: &str, dir: &tempfile::TempDir) -> LaunchSpec {
    LaunchSpec {
        session_id: session_id.to_owned(),
        workspace_root: dir.path().to_path_buf(),
        prompt: "do the task".into(),
        credentials: vec![],
    }
}

fn bash_provider(script: &str) -> ProviderCommandConfig {
    ProviderCommandConfig {
        command: "bash".into(),
        args: vec!["-c".into(), script.to_owned()],
        startup_timeout_seconds: 5,
    }
}

async fn next_event(
    rx: &mut tokio::sync::mpsc::Receiver<ProviderEvent>,
) -> ProviderEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event within 5s")
        .expect("channel open")
}

#[tokio::test]
async fn detect_reports_absence_without_error() {
    let adapter = ClaudeAdapter::new(ProviderCommandConfig {
        command: "definitely-not-an-installed-cli".into(),
        args: vec![],
        startup_timeout_seconds: 5,
    });
    let detection = adapter.detect().await;
    assert!(!detection.installed);
    assert!(detection.version.is_none());
}

#[tokio::test]
async fn stop_before_start_is_a_no_op() {
    let adapter = ClaudeAdapter::new(bash_provider("true"));
    let exit = adapter.stop(true).await.expect("idempotent stop");
    assert_eq!(exit.code, None);
}

#[tokio::test]
async fn send_input_before_start_is_a_provider_error() {
    let adapter = ClaudeAdapter::new(bash_provider("true"));
    let err = adapter
        .send_input("hello", InputMode::Line)
        .await
        .expect_err("no process yet");
    assert!(err.to_string().starts_with("provider:"));
}

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn claude_adapter_parses_its_ndjson_stream_and_reports_exit() {
    let script = r#"
echo '{"event":"status","params":{"message":"booting"}}'
echo '{"event":"terminal","params":{"data":"compiling"}}'
echo '{"event":"file","params":{"path":"src/lib.rs","change":"modified"}}'
echo '{"event":"mystery","params":{"x":1}}'
"#;
    let adapter = ClaudeAdapter::new(bash_provider(script));
    let dir = tempfile::tempdir().expect("tempdir");

    let mut events = adapter.subscribe();
    let started = adapter
        .start_session(launch("s-claude", &dir))
        .await
        .expect("spawn bash");
    assert!(started.pid.is_some());

    match next_event(&mut events).await {
        ProviderEvent::Status { message } => assert_eq!(message, "booting"),
        other => panic!("expected status, got {other:?}"),
    }
    match next_event(&mut events).await {
        ProviderEvent::Terminal { data, stream } => {
            assert_eq!(data, "compiling");
            assert_eq!(stream, TerminalStream::Stdout);
        }
        other => panic!("expected terminal, got {other:?}"),
    }
    match next_event(&mut events).await {
        ProviderEvent::FileTouched { path, .. } => assert_eq!(path, "src/lib.rs"),
        other => panic!("expected file, got {other:?}"),
    }
    match next_event(&mut events).await {
        ProviderEvent::Unknown { raw } => assert_eq!(raw["event"], "mystery"),
        other => panic!("expected unknown, got {other:?}"),
    }
    match next_event(&mut events).await {
        ProviderEvent::Exited { code } => assert_eq!(code, Some(0)),
        other => panic!("expected exit, got {other:?}"),
    }

    // The reader reaped the child; stop is now a no-op reporting the exit.
    let exit = adapter.stop(true).await.expect("stop after exit");
    assert_eq!(exit.code, Some(0));
}

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn non_graceful_stop_kills_a_hung_provider() {
    let script = r#"
echo '{"event":"status","params":{"message":"ready"}}'
sleep 30
"#;
    let adapter = ClaudeAdapter::new(bash_provider(script));
    let dir = tempfile::tempdir().expect("tempdir");

    let mut events = adapter.subscribe();
    adapter
        .start_session(launch("s-hung", &dir))
        .await
        .expect("spawn");
    match next_event(&mut events).await {
        ProviderEvent::Status { .. } => {}
        other => panic!("expected ready status, got {other:?}"),
    }

    let exit = adapter.stop(false).await.expect("kill");
    assert_eq!(exit.code, None, "killed process has no exit code");

    let again = adapter.stop(false).await.expect("second stop");
    assert_eq!(again.code, None);
}

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn startup_timeout_kills_the_silent_process() {
    let adapter = ClaudeAdapter::new(ProviderCommandConfig {
        command: "bash".into(),
        args: vec!["-c".into(), "sleep 30".into()],
        startup_timeout_seconds: 1,
    });
    let dir = tempfile::tempdir().expect("tempdir");

    let err = adapter
        .start_session(launch("s-silent", &dir))
        .await
        .expect_err("no ready line");
    assert!(err.to_string().contains("startup timeout"), "got {err}");
}

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn codex_adapter_forwards_plain_lines_as_terminal_chunks() {
    let script = r#"
echo 'codex ready'
echo 'running tests'
"#;
    let adapter = CodexAdapter::new(bash_provider(script));
    let dir = tempfile::tempdir().expect("tempdir");

    let mut events = adapter.subscribe();
    adapter
        .start_session(launch("s-codex", &dir))
        .await
        .expect("spawn");

    match next_event(&mut events).await {
        ProviderEvent::Terminal { data, .. } => assert_eq!(data, "codex ready"),
        other => panic!("expected terminal, got {other:?}"),
    }
    match next_event(&mut events).await {
        ProviderEvent::Terminal { data, .. } => assert_eq!(data, "running tests"),
        other => panic!("expected terminal, got {other:?}"),
    }
    match next_event(&mut events).await {
        ProviderEvent::Exited { code } => assert_eq!(code, Some(0)),
        other => panic!("expected exit, got {other:?}"),
    }
}

#[test]
fn non_json_lines_become_terminal_output() {
    let event = parse_stream_line("warning: update available").expect("event");
    match event {
        ProviderEvent::Terminal { data, stream } => {
            assert_eq!(data, "warning: update available");
            assert_eq!(stream, TerminalStream::Stdout);
        }
        other => panic!("expected terminal, got {other:?}"),
    }
}

#[test]
fn action_requests_carry_their_correlation_id() {
    let line = r#"{"event":"action_request","id":"req-7","params":{"category":"shell","summary":"run build","risk":"medium","command":"cargo build"}}"#;
    let event = parse_stream_line(line).expect("event");
    match event {
        ProviderEvent::ActionRequested {
            request_id,
            command,
            ..
        } => {
            assert_eq!(request_id, "req-7");
            assert_eq!(command.as_deref(), Some("cargo build"));
        }
        other => panic!("expected action request, got {other:?}"),
    }
}

#[test]
fn blank_lines_are_skipped() {
    assert!(parse_stream_line("   ").is_none());
}

#[test]
fn test_run_phases_map_to_started_and_finished() {
    let started = parse_stream_line(
        r#"{"event":"test_run","params":{"phase":"started","suite":"unit"}}"#,
    )
    .expect("event");
    assert!(matches!(started, ProviderEvent::TestRunStarted { .. }));

    let finished = parse_stream_line(
        r#"{"event":"test_run","params":{"phase":"finished","passed":8,"failed":1}}"#,
    )
    .expect("event");
    match finished {
        ProviderEvent::TestRunFinished { passed, failed, .. } => {
            assert_eq!(passed, 8);
            assert_eq!(failed, 1);
        }
        other => panic!("expected finished, got {other:?}"),
    }
}
