//! Unit tests for configuration parsing and validation.

use agent_runner::config::GlobalConfig;
use agent_runner::AppError;

const MINIMAL: &str = r#"
runner_id = "runner-1"
coordinator_url = "wss://coordinator.example.com/runner"
workspaces_root = "/tmp/agent-runner-test"
"#;

#[test]
fn minimal_config_parses_with_defaults() {
    let config = GlobalConfig::from_toml_str(MINIMAL).expect("parse minimal config");
    assert_eq!(config.runner_id, "runner-1");
    assert_eq!(config.max_concurrent_sessions, 4);
    assert_eq!(config.heartbeat_interval_seconds, 15);
    assert_eq!(config.usage_tick_interval_seconds, 30);
    assert_eq!(config.ipc_name, "agent-runner");
    assert_eq!(config.stream.max_buffer_size, 512);
    assert_eq!(config.stream.reconnect_base_ms, 5000);
    assert_eq!(config.stream.reconnect_cap_ms, 60_000);
    assert_eq!(config.stream.max_reconnect_attempts, 10);
    assert!(config.providers.contains_key("claude"));
    assert!(config.providers.contains_key("codex"));
}

#[test]
fn overrides_are_honored() {
    let raw = r#"
runner_id = "runner-2"
coordinator_url = "ws://localhost:9000"
workspaces_root = "/tmp/ws"
max_concurrent_sessions = 1
heartbeat_interval_seconds = 5

[stream]
max_buffer_size = 3
reconnect_base_ms = 100
max_reconnect_attempts = 2

[providers.claude]
command = "/usr/local/bin/claude"
args = ["--output-format", "stream-json"]
"#;
    let config = GlobalConfig::from_toml_str(raw).expect("parse overrides");
    assert_eq!(config.max_concurrent_sessions, 1);
    assert_eq!(config.stream.max_buffer_size, 3);
    assert_eq!(config.stream.reconnect_base_ms, 100);
    assert_eq!(config.stream.max_reconnect_attempts, 2);
    let claude = config.providers.get("claude").expect("claude provider");
    assert_eq!(claude.command, "/usr/local/bin/claude");
    assert_eq!(claude.startup_timeout_seconds, 30);
}

#[test]
fn empty_runner_id_is_rejected() {
    let raw = MINIMAL.replace("runner-1", " ");
    let err = GlobalConfig::from_toml_str(&raw).expect_err("should reject blank runner id");
    assert!(matches!(err, AppError::Config(_)), "got {err:?}");
}

#[test]
fn non_websocket_url_is_rejected() {
    let raw = MINIMAL.replace("wss://coordinator.example.com/runner", "https://nope");
    let err = GlobalConfig::from_toml_str(&raw).expect_err("should reject http url");
    assert!(err.to_string().contains("ws://"), "got {err}");
}

#[test]
fn zero_session_limit_is_rejected() {
    let raw = format!("{MINIMAL}\nmax_concurrent_sessions = 0\n");
    assert!(GlobalConfig::from_toml_str(&raw).is_err());
}

#[test]
fn zero_buffer_size_is_rejected() {
    let raw = format!("{MINIMAL}\n[stream]\nmax_buffer_size = 0\n");
    assert!(GlobalConfig::from_toml_str(&raw).is_err());
}

#[test]
fn invalid_toml_maps_to_config_error() {
    let err = GlobalConfig::from_toml_str("runner_id = [").expect_err("bad toml");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn connect_url_carries_token_and_runner_id() {
    let mut config = GlobalConfig::from_toml_str(MINIMAL).expect("parse");
    config.auth_token = "secret-token".into();
    let url = config.connect_url();
    assert_eq!(
        url,
        "wss://coordinator.example.com/runner?token=secret-token&runner_id=runner-1"
    );
}
