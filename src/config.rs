//! Global configuration parsing, validation, and credential loading.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::{AppError, Result};

/// Keyring service name used for all stored credentials.
const KEYRING_SERVICE: &str = "agent-runner";

/// Event stream transport tuning.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StreamConfig {
    /// Maximum number of buffered events while disconnected.
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,
    /// Base reconnect delay in milliseconds (doubles per attempt).
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    /// Ceiling for the reconnect delay in milliseconds.
    #[serde(default = "default_reconnect_cap_ms")]
    pub reconnect_cap_ms: u64,
    /// Reconnect attempts before giving up permanently.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Keepalive ping interval in seconds while connected.
    #[serde(default = "default_ping_interval_seconds")]
    pub ping_interval_seconds: u64,
}

fn default_max_buffer_size() -> usize {
    512
}

fn default_reconnect_base_ms() -> u64 {
    5000
}

fn default_reconnect_cap_ms() -> u64 {
    60_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_ping_interval_seconds() -> u64 {
    30
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: default_max_buffer_size(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_cap_ms: default_reconnect_cap_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            ping_interval_seconds: default_ping_interval_seconds(),
        }
    }
}

/// Launch configuration for one provider backend CLI.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ProviderCommandConfig {
    /// Backend CLI binary (e.g., `claude`, `codex`).
    pub command: String,
    /// Default arguments passed before session-specific ones.
    #[serde(default)]
    pub args: Vec<String>,
    /// Maximum time to wait for the process's first output line.
    #[serde(default = "default_startup_timeout_seconds")]
    pub startup_timeout_seconds: u64,
}

fn default_startup_timeout_seconds() -> u64 {
    30
}

fn default_heartbeat_interval_seconds() -> u64 {
    15
}

fn default_usage_tick_interval_seconds() -> u64 {
    30
}

fn default_shutdown_grace_seconds() -> u64 {
    20
}

fn default_max_concurrent_sessions() -> u32 {
    4
}

fn default_ipc_name() -> String {
    "agent-runner".into()
}

fn default_providers() -> HashMap<String, ProviderCommandConfig> {
    let mut map = HashMap::new();
    map.insert(
        "claude".to_owned(),
        ProviderCommandConfig {
            command: "claude".into(),
            args: vec!["--output-format".into(), "stream-json".into()],
            startup_timeout_seconds: default_startup_timeout_seconds(),
        },
    );
    map.insert(
        "codex".to_owned(),
        ProviderCommandConfig {
            command: "codex".into(),
            args: vec!["exec".into()],
            startup_timeout_seconds: default_startup_timeout_seconds(),
        },
    );
    map
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Stable identifier reported to the coordinator.
    pub runner_id: String,
    /// Coordinator WebSocket endpoint (`ws://` or `wss://`).
    pub coordinator_url: String,
    /// Authentication token for the coordinator connection
    /// (populated at runtime via keychain or `RUNNER_AUTH_TOKEN`).
    #[serde(skip)]
    pub auth_token: String,
    /// Root directory under which per-session workspaces are created.
    pub workspaces_root: PathBuf,
    /// Maximum concurrent agent sessions across all orgs.
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: u32,
    /// Heartbeat reporting interval.
    #[serde(default = "default_heartbeat_interval_seconds")]
    pub heartbeat_interval_seconds: u64,
    /// Per-session usage reporting interval.
    #[serde(default = "default_usage_tick_interval_seconds")]
    pub usage_tick_interval_seconds: u64,
    /// Deadline for draining live sessions on shutdown.
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
    /// Named pipe / Unix socket identifier for `agent-runner-ctl`.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Event stream transport tuning.
    #[serde(default)]
    pub stream: StreamConfig,
    /// Provider backend launch table keyed by provider kind.
    #[serde(default = "default_providers")]
    pub providers: HashMap<String, ProviderCommandConfig>,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the coordinator auth token from OS keychain with env-var fallback.
    ///
    /// # Errors
    ///
    /// Returns `AppError::MissingCredential` if neither keychain nor the
    /// `RUNNER_AUTH_TOKEN` environment variable provides the token.
    pub async fn load_credentials(&mut self) -> Result<()> {
        self.auth_token = resolve_secret("coordinator_auth_token", "RUNNER_AUTH_TOKEN").await?;
        Ok(())
    }

    /// Coordinator connection URL with auth token and runner id attached.
    #[must_use]
    pub fn connect_url(&self) -> String {
        format!(
            "{}?token={}&runner_id={}",
            self.coordinator_url, self.auth_token, self.runner_id
        )
    }

    fn validate(&self) -> Result<()> {
        if self.runner_id.trim().is_empty() {
            return Err(AppError::Config("runner_id must not be empty".into()));
        }

        if !self.coordinator_url.starts_with("ws://") && !self.coordinator_url.starts_with("wss://")
        {
            return Err(AppError::Config(
                "coordinator_url must be a ws:// or wss:// endpoint".into(),
            ));
        }

        if self.max_concurrent_sessions == 0 {
            return Err(AppError::Config(
                "max_concurrent_sessions must be greater than zero".into(),
            ));
        }

        if self.stream.max_buffer_size == 0 {
            return Err(AppError::Config(
                "stream.max_buffer_size must be greater than zero".into(),
            ));
        }

        if self.stream.reconnect_base_ms == 0 {
            return Err(AppError::Config(
                "stream.reconnect_base_ms must be greater than zero".into(),
            ));
        }

        if self.providers.is_empty() {
            return Err(AppError::Config(
                "at least one provider must be configured".into(),
            ));
        }

        Ok(())
    }
}

/// Resolve a single secret from OS keychain with env-var fallback.
///
/// Tries the `agent-runner` keyring service first, then falls back to the
/// given environment variable. Used for the coordinator token and for
/// per-provider API keys during session pre-flight.
///
/// # Errors
///
/// Returns `AppError::MissingCredential` if neither source provides a
/// non-empty value.
pub async fn resolve_secret(keyring_key: &str, env_key: &str) -> Result<String> {
    let key = keyring_key.to_owned();

    // Keychain access is synchronous I/O; run it off the async threads.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(value),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            warn!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    env::var(env_key)
        .ok()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            AppError::MissingCredential(format!(
                "credential {keyring_key} not found in keychain or {env_key} env var"
            ))
        })
}
