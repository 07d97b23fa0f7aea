//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Malformed command or missing/invalid command field.
    Validation(String),
    /// Concurrency limit reached; the command had no side effect.
    Capacity(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Session exists but has already reached a terminal state.
    SessionFinished(String),
    /// Approval has already been resolved.
    AlreadyResolved(String),
    /// Required provider credential is absent (pre-flight check).
    MissingCredential(String),
    /// Provider adapter start/stop/input failure.
    Provider(String),
    /// Event stream connection or send failure.
    Transport(String),
    /// Policy denial or denylist hit.
    Policy(String),
    /// Workspace provisioning or teardown failure.
    Workspace(String),
    /// IPC communication failure.
    Ipc(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::Capacity(msg) => write!(f, "capacity: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::SessionFinished(msg) => write!(f, "session finished: {msg}"),
            Self::AlreadyResolved(msg) => write!(f, "already resolved: {msg}"),
            Self::MissingCredential(msg) => write!(f, "missing credential: {msg}"),
            Self::Provider(msg) => write!(f, "provider: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::Policy(msg) => write!(f, "policy: {msg}"),
            Self::Workspace(msg) => write!(f, "workspace: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(format!("malformed json: {err}"))
    }
}
