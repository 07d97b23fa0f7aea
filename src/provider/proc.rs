//! OS process plumbing shared by provider adapters.
//!
//! Adapters keep their protocol dialects to themselves; this module only
//! holds the low-level spawn/signal/reap utilities and the subscriber
//! slot used to fan events out of reader tasks.

use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::warn;

use crate::provider::{Detection, ProviderEvent, ProviderExit};
use crate::{AppError, Result};

/// Grace period for a SIGINT-initiated wind-down before force-kill.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Probe timeout for `<cli> --version`.
pub const DETECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Environment variables inherited by spawned provider processes.
///
/// Everything else is stripped via `env_clear()` so runner secrets are
/// never visible to the agent; credentials and session context are
/// injected explicitly by each adapter.
pub const ALLOWED_ENV_VARS: &[&str] = &["PATH", "HOME", "RUST_LOG", "TERM", "LANG", "TMPDIR"];

/// Shared slot for an adapter's single event subscriber.
///
/// A std mutex, not a tokio one: `subscribe` must install the sender
/// synchronously, and the slot is never held across an await.
pub type EventSlot = Arc<std::sync::Mutex<Option<mpsc::Sender<ProviderEvent>>>>;

/// Create an empty subscriber slot.
#[must_use]
pub fn event_slot() -> EventSlot {
    Arc::new(std::sync::Mutex::new(None))
}

/// Install `tx` as the slot's subscriber, replacing any previous one.
pub fn set_subscriber(slot: &EventSlot, tx: mpsc::Sender<ProviderEvent>) {
    if let Ok(mut guard) = slot.lock() {
        *guard = Some(tx);
    }
}

/// Deliver an event to the current subscriber, if any.
pub async fn emit(slot: &EventSlot, event: ProviderEvent) {
    let tx = slot.lock().ok().and_then(|guard| guard.as_ref().cloned());
    if let Some(tx) = tx {
        let _ = tx.send(event).await;
    }
}

/// Probe a backend CLI via `<command> --version`.
pub async fn detect_cli(command: &str) -> Detection {
    let probe = Command::new(command)
        .arg("--version")
        .stdin(std::process::Stdio::null())
        .output();

    match tokio::time::timeout(DETECT_TIMEOUT, probe).await {
        Ok(Ok(output)) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let version = stdout
                .split_whitespace()
                .next()
                .map(std::borrow::ToOwned::to_owned);
            Detection {
                installed: true,
                version,
            }
        }
        _ => Detection {
            installed: false,
            version: None,
        },
    }
}

/// Request a graceful wind-down.
#[cfg(unix)]
pub fn send_interrupt(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
        if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGINT) {
            warn!(%err, pid, "failed to deliver SIGINT");
        }
    }
}

/// On non-unix targets graceful stop begins with a kill request; the
/// bounded wait still lets the runtime flush pipes.
#[cfg(not(unix))]
pub fn send_interrupt(child: &Child) {
    let _ = child;
}

/// Force-kill and reap the child.
///
/// # Errors
///
/// Returns [`AppError::Provider`] when the OS kill or wait call fails.
pub async fn force_kill(child: &mut Child) -> Result<ProviderExit> {
    child
        .kill()
        .await
        .map_err(|err| AppError::Provider(format!("kill failed: {err}")))?;
    let status = child
        .wait()
        .await
        .map_err(|err| AppError::Provider(format!("wait failed: {err}")))?;
    Ok(ProviderExit {
        code: status.code(),
    })
}
