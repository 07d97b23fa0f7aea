//! Workspace isolation seam.
//!
//! The real checkout service (clone, branch, teardown of repo state) is an
//! external collaborator; the runner only needs an isolated filesystem
//! root per session. [`LocalWorkspaces`] provides that on the local disk.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use tracing::{debug, info};

use crate::{AppError, Result};

/// An isolated filesystem root prepared for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceHandle {
    /// Owning session identifier.
    pub session_id: String,
    /// Absolute workspace root the provider process starts in.
    pub root: PathBuf,
}

/// Prepares and tears down per-session workspace roots.
pub trait WorkspaceProvisioner: Send + Sync {
    /// Create an isolated root for the session.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Workspace`](crate::AppError::Workspace) if the
    /// root cannot be created.
    fn prepare(
        &self,
        session_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<WorkspaceHandle>> + Send + '_>>;

    /// Remove the session's root and everything under it.
    ///
    /// Idempotent — tearing down an already-removed root is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Workspace`](crate::AppError::Workspace) on
    /// filesystem failures other than absence.
    fn teardown(
        &self,
        handle: WorkspaceHandle,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Local-disk provisioner: one prefixed directory per session under a
/// configured root.
pub struct LocalWorkspaces {
    root: PathBuf,
}

impl LocalWorkspaces {
    /// Create a provisioner rooted at `root` (created on first use).
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

impl WorkspaceProvisioner for LocalWorkspaces {
    fn prepare(
        &self,
        session_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<WorkspaceHandle>> + Send + '_>> {
        let session_id = session_id.to_owned();
        Box::pin(async move {
            tokio::fs::create_dir_all(&self.root)
                .await
                .map_err(|err| AppError::Workspace(format!("cannot create root: {err}")))?;

            // tempfile is synchronous I/O; keep it off the async threads.
            let base = self.root.clone();
            let prefix = format!("session-{session_id}-");
            let dir = tokio::task::spawn_blocking(move || {
                tempfile::Builder::new().prefix(&prefix).tempdir_in(base)
            })
            .await
            .map_err(|err| AppError::Workspace(format!("provision task panicked: {err}")))?
            .map_err(|err| AppError::Workspace(format!("cannot create workspace: {err}")))?;

            let root = dir.into_path();
            info!(session_id, root = %root.display(), "workspace prepared");
            Ok(WorkspaceHandle { session_id, root })
        })
    }

    fn teardown(
        &self,
        handle: WorkspaceHandle,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            match tokio::fs::remove_dir_all(&handle.root).await {
                Ok(()) => {
                    debug!(session_id = handle.session_id, "workspace removed");
                    Ok(())
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(AppError::Workspace(format!(
                    "cannot remove workspace: {err}"
                ))),
            }
        })
    }
}
