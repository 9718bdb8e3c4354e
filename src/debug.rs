//! Attach a debugger to a project restarted in debug mode.
//!
//! Two phases share one deadline:
//!
//! 1. Wait for the restart result, then for a debug port. Polls on a timer
//!    and also wakes on every project-list change.
//! 2. Try the attach handshake repeatedly until it succeeds.
//!
//! A restart that succeeded but could not be attached to is reported as a
//! [`DebugError`], never as a restart failure.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::collab::{DebugAttacher, DebugHandle};
use crate::config::TimeoutConfig;
use crate::error::SyncError;
use crate::project::StartMode;
use crate::session::Session;

#[derive(Debug, thiserror::Error)]
pub enum DebugError {
    #[error("{mode:?} is not a debug start mode")]
    NotDebugMode { mode: StartMode },

    #[error("restart result for project {project} never observed within {after:?}")]
    RestartNeverObserved { project: String, after: Duration },

    #[error("project {project} restarted but reported no debug port within {after:?}")]
    PortNeverReported { project: String, after: Duration },

    #[error("restart of project {project} failed")]
    RestartFailed { project: String },

    #[error("could not attach to {host}:{port} after {attempts} attempts: {last_error}")]
    AttachTimedOut {
        host: String,
        port: u16,
        attempts: u32,
        last_error: String,
    },

    #[error("debug attach cancelled")]
    Cancelled,

    #[error(transparent)]
    Request(#[from] SyncError),
}

#[derive(Debug, Clone)]
pub struct DebugOptions {
    /// Overall deadline for both phases.
    pub start_timeout: Duration,
    pub poll: Duration,
    pub attach_retry: Duration,
    pub attach_attempt: Duration,
}

impl Default for DebugOptions {
    fn default() -> Self {
        Self::from(&TimeoutConfig::default())
    }
}

impl From<&TimeoutConfig> for DebugOptions {
    fn from(timeouts: &TimeoutConfig) -> Self {
        Self {
            start_timeout: timeouts.debug_start_timeout(),
            poll: timeouts.debug_poll(),
            attach_retry: timeouts.attach_retry(),
            attach_attempt: timeouts.attach_attempt(),
        }
    }
}

/// A successful attach.
#[derive(Debug)]
pub struct DebugAttach {
    pub port: u16,
    pub attempts: u32,
    pub handle: DebugHandle,
}

pub struct DebugCoordinator {
    attacher: Arc<dyn DebugAttacher>,
    options: DebugOptions,
}

impl DebugCoordinator {
    pub fn new(attacher: Arc<dyn DebugAttacher>, options: DebugOptions) -> Self {
        Self { attacher, options }
    }

    /// Request a debug-mode restart of `project_id` and attach once it is up.
    pub async fn restart_and_attach(
        &self,
        session: &Session,
        project_id: &str,
        mode: StartMode,
        cancel: &CancellationToken,
    ) -> Result<DebugAttach, DebugError> {
        if !mode.is_debug() {
            return Err(DebugError::NotDebugMode { mode });
        }
        let before = session.projects().restart_count(project_id);
        session.request_restart(project_id, mode).await?;
        self.attach_after_restart(session, project_id, before, cancel)
            .await
    }

    /// Attach to `project_id` once a restart result newer than
    /// `restarts_before` has been seen and the project reports a debug port.
    pub async fn attach_after_restart(
        &self,
        session: &Session,
        project_id: &str,
        restarts_before: u64,
        cancel: &CancellationToken,
    ) -> Result<DebugAttach, DebugError> {
        let deadline = Instant::now() + self.options.start_timeout;
        let port = self
            .wait_for_port(session, project_id, restarts_before, deadline, cancel)
            .await?;
        tracing::info!(uri = %session.uri(), project = %project_id, port, "debug port reported");

        self.attach(session.uri().host(), port, deadline, cancel)
            .await
    }

    async fn wait_for_port(
        &self,
        session: &Session,
        project_id: &str,
        restarts_before: u64,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<u16, DebugError> {
        let list = session.projects();
        let mut changes = list.changes();
        let mut poll = tokio::time::interval(self.options.poll);
        let mut restart_seen = false;

        loop {
            if let Some(record) = list
                .restart_record(project_id)
                .filter(|r| r.count > restarts_before)
            {
                if !record.success {
                    return Err(DebugError::RestartFailed {
                        project: project_id.to_string(),
                    });
                }
                restart_seen = true;
                if let Some(port) = list.get(project_id).and_then(|p| p.debug_port()) {
                    return Ok(port);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(DebugError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    let project = project_id.to_string();
                    let after = self.options.start_timeout;
                    return Err(if restart_seen {
                        DebugError::PortNeverReported { project, after }
                    } else {
                        DebugError::RestartNeverObserved { project, after }
                    });
                }
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Err(SyncError::Closed(session.uri().to_string()).into());
                    }
                }
                _ = poll.tick() => {}
            }
        }
    }

    async fn attach(
        &self,
        host: &str,
        port: u16,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<DebugAttach, DebugError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            // The first attempt always gets a full slot.
            let slot = if attempts == 1 {
                self.options.attach_attempt
            } else {
                self.options.attach_attempt.min(remaining)
            };

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(DebugError::Cancelled),
                result = self.attacher.attach(host, port, slot) => result,
            };
            let last_error = match result {
                Ok(handle) => {
                    tracing::info!(host = %host, port, attempts, "debugger attached");
                    return Ok(DebugAttach {
                        port,
                        attempts,
                        handle,
                    });
                }
                Err(e) => e.0,
            };
            tracing::debug!(host = %host, port, attempt = attempts, error = %last_error, "attach attempt failed");

            if Instant::now() + self.options.attach_retry >= deadline {
                tracing::warn!(host = %host, port, attempts, "giving up on debugger attach");
                return Err(DebugError::AttachTimedOut {
                    host: host.to_string(),
                    port,
                    attempts,
                    last_error,
                });
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(DebugError::Cancelled),
                _ = tokio::time::sleep(self.options.attach_retry) => {}
            }
        }
    }
}
