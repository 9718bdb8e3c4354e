//! Background retry loop for a server that could not be reached.
//!
//! One [`Supervisor`] per broken URI. It sleeps a fixed delay, runs one
//! connection attempt and loops while the failure is retryable, up to
//! [`RetryPolicy::max_attempts`]. Running out of attempts or hitting any
//! other failure is fatal: the user is told once and the loop stops.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::collab::Notifier;
use crate::config::TimeoutConfig;
use crate::error::SyncError;
use crate::uri::ConnectionUri;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorStatus {
    /// Between attempts, or attempting.
    Waiting,
    Connected,
    Cancelled,
    Failed(SyncError),
}

impl SupervisorStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Waiting)
    }
}

/// Pacing and cap for a supervisor's attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    /// Attempts before giving up. Zero is treated as one.
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&TimeoutConfig::default())
    }
}

impl From<&TimeoutConfig> for RetryPolicy {
    fn from(timeouts: &TimeoutConfig) -> Self {
        Self::new(timeouts.reconnect_delay(), timeouts.reconnect_max_attempts)
    }
}

pub struct Supervisor {
    uri: ConnectionUri,
    attempts: Arc<AtomicU32>,
    cancel: CancellationToken,
    status: watch::Receiver<SupervisorStatus>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("uri", &self.uri)
            .field("attempts", &self.attempts())
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl Supervisor {
    /// Spawn the retry loop. `attempt` performs one full connection attempt
    /// and registers the result; `Ok` ends the loop.
    pub fn spawn<F, Fut>(
        uri: ConnectionUri,
        policy: RetryPolicy,
        notifier: Arc<dyn Notifier>,
        attempt: F,
    ) -> Self
    where
        F: Fn(ConnectionUri) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), SyncError>> + Send + 'static,
    {
        let attempts = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let (status_tx, status) = watch::channel(SupervisorStatus::Waiting);

        let task = tokio::spawn(retry_loop(
            uri.clone(),
            policy,
            notifier,
            attempt,
            attempts.clone(),
            cancel.clone(),
            status_tx,
        ));

        Self {
            uri,
            attempts,
            cancel,
            status,
            task: Some(task),
        }
    }

    /// A supervisor that never runs because the first attempt already failed
    /// fatally. Keeps the URI visible as broken.
    pub fn failed(uri: ConnectionUri, error: SyncError) -> Self {
        let (_, status) = watch::channel(SupervisorStatus::Failed(error));
        Self {
            uri,
            attempts: Arc::new(AtomicU32::new(0)),
            cancel: CancellationToken::new(),
            status,
            task: None,
        }
    }

    pub fn uri(&self) -> &ConnectionUri {
        &self.uri
    }

    /// Attempts made by the loop, not counting the initial one.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> SupervisorStatus {
        self.status.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.clone()
    }

    /// Stop the loop. Dropping a supervisor does not stop it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel and wait for the loop to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn retry_loop<F, Fut>(
    uri: ConnectionUri,
    policy: RetryPolicy,
    notifier: Arc<dyn Notifier>,
    attempt: F,
    attempts: Arc<AtomicU32>,
    cancel: CancellationToken,
    status: watch::Sender<SupervisorStatus>,
) where
    F: Fn(ConnectionUri) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), SyncError>> + Send + 'static,
{
    let max_attempts = policy.max_attempts.max(1);
    tracing::info!(uri = %uri, delay = ?policy.delay, max_attempts, "reconnection supervisor started");

    let outcome = loop {
        tokio::select! {
            _ = cancel.cancelled() => break SupervisorStatus::Cancelled,
            _ = tokio::time::sleep(policy.delay) => {}
        }

        let n = attempts.fetch_add(1, Ordering::Relaxed) + 1;
        let result = tokio::select! {
            _ = cancel.cancelled() => break SupervisorStatus::Cancelled,
            result = attempt(uri.clone()) => result,
        };

        match result {
            // Someone else connected it meanwhile; nothing left to do.
            Ok(()) | Err(SyncError::DuplicateSession(_)) => {
                tracing::info!(uri = %uri, attempts = n, "reconnected");
                break SupervisorStatus::Connected;
            }
            Err(SyncError::Cancelled) => break SupervisorStatus::Cancelled,
            Err(e) if e.is_retryable() && n >= max_attempts => {
                tracing::warn!(uri = %uri, attempts = n, error = %e, "server still unreachable, giving up");
                notifier.notify(
                    true,
                    "Cannot connect",
                    &format!("Gave up on {} after {} attempts: {}", uri, n, e),
                );
                break SupervisorStatus::Failed(e);
            }
            Err(e) if e.is_retryable() => {
                tracing::debug!(uri = %uri, attempt = n, error = %e, "reconnect attempt failed, will retry");
            }
            Err(e) => {
                tracing::warn!(uri = %uri, attempt = n, error = %e, "giving up on server");
                notifier.notify(true, "Cannot connect", &e.to_string());
                break SupervisorStatus::Failed(e);
            }
        }
    };

    if outcome == SupervisorStatus::Cancelled {
        tracing::debug!(uri = %uri, "reconnection supervisor cancelled");
    }
    status.send_replace(outcome);
}
