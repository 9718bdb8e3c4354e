//! Interfaces to the collaborators that sit outside the sync engine: the
//! host's local server objects, user notification, and the debugger.
//!
//! Default implementations are provided for headless use; the host tooling
//! supplies its own.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::project::ProjectSnapshot;

/// A local object linked to one remote project (for example an IDE server
/// entry). Callbacks run on the event delivery path and must return quickly;
/// anything slow belongs on a separate task.
pub trait LinkedServer: Send + Sync {
    fn on_state_changed(&self, project: &ProjectSnapshot);

    fn on_connection_lost(&self, _project: &ProjectSnapshot) {}

    fn on_connection_restored(&self, _project: &ProjectSnapshot) {}
}

/// Lookup of linked local servers by project id. Called on demand for every
/// notification and never cached, so a destroyed local object simply stops
/// being found.
pub trait LocalServers: Send + Sync {
    fn find_by_project_id(&self, project_id: &str) -> Option<Arc<dyn LinkedServer>>;
}

/// No local servers at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLocalServers;

impl LocalServers for NoLocalServers {
    fn find_by_project_id(&self, _project_id: &str) -> Option<Arc<dyn LinkedServer>> {
        None
    }
}

/// User-facing notification sink.
pub trait Notifier: Send + Sync {
    fn notify(&self, is_error: bool, title: &str, message: &str);
}

/// Routes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, is_error: bool, title: &str, message: &str) {
        if is_error {
            tracing::error!(title = %title, "{}", message);
        } else {
            tracing::info!(title = %title, "{}", message);
        }
    }
}

/// A notification captured by [`RecordingNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub is_error: bool,
    pub title: String,
    pub message: String,
}

/// Keeps every notification in memory. Useful for embedding hosts that
/// drain notifications on their own schedule, and for tests.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.seen.lock().clone()
    }

    pub fn errors(&self) -> Vec<Notification> {
        self.seen
            .lock()
            .iter()
            .filter(|n| n.is_error)
            .cloned()
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, is_error: bool, title: &str, message: &str) {
        self.seen.lock().push(Notification {
            is_error,
            title: title.to_string(),
            message: message.to_string(),
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct AttachError(pub String);

/// A live debugger connection. Dropping it detaches.
#[derive(Debug)]
pub struct DebugHandle {
    pub host: String,
    pub port: u16,
    stream: Option<tokio::net::TcpStream>,
}

impl DebugHandle {
    /// A handle with no transport of its own, for attachers that manage the
    /// connection elsewhere.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            stream: None,
        }
    }

    pub fn with_stream(host: impl Into<String>, port: u16, stream: tokio::net::TcpStream) -> Self {
        Self {
            host: host.into(),
            port,
            stream: Some(stream),
        }
    }

    /// Take the underlying connection, if this handle owns one.
    pub fn into_stream(self) -> Option<tokio::net::TcpStream> {
        self.stream
    }
}

/// The debugger-attach primitive.
#[async_trait]
pub trait DebugAttacher: Send + Sync {
    async fn attach(&self, host: &str, port: u16, timeout: Duration)
        -> Result<DebugHandle, AttachError>;
}

/// Treats a successful TCP connect to the debug port as an attach. Good
/// enough for protocol-agnostic tooling that hands the socket to a real
/// debugger front end.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpAttacher;

#[async_trait]
impl DebugAttacher for TcpAttacher {
    async fn attach(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<DebugHandle, AttachError> {
        match tokio::time::timeout(timeout, tokio::net::TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => Ok(DebugHandle::with_stream(host, port, stream)),
            Ok(Err(e)) => Err(AttachError(format!("{}:{}: {}", host, port, e))),
            Err(_) => Err(AttachError(format!(
                "{}:{}: no answer within {:?}",
                host, port, timeout
            ))),
        }
    }
}
