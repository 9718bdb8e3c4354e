use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::channel::ChannelListener;
use crate::collab::{LocalServers, Notifier};
use crate::error::SyncError;
use crate::event::{Event, EventKind, StatusChange};
use crate::project::{Ports, Project, ProjectSnapshot, RawProject, RunState};
use crate::uri::ConnectionUri;

/// Published to subscribers whenever the project list changes.
#[derive(Debug, Clone)]
pub enum ProjectUpdate {
    /// A project's state changed.
    Changed(ProjectSnapshot),
    /// The server deleted a project; it is no longer in the list.
    Deleted { id: String },
    /// The whole list was replaced by a refresh.
    Refreshed { count: usize },
    ConnectionLost { reason: String },
    ConnectionRestored,
}

/// How many restart results have been seen for a project, and the last one.
///
/// Kept by project id outside the [`Project`] entities so it survives the
/// wholesale replacement done by refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartRecord {
    pub count: u64,
    pub success: bool,
}

/// The session's current project list and the sink for its push events.
///
/// The list is replaced atomically on refresh. Events mutate individual
/// projects through their own locks; only deletion takes the list's write
/// lock.
pub struct ProjectList {
    uri: ConnectionUri,
    projects: RwLock<Vec<Arc<Project>>>,
    restarts: Mutex<HashMap<String, RestartRecord>>,
    connected: AtomicBool,
    servers: Arc<dyn LocalServers>,
    notifier: Arc<dyn Notifier>,
    updates: broadcast::Sender<ProjectUpdate>,
    /// Bumped on every mutation; waiters use it instead of sleeping blind.
    changes: watch::Sender<u64>,
}

impl std::fmt::Debug for ProjectList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectList")
            .field("uri", &self.uri)
            .field("len", &self.projects.read().len())
            .finish_non_exhaustive()
    }
}

impl ProjectList {
    pub fn new(
        uri: ConnectionUri,
        servers: Arc<dyn LocalServers>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        let (updates, _) = broadcast::channel(256);
        let (changes, _) = watch::channel(0);
        Arc::new(Self {
            uri,
            projects: RwLock::new(Vec::new()),
            restarts: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
            servers,
            notifier,
            updates,
            changes,
        })
    }

    pub fn uri(&self) -> &ConnectionUri {
        &self.uri
    }

    /// Parse a project-list response body.
    ///
    /// A body that is not a JSON array is an error and the caller keeps its
    /// previous list. Individual malformed entries are logged and skipped.
    pub fn parse(uri: &ConnectionUri, body: &str) -> Result<Vec<Project>, SyncError> {
        let entries: Vec<serde_json::Value> =
            serde_json::from_str(body).map_err(|e| SyncError::protocol(uri, e))?;

        let mut projects = Vec::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            match serde_json::from_value::<RawProject>(entry) {
                Ok(raw) => projects.push(Project::from_raw(uri, raw)),
                Err(e) => {
                    tracing::warn!(uri = %uri, index, error = %e, "skipping malformed project entry");
                }
            }
        }
        Ok(projects)
    }

    /// Replace the whole list.
    pub fn replace(&self, projects: Vec<Project>) {
        let connected = self.connected.load(Ordering::Acquire);
        let projects: Vec<Arc<Project>> = projects
            .into_iter()
            .map(|p| {
                p.set_connected(connected);
                Arc::new(p)
            })
            .collect();
        let count = projects.len();
        self.restarts
            .lock()
            .retain(|id, _| projects.iter().any(|p| p.id() == id));
        *self.projects.write() = projects;

        tracing::debug!(uri = %self.uri, count, "project list replaced");
        let _ = self.updates.send(ProjectUpdate::Refreshed { count });
        self.bump();
    }

    pub fn get(&self, id: &str) -> Option<Arc<Project>> {
        self.projects.read().iter().find(|p| p.id() == id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Project>> {
        self.projects.read().clone()
    }

    pub fn len(&self) -> usize {
        self.projects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.read().is_empty()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn restart_record(&self, id: &str) -> Option<RestartRecord> {
        self.restarts.lock().get(id).copied()
    }

    /// Number of restart results seen so far for `id`.
    pub fn restart_count(&self, id: &str) -> u64 {
        self.restart_record(id).map_or(0, |r| r.count)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProjectUpdate> {
        self.updates.subscribe()
    }

    /// Change counter; every mutation bumps it.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Invalidate a project's ports after a restart request, unless a
    /// restart result newer than `restarts_before` already reported fresh
    /// ones. Returns whether the ports were cleared.
    pub fn invalidate_ports_since(&self, id: &str, restarts_before: u64) -> bool {
        let Some(project) = self.get(id) else {
            return false;
        };
        {
            let restarts = self.restarts.lock();
            if restarts.get(id).map_or(0, |r| r.count) > restarts_before {
                return false;
            }
            project.invalidate_ports();
        }
        self.bump();
        true
    }

    pub fn ports(&self, id: &str) -> Option<Ports> {
        self.get(id).map(|p| p.ports())
    }

    /// Wait until project `id` reaches `target`.
    pub async fn wait_for_state(
        &self,
        id: &str,
        target: RunState,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let mut changes = self.changes();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.get(id).map(|p| p.run_state()) == Some(target) {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(SyncError::Timeout { what: "project state", after: timeout });
                }
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Err(SyncError::Closed(self.uri.to_string()));
                    }
                }
            }
        }
    }

    /// Apply one push event. Runs on the channel's delivery path, so it only
    /// mutates fields and fires fast callbacks.
    pub fn apply(&self, event: Event) {
        let id = event.project_id;
        let project = self.get(&id);

        match event.kind {
            EventKind::StatusChanged(StatusChange::Empty) => {
                tracing::warn!(uri = %self.uri, project = %id, seq = event.seq, "status event without app or build status, ignoring");
            }
            EventKind::StatusChanged(StatusChange::App { status, error, ports }) => {
                let Some(project) = project else {
                    return self.unknown_project(&id, event.seq);
                };
                let mut changed = project.apply_app_status(&status, error);
                if let Some(ports) = ports {
                    project.set_ports(Ports {
                        http: ports.exposed_port,
                        debug: ports.exposed_debug_port,
                    });
                    changed = true;
                }
                tracing::debug!(uri = %self.uri, project = %id, seq = event.seq, status = %status, "app status");
                if changed {
                    self.publish(&project);
                }
            }
            EventKind::StatusChanged(StatusChange::Build { status, detail }) => {
                let Some(project) = project else {
                    return self.unknown_project(&id, event.seq);
                };
                tracing::debug!(uri = %self.uri, project = %id, seq = event.seq, status = %status, "build status");
                if project.apply_build_status(&status, detail) {
                    self.publish(&project);
                }
            }
            EventKind::RestartResult { success, ports, message } => {
                {
                    // Held while the ports land so `invalidate_ports_since`
                    // sees the result and its ports together.
                    let mut restarts = self.restarts.lock();
                    if let Some(project) = &project {
                        project.apply_restart_result(success, ports.as_ref(), message.clone());
                    }
                    let record = restarts.entry(id.clone()).or_insert(RestartRecord {
                        count: 0,
                        success,
                    });
                    record.count += 1;
                    record.success = success;
                }

                let name = project.as_ref().map_or(id.as_str(), |p| p.name());
                if success {
                    tracing::info!(uri = %self.uri, project = %id, ?ports, "restart succeeded");
                } else {
                    let reason = message.unwrap_or_else(|| "no reason given".to_string());
                    tracing::warn!(uri = %self.uri, project = %id, reason = %reason, "restart failed");
                    self.notifier.notify(
                        true,
                        "Restart failed",
                        &format!("Restarting {} failed: {}", name, reason),
                    );
                }
                match project {
                    Some(project) => self.publish(&project),
                    None => self.bump(),
                }
            }
            EventKind::Deleted => {
                let removed = {
                    let mut projects = self.projects.write();
                    let index = projects.iter().position(|p| p.id() == id);
                    index.map(|i| projects.remove(i))
                };
                self.restarts.lock().remove(&id);
                match removed {
                    Some(project) => {
                        tracing::info!(uri = %self.uri, project = %id, "project deleted");
                        project.mark_deleted();
                        self.notify_linked(&project);
                        let _ = self.updates.send(ProjectUpdate::Deleted { id });
                        self.bump();
                    }
                    None => self.unknown_project(&id, event.seq),
                }
            }
        }
    }

    /// Mark every project disconnected and tell linked servers.
    pub fn connection_lost(&self, reason: &str) {
        self.connected.store(false, Ordering::Release);
        for project in self.all() {
            project.set_connected(false);
            if let Some(server) = self.servers.find_by_project_id(project.id()) {
                server.on_connection_lost(&project.snapshot());
            }
        }
        let _ = self.updates.send(ProjectUpdate::ConnectionLost {
            reason: reason.to_string(),
        });
        self.bump();
    }

    pub fn connection_restored(&self) {
        self.connected.store(true, Ordering::Release);
        for project in self.all() {
            project.set_connected(true);
            if let Some(server) = self.servers.find_by_project_id(project.id()) {
                server.on_connection_restored(&project.snapshot());
            }
        }
        let _ = self.updates.send(ProjectUpdate::ConnectionRestored);
        self.bump();
    }

    /// Unlink every project from the closing session. Projects are not
    /// destroyed; holders keep their `Arc`s.
    pub fn release(&self) {
        for project in self.all() {
            if project.unlink() {
                self.notify_linked(&project);
            }
        }
        self.bump();
    }

    fn publish(&self, project: &Project) {
        let snapshot = self.notify_linked(project);
        let _ = self.updates.send(ProjectUpdate::Changed(snapshot));
        self.bump();
    }

    fn notify_linked(&self, project: &Project) -> ProjectSnapshot {
        let snapshot = project.snapshot();
        if let Some(server) = self.servers.find_by_project_id(project.id()) {
            server.on_state_changed(&snapshot);
        }
        snapshot
    }

    fn unknown_project(&self, id: &str, seq: u64) {
        tracing::debug!(uri = %self.uri, project = %id, seq, "event for unknown project, ignoring");
    }

    fn bump(&self) {
        self.changes.send_modify(|n| *n = n.wrapping_add(1));
    }
}

impl ChannelListener for ProjectList {
    fn on_event(&self, event: Event) {
        self.apply(event);
    }

    fn on_connection_lost(&self, reason: &str) {
        tracing::warn!(uri = %self.uri, reason = %reason, "event channel lost");
        self.connection_lost(reason);
    }

    fn on_connection_restored(&self) {
        tracing::info!(uri = %self.uri, "event channel restored");
        self.connection_restored();
    }
}
