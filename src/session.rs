//! One live connection to a remote server.
//!
//! A [`Session`] only exists after the full handshake has succeeded: event
//! channel up, version accepted, workspace resolved and the first project
//! list loaded. Any failure along the way closes the channel and surfaces
//! the error to the caller.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::broadcast;

use crate::api::{ApiClient, ENV_PATH, EVENTS_PATH, PROJECTS_PATH};
use crate::channel::{ChannelOptions, ChannelState, EventChannel};
use crate::collab::{LocalServers, NoLocalServers, Notifier, TracingNotifier};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::project::{Project, ProjectList, ProjectUpdate, StartMode};
use crate::uri::ConnectionUri;

/// Servers reporting this version are always accepted.
pub const LATEST_VERSION: &str = "latest";

/// Everything a session needs besides its URI. Cheap to clone.
#[derive(Clone)]
pub struct SessionContext {
    pub api: ApiClient,
    pub servers: Arc<dyn LocalServers>,
    pub notifier: Arc<dyn Notifier>,
    pub first_connect: Duration,
    pub request_timeout: Duration,
    pub min_version: u32,
    pub workspace_override: Option<PathBuf>,
    pub channel: ChannelOptions,
}

impl SessionContext {
    pub fn from_config(
        config: &SyncConfig,
        servers: Arc<dyn LocalServers>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, SyncError> {
        let timeouts = &config.timeouts;
        Ok(Self {
            api: ApiClient::new(timeouts.request())?,
            servers,
            notifier,
            first_connect: timeouts.first_connect(),
            request_timeout: timeouts.request(),
            min_version: config.min_version,
            workspace_override: config.workspace_override(),
            channel: timeouts.channel_options(),
        })
    }

    /// No linked local servers; notifications go to the log.
    pub fn headless(config: &SyncConfig) -> Result<Self, SyncError> {
        Self::from_config(config, Arc::new(NoLocalServers), Arc::new(TracingNotifier))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Environment {
    #[serde(default)]
    version: Option<serde_json::Value>,
    #[serde(default)]
    workspace_location: Option<String>,
}

pub struct Session {
    uri: ConnectionUri,
    api: ApiClient,
    request_timeout: Duration,
    version: String,
    workspace: PathBuf,
    channel: EventChannel,
    projects: Arc<ProjectList>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("uri", &self.uri)
            .field("version", &self.version)
            .field("workspace", &self.workspace)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Run the connection handshake against `uri`.
    pub async fn connect(uri: ConnectionUri, ctx: &SessionContext) -> Result<Arc<Self>, SyncError> {
        let projects = ProjectList::new(uri.clone(), ctx.servers.clone(), ctx.notifier.clone());
        let channel = EventChannel::new(
            uri.ws_url(EVENTS_PATH)?,
            projects.clone(),
            ctx.channel.clone(),
        );
        channel.connect();

        match handshake(&uri, ctx, &channel, &projects).await {
            Ok((version, workspace)) => {
                tracing::info!(
                    uri = %uri,
                    version = %version,
                    workspace = %workspace.display(),
                    projects = projects.len(),
                    "session connected"
                );
                Ok(Arc::new(Self {
                    uri,
                    api: ctx.api.clone(),
                    request_timeout: ctx.request_timeout,
                    version,
                    workspace,
                    channel,
                    projects,
                    closed: AtomicBool::new(false),
                }))
            }
            Err(e) => {
                channel.close();
                tracing::warn!(uri = %uri, error = %e, "session handshake failed");
                Err(e)
            }
        }
    }

    pub fn uri(&self) -> &ConnectionUri {
        &self.uri
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn projects(&self) -> &Arc<ProjectList> {
        &self.projects
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProjectUpdate> {
        self.projects.subscribe()
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Replace the project list with a fresh copy from the server. On
    /// failure the previous list stays in place.
    pub async fn refresh_apps(&self) -> Result<usize, SyncError> {
        self.ensure_open()?;
        match fetch_projects(&self.api, &self.uri, self.request_timeout).await {
            Ok(projects) => {
                let count = projects.len();
                self.projects.replace(projects);
                Ok(count)
            }
            Err(e) => {
                tracing::warn!(uri = %self.uri, error = %e, "project refresh failed, keeping previous list");
                Err(e)
            }
        }
    }

    /// Refresh, then look up `id`. A failed refresh falls back to the list
    /// already held.
    pub async fn project_by_id(&self, id: &str) -> Option<Arc<Project>> {
        if self.is_closed() {
            return None;
        }
        let _ = self.refresh_apps().await;
        self.projects.get(id)
    }

    /// Ask the server to restart a project. Once the server accepts, the
    /// project's ports are invalidated until the restart result reports new
    /// ones. A result that raced ahead of the response keeps its ports.
    pub async fn request_restart(&self, project_id: &str, mode: StartMode) -> Result<(), SyncError> {
        self.ensure_open()?;
        let url = self.uri.join(&format!("{}/{}/restart", PROJECTS_PATH, project_id))?;
        let body = serde_json::json!({ "startMode": mode.as_str() });
        let restarts_before = self.projects.restart_count(project_id);
        self.api
            .post(&url, &[], &body, self.request_timeout)
            .await?
            .error_for_status(&url)?;

        if !self.projects.invalidate_ports_since(project_id, restarts_before) {
            tracing::debug!(uri = %self.uri, project = %project_id, "restart result arrived first, keeping its ports");
        }
        tracing::info!(uri = %self.uri, project = %project_id, mode = mode.as_str(), "restart requested");
        Ok(())
    }

    /// Ask the server to run a build action (usually `"build"`).
    pub async fn request_build(&self, project_id: &str, action: &str) -> Result<(), SyncError> {
        self.ensure_open()?;
        let url = self.uri.join(&format!("{}/{}/build", PROJECTS_PATH, project_id))?;
        let body = serde_json::json!({ "action": action });
        self.api
            .post(&url, &[], &body, self.request_timeout)
            .await?
            .error_for_status(&url)?;

        tracing::info!(uri = %self.uri, project = %project_id, action = %action, "build requested");
        Ok(())
    }

    /// Fetch the current server-side view of one project without touching
    /// the held list.
    pub async fn request_status(&self, project_id: &str) -> Result<Option<Project>, SyncError> {
        self.ensure_open()?;
        let projects = fetch_projects(&self.api, &self.uri, self.request_timeout).await?;
        Ok(projects.into_iter().find(|p| p.id() == project_id))
    }

    pub fn on_connection_lost(&self, reason: &str) {
        self.projects.connection_lost(reason);
    }

    pub fn on_connection_restored(&self) {
        self.projects.connection_restored();
    }

    /// Close the event channel and unlink every project. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.channel.close();
        self.projects.release();
        tracing::info!(uri = %self.uri, "session closed");
    }

    fn ensure_open(&self) -> Result<(), SyncError> {
        if self.is_closed() {
            return Err(SyncError::Closed(self.uri.to_string()));
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.channel.close();
    }
}

async fn handshake(
    uri: &ConnectionUri,
    ctx: &SessionContext,
    channel: &EventChannel,
    projects: &ProjectList,
) -> Result<(String, PathBuf), SyncError> {
    if !channel.block_until_first_connection(ctx.first_connect).await {
        return Err(SyncError::unreachable(
            uri,
            format!("event channel did not connect within {:?}", ctx.first_connect),
        ));
    }

    let url = uri.join(ENV_PATH)?;
    let env: Environment = ctx
        .api
        .get(&url, &[], &[], ctx.request_timeout)
        .await?
        .error_for_status(&url)?
        .json(&url)?;

    let version = env.version.map(version_text);
    check_version(uri, version.as_deref(), ctx.min_version)?;

    let workspace = ctx
        .workspace_override
        .clone()
        .or_else(|| {
            env.workspace_location
                .filter(|w| !w.trim().is_empty())
                .map(PathBuf::from)
        })
        .ok_or_else(|| SyncError::protocol(uri, "server reported no workspaceLocation"))?;

    projects.replace(fetch_projects(&ctx.api, uri, ctx.request_timeout).await?);

    Ok((version.unwrap_or_default(), workspace))
}

async fn fetch_projects(
    api: &ApiClient,
    uri: &ConnectionUri,
    timeout: Duration,
) -> Result<Vec<Project>, SyncError> {
    let url = uri.join(PROJECTS_PATH)?;
    let response = api.get(&url, &[], &[], timeout).await?.error_for_status(&url)?;
    match response.body.as_deref() {
        Some(body) => ProjectList::parse(uri, body),
        None => Err(SyncError::protocol(&url, "empty project list response")),
    }
}

/// Servers send the version as a string or a bare number.
fn version_text(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Accept `"latest"`, otherwise drop the dots and compare numerically.
pub(crate) fn check_version(
    uri: &ConnectionUri,
    version: Option<&str>,
    minimum: u32,
) -> Result<(), SyncError> {
    let incompatible = |version: &str| SyncError::IncompatibleVersion {
        uri: uri.to_string(),
        version: version.to_string(),
        minimum,
    };

    let version = version.map(str::trim).unwrap_or_default();
    if version == LATEST_VERSION {
        return Ok(());
    }
    let numeric: String = version.chars().filter(|c| *c != '.').collect();
    match numeric.parse::<u32>() {
        Ok(n) if n >= minimum => Ok(()),
        _ => Err(incompatible(version)),
    }
}
