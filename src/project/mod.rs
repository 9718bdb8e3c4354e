//! Per-project state machine.
//!
//! A [`Project`] carries immutable identity (id, name, type, paths) plus a
//! single `parking_lot::RwLock<ProjectState>` holding everything events can
//! change. Ports and states share that lock, so a reader never sees a new
//! HTTP port next to a stale debug port.

pub mod list;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::event::PortInfo;
use crate::uri::ConnectionUri;

pub use list::{ProjectList, ProjectUpdate, RestartRecord};

/// Lifecycle phase reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Unknown,
    Starting,
    Started,
    Stopping,
    Stopped,
}

impl RunState {
    /// Map a remote `appStatus` string. Unrecognized values are logged and
    /// become `Unknown`.
    pub fn from_remote(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "starting" => Self::Starting,
            "started" => Self::Started,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            "unknown" | "" => Self::Unknown,
            other => {
                tracing::warn!(status = %other, "unrecognized app status, treating as unknown");
                Self::Unknown
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

/// Build sub-status, tracked independently of [`RunState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Queued,
    InProgress,
    Success,
    Failed,
    Unknown,
}

impl BuildState {
    pub fn from_remote(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "queued" => Self::Queued,
            "inprogress" | "in-progress" | "in_progress" => Self::InProgress,
            "success" => Self::Success,
            "failed" => Self::Failed,
            "unknown" | "" => Self::Unknown,
            other => {
                tracing::warn!(status = %other, "unrecognized build status, treating as unknown");
                Self::Unknown
            }
        }
    }

    pub fn is_building(self) -> bool {
        matches!(self, Self::Queued | Self::InProgress)
    }
}

/// How the server should (re)start a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StartMode {
    Run,
    Debug,
    DebugNoInit,
}

impl StartMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Debug => "debug",
            Self::DebugNoInit => "debugNoInit",
        }
    }

    pub fn is_debug(self) -> bool {
        matches!(self, Self::Debug | Self::DebugNoInit)
    }
}

impl std::str::FromStr for StartMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run" => Ok(Self::Run),
            "debug" => Ok(Self::Debug),
            "debugNoInit" | "debug-no-init" => Ok(Self::DebugNoInit),
            other => Err(format!("unknown start mode '{}'", other)),
        }
    }
}

/// HTTP and debug ports, read and written together. `None` means unbound
/// (the server's `-1`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Ports {
    pub http: Option<u16>,
    pub debug: Option<u16>,
}

/// Mutable part of a project.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ProjectState {
    run: RunState,
    build: BuildState,
    build_detail: Option<String>,
    ports: Ports,
    error: Option<String>,
    enabled: bool,
    deleted: bool,
    connected: bool,
    linked: bool,
    annotation: Option<String>,
}

impl ProjectState {
    /// Drop the old annotation, then derive a fresh one from the current
    /// fields so a stale reason never outlives the state that caused it.
    fn refresh_annotation(&mut self) {
        self.annotation = None;
        self.annotation = if !self.connected {
            Some("disconnected".to_string())
        } else if self.deleted {
            Some("deleted".to_string())
        } else if !self.enabled {
            Some("disabled".to_string())
        } else {
            match self.build {
                BuildState::Queued => Some("build queued".to_string()),
                BuildState::InProgress => Some(with_detail("building", &self.build_detail)),
                BuildState::Failed => Some(with_detail("build failed", &self.build_detail)),
                BuildState::Success | BuildState::Unknown => self.error.clone(),
            }
        };
    }
}

fn with_detail(label: &str, detail: &Option<String>) -> String {
    match detail {
        Some(d) => format!("{} - {}", label, d),
        None => label.to_string(),
    }
}

/// Point-in-time copy of a project, safe to hand to UI or logging code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectSnapshot {
    pub id: String,
    pub name: String,
    pub run_state: RunState,
    pub build_state: BuildState,
    pub build_detail: Option<String>,
    pub ports: Ports,
    pub enabled: bool,
    pub deleted: bool,
    pub linked: bool,
    pub annotation: Option<String>,
}

/// One entry of the server's project list, as sent by `GET api/v1/projects`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawProject {
    #[serde(rename = "projectID")]
    project_id: String,
    name: String,
    project_type: String,
    loc_on_disk: String,
    #[serde(default, alias = "contextroot")]
    context_root: Option<String>,
    #[serde(default)]
    app_status: Option<String>,
    #[serde(default)]
    app_error_status: Option<String>,
    #[serde(default)]
    build_status: Option<String>,
    #[serde(default)]
    detailed_build_status: Option<String>,
    /// `"open"` or `"closed"`; closed projects are disabled.
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    ports: Option<PortInfo>,
    #[serde(default)]
    logs: Option<serde_json::Value>,
}

/// A single application managed by a remote server.
#[derive(Debug)]
pub struct Project {
    id: String,
    name: String,
    project_type: String,
    loc_on_disk: String,
    context_root: Option<String>,
    logs: Option<serde_json::Value>,
    /// Owning session, by key.
    session: ConnectionUri,
    state: RwLock<ProjectState>,
}

impl Project {
    /// Build a project from one element of the project-list JSON array.
    pub fn from_json(
        session: &ConnectionUri,
        value: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        let raw: RawProject = serde_json::from_value(value)?;
        Ok(Self::from_raw(session, raw))
    }

    pub(crate) fn from_raw(session: &ConnectionUri, raw: RawProject) -> Self {
        let ports = raw.ports.unwrap_or_default();
        let mut state = ProjectState {
            run: raw
                .app_status
                .as_deref()
                .map_or(RunState::Unknown, RunState::from_remote),
            build: raw
                .build_status
                .as_deref()
                .map_or(BuildState::Unknown, BuildState::from_remote),
            build_detail: raw.detailed_build_status.filter(|s| !s.is_empty()),
            ports: Ports {
                http: ports.exposed_port,
                debug: ports.exposed_debug_port,
            },
            error: raw.app_error_status.filter(|s| !s.is_empty()),
            enabled: raw.state.as_deref() != Some("closed"),
            deleted: false,
            connected: true,
            linked: true,
            annotation: None,
        };
        state.refresh_annotation();

        Self {
            id: raw.project_id,
            name: raw.name,
            project_type: raw.project_type,
            loc_on_disk: raw.loc_on_disk,
            context_root: raw.context_root.filter(|s| !s.is_empty()),
            logs: raw.logs,
            session: session.clone(),
            state: RwLock::new(state),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn project_type(&self) -> &str {
        &self.project_type
    }

    pub fn loc_on_disk(&self) -> &str {
        &self.loc_on_disk
    }

    pub fn context_root(&self) -> Option<&str> {
        self.context_root.as_deref()
    }

    /// Raw log descriptors as reported by the server, for the log viewer.
    pub fn logs(&self) -> Option<&serde_json::Value> {
        self.logs.as_ref()
    }

    pub fn session_uri(&self) -> &ConnectionUri {
        &self.session
    }

    pub fn run_state(&self) -> RunState {
        self.state.read().run
    }

    pub fn build_state(&self) -> BuildState {
        self.state.read().build
    }

    pub fn ports(&self) -> Ports {
        self.state.read().ports
    }

    pub fn http_port(&self) -> Option<u16> {
        self.state.read().ports.http
    }

    pub fn debug_port(&self) -> Option<u16> {
        self.state.read().ports.debug
    }

    pub fn annotation(&self) -> Option<String> {
        self.state.read().annotation.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.state.read().enabled
    }

    pub fn is_deleted(&self) -> bool {
        self.state.read().deleted
    }

    /// False once the owning session has been closed.
    pub fn is_linked(&self) -> bool {
        self.state.read().linked
    }

    pub fn snapshot(&self) -> ProjectSnapshot {
        let state = self.state.read();
        ProjectSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            run_state: state.run,
            build_state: state.build,
            build_detail: state.build_detail.clone(),
            ports: state.ports,
            enabled: state.enabled,
            deleted: state.deleted,
            linked: state.linked,
            annotation: state.annotation.clone(),
        }
    }

    // ── Port mutators ──────────────────────────────────────────────

    pub fn set_http_port(&self, port: Option<u16>) {
        self.state.write().ports.http = port;
    }

    pub fn set_debug_port(&self, port: Option<u16>) {
        self.state.write().ports.debug = port;
    }

    /// Set both ports in one critical section.
    pub fn set_ports(&self, ports: Ports) {
        self.state.write().ports = ports;
    }

    /// Forget both ports. Called whenever a restart is requested.
    pub fn invalidate_ports(&self) {
        self.state.write().ports = Ports::default();
    }

    // ── State transitions ──────────────────────────────────────────

    /// Apply a remote app status. Returns true if anything visible changed.
    pub fn apply_app_status(&self, status: &str, error: Option<String>) -> bool {
        let run = RunState::from_remote(status);
        self.mutate(|s| {
            s.run = run;
            s.error = error;
        })
    }

    /// Apply a remote build status and optional detail.
    pub fn apply_build_status(&self, status: &str, detail: Option<String>) -> bool {
        let build = BuildState::from_remote(status);
        self.mutate(|s| {
            s.build = build;
            s.build_detail = detail;
        })
    }

    /// Record the outcome of a restart.
    pub fn apply_restart_result(
        &self,
        success: bool,
        ports: Option<&PortInfo>,
        message: Option<String>,
    ) -> bool {
        self.mutate(|s| {
            if success {
                let ports = ports.cloned().unwrap_or_default();
                s.ports = Ports {
                    http: ports.exposed_port,
                    debug: ports.exposed_debug_port,
                };
                s.error = None;
            } else {
                s.ports = Ports::default();
                s.error = Some(message.unwrap_or_else(|| "restart failed".to_string()));
            }
        })
    }

    pub fn set_connected(&self, connected: bool) -> bool {
        self.mutate(|s| s.connected = connected)
    }

    /// The server deleted the project. Ports and state no longer mean anything.
    pub fn mark_deleted(&self) -> bool {
        self.mutate(|s| {
            s.deleted = true;
            s.run = RunState::Unknown;
            s.ports = Ports::default();
        })
    }

    /// Detach from the owning session. The project itself lives on for as
    /// long as someone holds it.
    pub fn unlink(&self) -> bool {
        self.mutate(|s| {
            s.linked = false;
            s.run = RunState::Unknown;
            s.ports = Ports::default();
        })
    }

    fn mutate(&self, f: impl FnOnce(&mut ProjectState)) -> bool {
        let mut state = self.state.write();
        let before = state.clone();
        f(&mut state);
        state.refresh_annotation();
        *state != before
    }
}
