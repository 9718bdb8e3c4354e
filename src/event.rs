//! Push events from the remote server.
//!
//! Wire format is a WebSocket text frame:
//!
//! ```json
//! {"event": "projectRestartResult", "id": 42, "data": {"projectID": "abc", ...}}
//! ```
//!
//! Frames are decoded once into [`Event`]; everything downstream matches on
//! [`EventKind`] exhaustively.

use serde::{Deserialize, Deserializer};

pub const STATUS_CHANGED: &str = "projectStatusChanged";
pub const RESTART_RESULT: &str = "projectRestartResult";
pub const DELETION: &str = "projectDeletion";

/// A decoded push event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Sequence id: the server's `id` when present, otherwise assigned by the
    /// channel in arrival order.
    pub seq: u64,
    pub project_id: String,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    StatusChanged(StatusChange),
    RestartResult {
        success: bool,
        ports: Option<PortInfo>,
        message: Option<String>,
    },
    Deleted,
}

/// Payload of a `projectStatusChanged` event. The server sends either an app
/// status or a build status, never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChange {
    App {
        status: String,
        error: Option<String>,
        ports: Option<PortInfo>,
    },
    Build {
        status: String,
        detail: Option<String>,
    },
    /// Neither recognized field was present.
    Empty,
}

/// `{exposedPort, exposedDebugPort?}` as sent by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortInfo {
    #[serde(default, deserialize_with = "de_port")]
    pub exposed_port: Option<u16>,
    #[serde(default, deserialize_with = "de_port")]
    pub exposed_debug_port: Option<u16>,
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("malformed event frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown event type '{0}'")]
    UnknownType(String),
    #[error("event '{0}' has no projectID")]
    MissingProject(String),
}

impl EventError {
    /// A well-formed frame of a type this client does not handle.
    pub fn is_unknown_type(&self) -> bool {
        matches!(self, Self::UnknownType(_))
    }
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusPayload {
    #[serde(rename = "projectID")]
    project_id: Option<String>,
    app_status: Option<String>,
    app_error_status: Option<String>,
    build_status: Option<String>,
    detailed_build_status: Option<String>,
    ports: Option<PortInfo>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestartPayload {
    #[serde(rename = "projectID")]
    project_id: Option<String>,
    status: Option<String>,
    ports: Option<PortInfo>,
    error_msg: Option<String>,
}

#[derive(Deserialize)]
struct DeletionPayload {
    #[serde(rename = "projectID")]
    project_id: Option<String>,
}

impl Event {
    /// Decode a text frame. `fallback_seq` is used when the frame has no `id`.
    pub fn decode(text: &str, fallback_seq: u64) -> Result<Self, EventError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let seq = envelope.id.unwrap_or(fallback_seq);
        let name = envelope.event;

        let (project_id, kind) = match name.as_str() {
            STATUS_CHANGED => {
                let p: StatusPayload = serde_json::from_value(envelope.data)?;
                let change = if let Some(status) = p.app_status {
                    StatusChange::App {
                        status,
                        error: p.app_error_status.filter(|s| !s.is_empty()),
                        ports: p.ports,
                    }
                } else if let Some(status) = p.build_status {
                    StatusChange::Build {
                        status,
                        detail: p.detailed_build_status.filter(|s| !s.is_empty()),
                    }
                } else {
                    StatusChange::Empty
                };
                (p.project_id, EventKind::StatusChanged(change))
            }
            RESTART_RESULT => {
                let p: RestartPayload = serde_json::from_value(envelope.data)?;
                let success = p.status.as_deref() == Some("success");
                (
                    p.project_id,
                    EventKind::RestartResult {
                        success,
                        ports: p.ports,
                        message: p.error_msg,
                    },
                )
            }
            DELETION => {
                let p: DeletionPayload = serde_json::from_value(envelope.data)?;
                (p.project_id, EventKind::Deleted)
            }
            _ => return Err(EventError::UnknownType(name)),
        };

        let project_id = project_id
            .filter(|id| !id.is_empty())
            .ok_or(EventError::MissingProject(name))?;

        Ok(Self {
            seq,
            project_id,
            kind,
        })
    }
}

/// Accept ports encoded as strings (`"8080"`) or numbers (`8080`). Anything
/// unusable (empty string, `-1`, out of range) decodes as `None`.
pub(crate) fn de_port<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(i64),
        Text(String),
    }

    let raw = Option::<Raw>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Raw::Num(n)) => u16::try_from(n).ok().filter(|p| *p > 0),
        Some(Raw::Text(s)) => s.trim().parse::<u16>().ok().filter(|p| *p > 0),
        None => None,
    })
}
