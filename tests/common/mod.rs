#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use devsync::channel::ChannelOptions;
use devsync::collab::{NoLocalServers, RecordingNotifier};
use devsync::config::SyncConfig;
use devsync::SessionContext;

/// Two well-formed projects and one malformed entry.
pub fn default_projects() -> Value {
    json!([
        {
            "projectID": "p1",
            "name": "frontend",
            "projectType": "nodejs",
            "locOnDisk": "/workspace/frontend",
            "appStatus": "started",
            "buildStatus": "success",
            "ports": {"exposedPort": "8080", "exposedDebugPort": ""}
        },
        {
            "projectID": "p2",
            "name": "backend",
            "projectType": "java",
            "locOnDisk": "/workspace/backend",
            "contextRoot": "/api",
            "appStatus": "stopped",
            "state": "closed"
        },
        {"projectID": "half-written"}
    ])
}

/// A request the mock received on a POST endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub path: String,
    pub body: Value,
}

struct Inner {
    version: RwLock<Value>,
    workspace: RwLock<Option<String>>,
    projects: RwLock<Value>,
    post_status: RwLock<StatusCode>,
    post_delay: RwLock<Duration>,
    requests: Mutex<Vec<Recorded>>,
    events: broadcast::Sender<String>,
    ws_clients: AtomicUsize,
}

/// State of a fake remote server. Every knob can be changed while running.
#[derive(Clone)]
pub struct MockState {
    inner: Arc<Inner>,
}

impl Default for MockState {
    fn default() -> Self {
        Self::with_version("1905")
    }
}

impl MockState {
    pub fn with_version(version: &str) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                version: RwLock::new(json!(version)),
                workspace: RwLock::new(Some("/home/dev/workspace".to_string())),
                projects: RwLock::new(default_projects()),
                post_status: RwLock::new(StatusCode::ACCEPTED),
                post_delay: RwLock::new(Duration::ZERO),
                requests: Mutex::new(Vec::new()),
                events,
                ws_clients: AtomicUsize::new(0),
            }),
        }
    }

    pub fn set_version(&self, version: Value) {
        *self.inner.version.write() = version;
    }

    pub fn set_workspace(&self, workspace: Option<&str>) {
        *self.inner.workspace.write() = workspace.map(str::to_string);
    }

    pub fn set_projects(&self, projects: Value) {
        *self.inner.projects.write() = projects;
    }

    pub fn set_post_status(&self, status: StatusCode) {
        *self.inner.post_status.write() = status;
    }

    /// Hold every POST response this long after recording the request.
    pub fn set_post_delay(&self, delay: Duration) {
        *self.inner.post_delay.write() = delay;
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.inner.requests.lock().clone()
    }

    pub fn ws_clients(&self) -> usize {
        self.inner.ws_clients.load(Ordering::SeqCst)
    }

    /// Push an event frame to every connected event channel.
    pub fn emit(&self, event: &str, data: Value) {
        let frame = json!({"event": event, "data": data}).to_string();
        let _ = self.inner.events.send(frame);
    }

    /// Push a raw text frame.
    pub fn emit_raw(&self, frame: &str) {
        let _ = self.inner.events.send(frame.to_string());
    }
}

pub struct MockServer {
    pub addr: SocketAddr,
    pub state: MockState,
}

impl MockServer {
    pub async fn start(state: MockState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::serve(listener, state).await
    }

    /// Start on a specific address, e.g. one a client is already retrying.
    pub async fn start_on(addr: SocketAddr, state: MockState) -> Self {
        let listener = TcpListener::bind(addr).await.unwrap();
        Self::serve(listener, state).await
    }

    async fn serve(listener: TcpListener, state: MockState) -> Self {
        let addr = listener.local_addr().unwrap();
        let app = router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        Self { addr, state }
    }

    pub fn uri(&self) -> String {
        format!("http://{}/", self.addr)
    }

    /// Wait until `n` event channels are subscribed, so emitted events are
    /// not lost.
    pub async fn wait_for_ws_clients(&self, n: usize) {
        wait_until("event channel clients", || self.state.ws_clients() == n).await;
    }
}

fn router(state: MockState) -> Router {
    Router::new()
        .route("/api/v1/environment", get(environment))
        .route("/api/v1/projects", get(projects))
        .route("/api/v1/projects/{id}/restart", post(record))
        .route("/api/v1/projects/{id}/build", post(record))
        .route("/api/v1/events", get(events))
        .with_state(state)
}

async fn environment(State(state): State<MockState>) -> Json<Value> {
    let mut env = json!({ "version": state.inner.version.read().clone() });
    if let Some(workspace) = state.inner.workspace.read().clone() {
        env["workspaceLocation"] = json!(workspace);
    }
    Json(env)
}

async fn projects(State(state): State<MockState>) -> Json<Value> {
    Json(state.inner.projects.read().clone())
}

async fn record(
    State(state): State<MockState>,
    Path(id): Path<String>,
    uri: axum::http::Uri,
    Json(body): Json<Value>,
) -> Response {
    state.inner.requests.lock().push(Recorded {
        path: uri.path().to_string(),
        body,
    });
    let delay = *state.inner.post_delay.read();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    let status = *state.inner.post_status.read();
    if status.is_success() {
        (status, Json(json!({ "projectID": id }))).into_response()
    } else {
        (status, "rejected").into_response()
    }
}

async fn events(ws: WebSocketUpgrade, State(state): State<MockState>) -> Response {
    ws.on_upgrade(move |socket| forward_events(socket, state))
}

async fn forward_events(mut socket: WebSocket, state: MockState) {
    let mut rx = state.inner.events.subscribe();
    state.inner.ws_clients.fetch_add(1, Ordering::SeqCst);
    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Ok(text) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    state.inner.ws_clients.fetch_sub(1, Ordering::SeqCst);
}

/// A context with short waits, no workspace override and a recording
/// notifier.
pub fn test_context(notifier: Arc<RecordingNotifier>) -> SessionContext {
    let mut ctx =
        SessionContext::from_config(&SyncConfig::default(), Arc::new(NoLocalServers), notifier)
            .unwrap();
    ctx.first_connect = Duration::from_secs(2);
    ctx.request_timeout = Duration::from_secs(2);
    ctx.workspace_override = None;
    ctx.channel = ChannelOptions {
        backoff_min: Duration::from_millis(50),
        backoff_max: Duration::from_millis(200),
        ping_interval: Duration::from_secs(30),
    };
    ctx
}

/// An address nothing listens on (at the time of the call).
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}
