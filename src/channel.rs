use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reqwest::Url;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::MaybeTlsStream;
use tokio_util::sync::CancellationToken;

use crate::event::Event;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// How often `block_until_first_connection` re-checks the state.
const FIRST_CONNECT_POLL: Duration = Duration::from_millis(100);

/// Receives everything an [`EventChannel`] produces. Calls happen on the
/// channel task in arrival order and must not block.
pub trait ChannelListener: Send + Sync {
    fn on_event(&self, event: Event);

    /// The channel dropped out of `Connected` because of `reason`.
    fn on_connection_lost(&self, reason: &str);

    /// The channel is back after a reported loss.
    fn on_connection_restored(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal. Reached only through [`EventChannel::close`].
    Closed,
}

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub ping_interval: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// A persistent, self-reconnecting WebSocket to a server's event endpoint.
///
/// `connect()` spawns a tokio task that:
/// - Connects to the event URL
/// - Decodes each text frame into an [`Event`] and hands it to the listener
/// - Pings every `ping_interval`
/// - On disconnect, retries with exponential backoff (`backoff_min..backoff_max`)
///   until `close()` is called
pub struct EventChannel {
    url: Url,
    listener: Arc<dyn ChannelListener>,
    options: ChannelOptions,
    state: Arc<watch::Sender<ChannelState>>,
    attempts: Arc<AtomicU64>,
    cancel: CancellationToken,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("url", &self.url.as_str())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl EventChannel {
    pub fn new(url: Url, listener: Arc<dyn ChannelListener>, options: ChannelOptions) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        Self {
            url,
            listener,
            options,
            state: Arc::new(state),
            attempts: Arc::new(AtomicU64::new(0)),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Number of transport connection attempts made so far.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Start the connection task. Calling it again, or after `close()`, does
    /// nothing.
    pub fn connect(&self) {
        let mut task = self.task.lock();
        if task.is_some() || self.cancel.is_cancelled() {
            return;
        }
        set_state(&self.state, ChannelState::Connecting);
        *task = Some(tokio::spawn(connection_loop(
            self.url.clone(),
            self.listener.clone(),
            self.options.clone(),
            self.state.clone(),
            self.attempts.clone(),
            self.cancel.clone(),
        )));
    }

    /// Wait until the channel reaches `Connected`, giving up after `timeout`.
    ///
    /// Only meant for session construction, so a server that never accepts
    /// the channel can be reported to the caller synchronously.
    pub async fn block_until_first_connection(&self, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut poll = tokio::time::interval(FIRST_CONNECT_POLL);

        loop {
            let state = *rx.borrow_and_update();
            match state {
                ChannelState::Connected => return true,
                ChannelState::Closed => return false,
                ChannelState::Disconnected | ChannelState::Connecting => {}
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    return self.state() == ChannelState::Connected;
                }
                _ = rx.changed() => {}
                _ = poll.tick() => {}
            }
        }
    }

    /// Stop the connection task and enter the terminal `Closed` state.
    /// Idempotent.
    pub fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.state.send_replace(ChannelState::Closed);
        self.task.lock().take();
        tracing::debug!(url = %self.url, "event channel closed");
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Decides when a transport error deserves a "connection lost" callback.
///
/// One callback per loss: repeats of the last reported error are swallowed
/// until the error changes or the channel reconnects.
#[derive(Debug, Default)]
pub(crate) struct LossTracker {
    ever_connected: bool,
    reported: bool,
    last_error: Option<String>,
}

impl LossTracker {
    /// Returns true if the listener should hear about `error`.
    pub(crate) fn on_error(&mut self, error: &str) -> bool {
        if !self.ever_connected || self.last_error.as_deref() == Some(error) {
            return false;
        }
        self.last_error = Some(error.to_string());
        self.reported = true;
        true
    }

    /// Returns true if a loss was reported since the last connection.
    pub(crate) fn on_connected(&mut self) -> bool {
        self.ever_connected = true;
        self.last_error = None;
        std::mem::take(&mut self.reported)
    }
}

enum Disconnect {
    /// Peer closed cleanly or the stream ended.
    Closed,
    Error(String),
    Cancelled,
}

fn set_state(state: &watch::Sender<ChannelState>, next: ChannelState) {
    state.send_if_modified(|current| {
        if *current == ChannelState::Closed || *current == next {
            return false;
        }
        *current = next;
        true
    });
}

/// Stable description of a transport error, so repeated refusals compare
/// equal.
fn describe(error: &tungstenite::Error) -> String {
    match error {
        tungstenite::Error::Io(e) => format!("{:?}", e.kind()),
        other => other.to_string(),
    }
}

async fn connection_loop(
    url: Url,
    listener: Arc<dyn ChannelListener>,
    options: ChannelOptions,
    state: Arc<watch::Sender<ChannelState>>,
    attempts: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    let mut backoff = options.backoff_min;
    let mut tracker = LossTracker::default();
    let mut seq = 0u64;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        set_state(&state, ChannelState::Connecting);
        attempts.fetch_add(1, Ordering::Relaxed);

        let connect_result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = tokio_tungstenite::connect_async(url.as_str()) => result,
        };

        match connect_result {
            Ok((ws_stream, _)) => {
                backoff = options.backoff_min;
                set_state(&state, ChannelState::Connected);
                tracing::info!(url = %url, "event channel connected");
                if tracker.on_connected() {
                    listener.on_connection_restored();
                }

                let outcome =
                    run_connection(ws_stream, listener.as_ref(), &cancel, &mut seq, &options).await;

                match outcome {
                    Disconnect::Cancelled => break,
                    Disconnect::Closed => {
                        set_state(&state, ChannelState::Connecting);
                        tracing::warn!(url = %url, "event channel closed by server");
                    }
                    Disconnect::Error(reason) => {
                        set_state(&state, ChannelState::Connecting);
                        tracing::warn!(url = %url, reason = %reason, "event channel dropped");
                        if tracker.on_error(&reason) {
                            listener.on_connection_lost(&reason);
                        }
                    }
                }
            }
            Err(e) => {
                let reason = describe(&e);
                tracing::debug!(url = %url, error = %e, "event channel connect failed");
                if tracker.on_error(&reason) {
                    listener.on_connection_lost(&reason);
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = cancel.cancelled() => break,
        }
        backoff = (backoff * 2).min(options.backoff_max);
    }

    state.send_replace(ChannelState::Closed);
}

async fn run_connection(
    ws_stream: WsStream,
    listener: &dyn ChannelListener,
    cancel: &CancellationToken,
    seq: &mut u64,
    options: &ChannelOptions,
) -> Disconnect {
    let (mut sink, mut stream) = ws_stream.split();
    let mut ping_interval = tokio::time::interval(options.ping_interval);
    ping_interval.tick().await; // Skip the first immediate tick.

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        *seq += 1;
                        match Event::decode(text.as_str(), *seq) {
                            Ok(event) => listener.on_event(event),
                            // The server sends many event types we have no use for.
                            Err(e) if e.is_unknown_type() => {
                                tracing::debug!(error = %e, "ignoring event");
                            }
                            Err(e) => tracing::warn!(error = %e, "dropping undecodable event"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sink.send(Message::Pong(data)).await {
                            return Disconnect::Error(describe(&e));
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Disconnect::Closed,
                    Some(Ok(_)) => {} // Pong and binary frames carry nothing for us.
                    Some(Err(e)) => return Disconnect::Error(describe(&e)),
                }
            }
            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                    return Disconnect::Error(describe(&e));
                }
            }
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return Disconnect::Cancelled;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use std::net::SocketAddr;
    use tokio::time::timeout;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Event>>,
        lost: Mutex<Vec<String>>,
        restored: AtomicU64,
    }

    impl ChannelListener for Recorder {
        fn on_event(&self, event: Event) {
            self.events.lock().push(event);
        }
        fn on_connection_lost(&self, reason: &str) {
            self.lost.lock().push(reason.to_string());
        }
        fn on_connection_restored(&self) {
            self.restored.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast() -> ChannelOptions {
        ChannelOptions {
            backoff_min: Duration::from_millis(20),
            backoff_max: Duration::from_millis(20),
            ping_interval: Duration::from_secs(30),
        }
    }

    fn ws_url(addr: SocketAddr) -> Url {
        Url::parse(&format!("ws://{}/api/v1/events", addr)).unwrap()
    }

    /// Accepts WebSocket connections and sends `frames` to each one.
    async fn spawn_ws_server(frames: Vec<String>) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let frames = frames.clone();
                tokio::spawn(async move {
                    if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                        let (mut tx, mut rx) = ws.split();
                        for frame in frames {
                            let _ = tx.send(Message::Text(frame.into())).await;
                        }
                        while rx.next().await.is_some() {}
                    }
                });
            }
        });
        addr
    }

    async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
    }

    #[test]
    fn loss_tracker_suppresses_identical_errors() {
        let mut t = LossTracker::default();
        t.on_connected();
        assert!(t.on_error("ConnectionRefused"));
        assert!(!t.on_error("ConnectionRefused"));
        assert!(!t.on_error("ConnectionRefused"));
        assert!(t.on_connected());
    }

    #[test]
    fn loss_tracker_reports_a_differing_error() {
        let mut t = LossTracker::default();
        t.on_connected();
        assert!(t.on_error("ConnectionReset"));
        assert!(t.on_error("ConnectionRefused"));
        assert!(!t.on_error("ConnectionRefused"));
    }

    #[test]
    fn loss_tracker_ignores_errors_before_first_connection() {
        let mut t = LossTracker::default();
        assert!(!t.on_error("ConnectionRefused"));
        assert!(!t.on_connected());
    }

    #[test]
    fn loss_tracker_rearms_after_reconnect() {
        let mut t = LossTracker::default();
        t.on_connected();
        assert!(t.on_error("ConnectionRefused"));
        assert!(t.on_connected());
        assert!(!t.on_connected());
        assert!(t.on_error("ConnectionRefused"));
    }

    #[tokio::test]
    async fn connects_and_dispatches_events() {
        let addr = spawn_ws_server(vec![
            r#"{"event":"projectDeletion","data":{"projectID":"p1"}}"#.to_string(),
            "garbage".to_string(),
            r#"{"event":"projectStatusChanged","id":99,"data":{"projectID":"p2","appStatus":"started"}}"#.to_string(),
        ])
        .await;

        let recorder = Arc::new(Recorder::default());
        let channel = EventChannel::new(ws_url(addr), recorder.clone(), fast());
        channel.connect();
        assert!(channel.block_until_first_connection(Duration::from_secs(5)).await);
        assert_eq!(channel.state(), ChannelState::Connected);

        wait_until("two events", || recorder.events.lock().len() == 2).await;
        let events = recorder.events.lock().clone();
        assert_eq!(events[0].project_id, "p1");
        assert_eq!(events[0].kind, EventKind::Deleted);
        assert_eq!(events[1].seq, 99);
        assert!(recorder.lost.lock().is_empty());

        channel.close();
    }

    #[tokio::test]
    async fn first_connection_times_out_against_dead_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let recorder = Arc::new(Recorder::default());
        let channel = EventChannel::new(ws_url(addr), recorder.clone(), fast());
        channel.connect();
        assert!(!channel.block_until_first_connection(Duration::from_millis(300)).await);
        channel.close();
        assert_eq!(channel.state(), ChannelState::Closed);
        // Never connected, so nothing was "lost".
        assert!(recorder.lost.lock().is_empty());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_terminal() {
        let addr = spawn_ws_server(Vec::new()).await;
        let channel = EventChannel::new(ws_url(addr), Arc::new(Recorder::default()), fast());
        channel.connect();
        assert!(channel.block_until_first_connection(Duration::from_secs(5)).await);

        channel.close();
        channel.close();
        assert_eq!(channel.state(), ChannelState::Closed);

        // No way back out of Closed.
        channel.connect();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(!channel.block_until_first_connection(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn repeated_refusals_report_one_loss_then_restore() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Accept one connection, stop listening, then drop the socket.
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(listener);
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(ws);
        });

        let recorder = Arc::new(Recorder::default());
        let channel = EventChannel::new(ws_url(addr), recorder.clone(), fast());
        channel.connect();
        assert!(channel.block_until_first_connection(Duration::from_secs(5)).await);
        server.await.unwrap();

        // Several refused reconnect attempts.
        let connected_attempts = channel.attempts();
        wait_until("three refused attempts", || {
            channel.attempts() >= connected_attempts + 3
        })
        .await;
        assert_eq!(recorder.lost.lock().len(), 1);
        assert_eq!(channel.state(), ChannelState::Connecting);

        // Bring the server back on the same port.
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    let (_, mut rx) = ws.split();
                    while rx.next().await.is_some() {}
                }
            }
        });
        wait_until("restored", || recorder.restored.load(Ordering::SeqCst) == 1).await;
        assert_eq!(recorder.lost.lock().len(), 1);
        assert_eq!(channel.state(), ChannelState::Connected);

        channel.close();
    }
}
