//! Registry persistence and the background reconnection loop.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{dead_addr, test_context, wait_until, MockServer, MockState};
use devsync::collab::RecordingNotifier;
use devsync::store::{FileSessionStore, MemorySessionStore, SessionStore};
use devsync::supervisor::{RetryPolicy, SupervisorStatus};
use devsync::{ConnectionUri, ProjectUpdate, ReconnectOutcome, SessionRegistry, SyncError};

fn registry(store: Arc<dyn SessionStore>, notifier: Arc<RecordingNotifier>) -> SessionRegistry {
    let mut ctx = test_context(notifier);
    ctx.first_connect = Duration::from_millis(300);
    SessionRegistry::new(ctx, store, RetryPolicy::new(Duration::from_millis(50), 100))
}

#[tokio::test]
async fn add_persists_and_duplicates_are_rejected() {
    let server = MockServer::start(MockState::default()).await;
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileSessionStore::new(dir.path().join("sessions")));
    let registry = registry(store.clone(), Arc::new(RecordingNotifier::new()));

    let session = registry.add(&server.uri()).await.unwrap();
    assert_eq!(store.load().unwrap(), vec![server.uri()]);

    // Same server, spelled without the trailing slash.
    let err = registry
        .add(server.uri().trim_end_matches('/'))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::DuplicateSession(_)));
    assert_eq!(registry.sessions().len(), 1);

    assert!(registry.remove(session.uri()));
    assert!(session.is_closed());
    assert!(store.load().unwrap().is_empty());
}

#[tokio::test]
async fn load_sorts_servers_into_live_waiting_and_failed() {
    let good = MockServer::start(MockState::default()).await;
    let old = MockServer::start(MockState::with_version("1700")).await;
    let dead = format!("http://{}/", dead_addr().await);

    let store = Arc::new(MemorySessionStore::with_uris([
        good.uri(),
        old.uri(),
        dead.clone(),
    ]));
    let notifier = Arc::new(RecordingNotifier::new());
    let registry = registry(store.clone(), notifier.clone());

    assert_eq!(registry.load().await.unwrap(), 1);
    assert_eq!(registry.sessions().len(), 1);
    assert_eq!(registry.sessions()[0].uri().as_str(), good.uri());

    let broken = registry.broken();
    assert_eq!(broken.len(), 2);
    let old_entry = broken.iter().find(|b| b.uri.as_str() == old.uri()).unwrap();
    assert!(matches!(
        old_entry.status,
        SupervisorStatus::Failed(SyncError::IncompatibleVersion { .. })
    ));
    let dead_entry = broken.iter().find(|b| b.uri.as_str() == dead).unwrap();
    assert_eq!(dead_entry.status, SupervisorStatus::Waiting);

    // Only the fatal failure reaches the user.
    let errors = notifier.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message.contains("1700"));

    // Loading does not rewrite the stored list.
    assert_eq!(store.uris().len(), 3);

    registry.shutdown().await;
}

#[tokio::test]
async fn supervisor_reconnects_when_server_comes_up() {
    let addr = dead_addr().await;
    let uri = ConnectionUri::parse(&format!("http://{}", addr)).unwrap();
    let store = Arc::new(MemorySessionStore::with_uris([uri.to_string()]));
    let registry = registry(store, Arc::new(RecordingNotifier::new()));

    assert_eq!(registry.load().await.unwrap(), 0);
    assert_eq!(registry.broken().len(), 1);

    let server = MockServer::start_on(addr, MockState::default()).await;

    let cancel = CancellationToken::new();
    let session = match registry
        .wait_for_reconnect(&uri, Duration::from_secs(10), &cancel)
        .await
    {
        ReconnectOutcome::Connected(session) => session,
        other => panic!("unexpected outcome: {:?}", other),
    };
    assert_eq!(session.projects().len(), 2);
    assert!(registry.broken().is_empty());
    assert!(registry.get(&uri).is_some());
    server.wait_for_ws_clients(1).await;

    registry.shutdown().await;
    assert!(session.is_closed());
}

#[tokio::test]
async fn supervisor_stops_on_fatal_error_and_notifies_once() {
    let addr = dead_addr().await;
    let uri = ConnectionUri::parse(&format!("http://{}", addr)).unwrap();
    let notifier = Arc::new(RecordingNotifier::new());
    let registry = registry(
        Arc::new(MemorySessionStore::with_uris([uri.to_string()])),
        notifier.clone(),
    );
    registry.load().await.unwrap();
    assert!(notifier.errors().is_empty());

    // The server comes back, but too old to talk to.
    let _server = MockServer::start_on(addr, MockState::with_version("1700")).await;

    let outcome = registry
        .wait_for_reconnect(&uri, Duration::from_secs(10), &CancellationToken::new())
        .await;
    assert!(matches!(
        outcome,
        ReconnectOutcome::Failed(SyncError::IncompatibleVersion { .. })
    ));

    let attempts = registry.broken()[0].attempts;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(registry.broken()[0].attempts, attempts);
    assert_eq!(notifier.errors().len(), 1);

    registry.shutdown().await;
}

#[tokio::test]
async fn supervisor_gives_up_on_server_that_stays_down() {
    let addr = dead_addr().await;
    let uri = ConnectionUri::parse(&format!("http://{}", addr)).unwrap();
    let store = Arc::new(MemorySessionStore::with_uris([uri.to_string()]));
    let notifier = Arc::new(RecordingNotifier::new());
    let mut ctx = test_context(notifier.clone());
    ctx.first_connect = Duration::from_millis(100);
    let registry = SessionRegistry::new(
        ctx,
        store.clone(),
        RetryPolicy::new(Duration::from_millis(20), 3),
    );
    registry.load().await.unwrap();

    let outcome = registry
        .wait_for_reconnect(&uri, Duration::from_secs(10), &CancellationToken::new())
        .await;
    assert!(matches!(
        outcome,
        ReconnectOutcome::Failed(SyncError::Unreachable { .. })
    ));

    let broken = registry.broken();
    assert_eq!(broken[0].attempts, 3);
    assert!(matches!(broken[0].status, SupervisorStatus::Failed(_)));
    let errors = notifier.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message.contains("after 3 attempts"));

    // Still saved, so the next start tries again.
    assert_eq!(store.uris(), vec![uri.to_string()]);

    registry.shutdown().await;
}

#[tokio::test]
async fn explicit_add_takes_over_from_supervisor() {
    let addr = dead_addr().await;
    let uri = ConnectionUri::parse(&format!("http://{}", addr)).unwrap();
    let store = Arc::new(MemorySessionStore::with_uris([uri.to_string()]));
    let mut ctx = test_context(Arc::new(RecordingNotifier::new()));
    ctx.first_connect = Duration::from_millis(300);
    // Long delay so the supervisor cannot win the race.
    let registry = SessionRegistry::new(
        ctx,
        store.clone(),
        RetryPolicy::new(Duration::from_secs(3600), 1),
    );
    registry.load().await.unwrap();

    let _server = MockServer::start_on(addr, MockState::default()).await;
    let session = registry.add(uri.as_str()).await.unwrap();

    assert!(registry.broken().is_empty());
    assert_eq!(registry.sessions().len(), 1);
    assert_eq!(store.uris(), vec![uri.to_string()]);

    session.close();
    registry.shutdown().await;
}

#[tokio::test]
async fn session_forwards_connection_loss_to_projects() {
    let server = MockServer::start(MockState::default()).await;
    let registry = registry(
        Arc::new(MemorySessionStore::new()),
        Arc::new(RecordingNotifier::new()),
    );
    let session = registry.add(&server.uri()).await.unwrap();
    let mut updates = session.subscribe();

    session.on_connection_lost("connection reset");
    let p1 = session.projects().get("p1").unwrap();
    assert_eq!(p1.annotation().as_deref(), Some("disconnected"));
    session.on_connection_restored();
    assert_eq!(p1.annotation(), None);

    let mut lost = 0;
    let mut restored = 0;
    while let Ok(update) = updates.try_recv() {
        match update {
            ProjectUpdate::ConnectionLost { reason } => {
                assert_eq!(reason, "connection reset");
                lost += 1;
            }
            ProjectUpdate::ConnectionRestored => restored += 1,
            _ => {}
        }
    }
    assert_eq!((lost, restored), (1, 1));

    registry.shutdown().await;
    wait_until("event channel closed", || server.state.ws_clients() == 0).await;
}
