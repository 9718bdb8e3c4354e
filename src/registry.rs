//! The set of servers the user is connected to.
//!
//! Live sessions are keyed by normalized URI, at most one per URI. URIs that
//! could not be reached are kept as broken sessions, each with its own
//! [`Supervisor`] retrying in the background. Both sets are persisted
//! together through a [`SessionStore`], along with any stored lines that
//! are not valid URIs, so nothing the user saved is lost silently.
//!
//! Lock order: `broken` before `live`.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;
use crate::session::{Session, SessionContext};
use crate::store::{SessionStore, StoreError};
use crate::supervisor::{RetryPolicy, Supervisor, SupervisorStatus};
use crate::uri::ConnectionUri;

/// Result of [`SessionRegistry::wait_for_reconnect`].
#[derive(Debug)]
pub enum ReconnectOutcome {
    Connected(Arc<Session>),
    TimedOut,
    Cancelled,
    Failed(SyncError),
}

/// A URI that is not connected yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokenSession {
    pub uri: ConnectionUri,
    pub attempts: u32,
    pub status: SupervisorStatus,
}

/// Shared handle to the registry. Cloning is cheap.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: SessionContext,
    store: Arc<dyn SessionStore>,
    retry: RetryPolicy,
    live: RwLock<HashMap<ConnectionUri, Arc<Session>>>,
    broken: Mutex<HashMap<ConnectionUri, Supervisor>>,
    /// Stored lines that failed to parse, kept verbatim.
    invalid: Mutex<BTreeSet<String>>,
}

/// Who is registering a freshly connected session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// `add` or `load`.
    Caller,
    /// A supervisor attempt. Only lands while the URI is still broken and
    /// its supervisor has not been cancelled.
    Supervisor,
}

impl Inner {
    /// Register a connected session. Returns the supervisor that was
    /// retrying this URI, if any, so the caller can decide whether to stop it.
    fn insert_live(
        &self,
        session: Arc<Session>,
        origin: Origin,
    ) -> Result<Option<Supervisor>, SyncError> {
        let uri = session.uri().clone();
        let mut broken = self.broken.lock();
        if origin == Origin::Supervisor
            && !broken.get(&uri).is_some_and(|s| !s.is_cancelled())
        {
            drop(broken);
            tracing::debug!(uri = %uri, "server was removed while reconnecting, dropping session");
            session.close();
            return Err(SyncError::Cancelled);
        }

        let mut live = self.live.write();
        if live.contains_key(&uri) {
            drop(live);
            drop(broken);
            session.close();
            return Err(SyncError::DuplicateSession(uri.to_string()));
        }
        live.insert(uri.clone(), session);
        Ok(broken.remove(&uri))
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let broken = self.inner.broken.lock().len();
        let live = self.inner.live.read().len();
        f.debug_struct("SessionRegistry")
            .field("live", &live)
            .field("broken", &broken)
            .finish()
    }
}

impl SessionRegistry {
    pub fn new(ctx: SessionContext, store: Arc<dyn SessionStore>, retry: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                store,
                retry,
                live: RwLock::new(HashMap::new()),
                broken: Mutex::new(HashMap::new()),
                invalid: Mutex::new(BTreeSet::new()),
            }),
        }
    }

    /// Connect to every persisted URI. Unreachable servers are handed to a
    /// supervisor; servers that fail for any other reason, and stored lines
    /// that are not URIs at all, are reported once and kept. Returns how
    /// many connected right away.
    pub async fn load(&self) -> Result<usize, StoreError> {
        let stored = self.inner.store.load()?;
        let uris: Vec<ConnectionUri> = stored
            .iter()
            .filter_map(|raw| match ConnectionUri::parse(raw) {
                Ok(uri) => Some(uri),
                Err(e) => {
                    if self.inner.invalid.lock().insert(raw.clone()) {
                        tracing::warn!(uri = %raw, error = %e, "invalid stored server");
                        self.inner
                            .ctx
                            .notifier
                            .notify(true, "Invalid saved server", &e.to_string());
                    }
                    None
                }
            })
            .collect();

        tracing::info!(count = uris.len(), "restoring sessions");
        let results = futures::future::join_all(uris.into_iter().map(|uri| self.restore(uri))).await;
        Ok(results.into_iter().filter(|connected| *connected).count())
    }

    async fn restore(&self, uri: ConnectionUri) -> bool {
        if self.contains(&uri) {
            return false;
        }
        match Session::connect(uri.clone(), &self.inner.ctx).await {
            Ok(session) => self.inner.insert_live(session, Origin::Caller).is_ok(),
            Err(e) if e.is_retryable() => {
                tracing::info!(uri = %uri, error = %e, "server unreachable, will keep trying");
                self.supervise(uri);
                false
            }
            Err(e) => {
                tracing::warn!(uri = %uri, error = %e, "cannot restore session");
                self.inner
                    .ctx
                    .notifier
                    .notify(true, "Cannot connect", &e.to_string());
                self.inner
                    .broken
                    .lock()
                    .insert(uri.clone(), Supervisor::failed(uri, e));
                false
            }
        }
    }

    fn supervise(&self, uri: ConnectionUri) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        // Held across the spawn so the first attempt cannot finish before
        // its supervisor is registered.
        let mut broken = self.inner.broken.lock();
        let supervisor = Supervisor::spawn(
            uri.clone(),
            self.inner.retry,
            self.inner.ctx.notifier.clone(),
            move |uri| {
                let weak = weak.clone();
                async move {
                    let inner = weak.upgrade().ok_or(SyncError::Cancelled)?;
                    let session = Session::connect(uri, &inner.ctx).await?;
                    inner.insert_live(session, Origin::Supervisor).map(|_| ())
                }
            },
        );
        if let Some(previous) = broken.insert(uri, supervisor) {
            previous.cancel();
        }
    }

    /// Connect to a new server and remember it.
    ///
    /// Fails with `DuplicateSession` if the URI is already live. Connection
    /// failures are returned as-is and nothing is recorded.
    pub async fn add(&self, raw: &str) -> Result<Arc<Session>, SyncError> {
        let uri = ConnectionUri::parse(raw)?;
        if self.inner.live.read().contains_key(&uri) {
            return Err(SyncError::DuplicateSession(uri.to_string()));
        }

        let session = Session::connect(uri, &self.inner.ctx).await?;
        if let Some(supervisor) = self.inner.insert_live(session.clone(), Origin::Caller)? {
            supervisor.cancel();
        }
        self.persist();
        Ok(session)
    }

    /// Close and forget a server, live or broken.
    pub fn remove(&self, uri: &ConnectionUri) -> bool {
        let (supervisor, session) = {
            let mut broken = self.inner.broken.lock();
            let supervisor = broken.remove(uri);
            // Cancel under the lock so an attempt finishing right now cannot
            // register the session afterwards.
            if let Some(supervisor) = &supervisor {
                supervisor.cancel();
            }
            let session = self.inner.live.write().remove(uri);
            (supervisor, session)
        };
        let found = session.is_some() || supervisor.is_some();

        if let Some(session) = session {
            session.close();
        }
        if found {
            tracing::info!(uri = %uri, "server removed");
            self.persist();
        }
        found
    }

    pub fn get(&self, uri: &ConnectionUri) -> Option<Arc<Session>> {
        self.inner.live.read().get(uri).cloned()
    }

    pub fn contains(&self, uri: &ConnectionUri) -> bool {
        if self.inner.broken.lock().contains_key(uri) {
            return true;
        }
        self.inner.live.read().contains_key(uri)
    }

    /// Stored lines that are not valid server URIs.
    pub fn invalid(&self) -> Vec<String> {
        self.inner.invalid.lock().iter().cloned().collect()
    }

    /// Drop an invalid stored line for good.
    pub fn remove_invalid(&self, raw: &str) -> bool {
        let found = self.inner.invalid.lock().remove(raw);
        if found {
            tracing::info!(uri = %raw, "invalid server entry removed");
            self.persist();
        }
        found
    }

    /// Live sessions, ordered by URI.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self.inner.live.read().values().cloned().collect();
        sessions.sort_by(|a, b| a.uri().cmp(b.uri()));
        sessions
    }

    /// Broken sessions, ordered by URI.
    pub fn broken(&self) -> Vec<BrokenSession> {
        let mut broken: Vec<_> = self
            .inner
            .broken
            .lock()
            .values()
            .map(|s| BrokenSession {
                uri: s.uri().clone(),
                attempts: s.attempts(),
                status: s.status(),
            })
            .collect();
        broken.sort_by(|a, b| a.uri.cmp(&b.uri));
        broken
    }

    /// Wait for a broken URI to come back.
    pub async fn wait_for_reconnect(
        &self,
        uri: &ConnectionUri,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ReconnectOutcome {
        if let Some(session) = self.get(uri) {
            return ReconnectOutcome::Connected(session);
        }
        let watched = self.inner.broken.lock().get(uri).map(Supervisor::watch);
        let Some(mut status) = watched else {
            // Raced with a successful reconnect, or never known.
            return match self.get(uri) {
                Some(session) => ReconnectOutcome::Connected(session),
                None => ReconnectOutcome::Failed(SyncError::Closed(uri.to_string())),
            };
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = status.borrow_and_update().clone();
            match current {
                SupervisorStatus::Waiting => {}
                SupervisorStatus::Connected => {
                    return match self.get(uri) {
                        Some(session) => ReconnectOutcome::Connected(session),
                        None => ReconnectOutcome::Failed(SyncError::Closed(uri.to_string())),
                    };
                }
                SupervisorStatus::Cancelled => return ReconnectOutcome::Cancelled,
                SupervisorStatus::Failed(e) => return ReconnectOutcome::Failed(e),
            }

            tokio::select! {
                _ = cancel.cancelled() => return ReconnectOutcome::Cancelled,
                _ = tokio::time::sleep_until(deadline) => return ReconnectOutcome::TimedOut,
                changed = status.changed() => {
                    if changed.is_err() && *status.borrow() == SupervisorStatus::Waiting {
                        return ReconnectOutcome::Failed(SyncError::Closed(uri.to_string()));
                    }
                }
            }
        }
    }

    /// Stop every supervisor and close every session. The stored list is
    /// left alone so the next start reconnects.
    pub async fn shutdown(&self) {
        let supervisors: Vec<Supervisor> = self.inner.broken.lock().drain().map(|(_, s)| s).collect();
        for supervisor in supervisors {
            supervisor.shutdown().await;
        }
        let sessions: Vec<Arc<Session>> = self.inner.live.write().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close();
        }
    }

    fn persist(&self) {
        let mut uris: Vec<String> = self
            .inner
            .broken
            .lock()
            .keys()
            .map(ToString::to_string)
            .collect();
        uris.extend(self.inner.live.read().keys().map(ToString::to_string));
        uris.extend(self.inner.invalid.lock().iter().cloned());
        uris.sort();
        uris.dedup();
        if let Err(e) = self.inner.store.save(&uris) {
            tracing::warn!(error = %e, "failed to persist session list");
        }
    }
}
