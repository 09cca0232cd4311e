//! Client sessions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::retry::{sleep_or_shutdown, RetryPolicy};
use super::{ConnectionState, SessionId};
use crate::ensemble::{Ensemble, Notification, Registry, WatchId, WatchScope};
use crate::error::CoordError;
use crate::watch::{WatchCache, WatchEvents};
use crate::Result;

/// Data written by `create` when the caller supplies none.
pub const DEFAULT_NODE_DATA: &[u8] = b"127.0.0.1";

/// Configuration for opening a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Endpoints (`host:port`), tried in order on each attempt.
    pub endpoints: Vec<String>,
    /// Backoff for connecting and for transient request failures.
    pub retry: RetryPolicy,
    /// Requested session timeout; the ensemble may clamp it.
    pub session_timeout: Duration,
    /// Overall deadline for establishing the session.
    pub connection_timeout: Duration,
    /// Data stored by `create` when none is given.
    pub default_data: Vec<u8>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["127.0.0.1:2181".to_string()],
            retry: RetryPolicy::default(),
            session_timeout: Duration::from_secs(60),
            connection_timeout: Duration::from_secs(15),
            default_data: DEFAULT_NODE_DATA.to_vec(),
        }
    }
}

impl SessionConfig {
    /// Config for a single endpoint with default settings.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoints: vec![endpoint.into()],
            ..Default::default()
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_default_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.default_data = data.into();
        self
    }
}

pub(crate) struct SessionInner {
    pub(crate) id: SessionId,
    pub(crate) endpoint: String,
    pub(crate) ensemble: Arc<Ensemble>,
    pub(crate) config: SessionConfig,
    timeout: Duration,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    watches: RwLock<HashMap<WatchId, Arc<WatchCache>>>,
    next_watch_id: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionInner {
    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Apply a state transition if it is valid. Returns whether it happened.
    fn transition(&self, target: ConnectionState) -> bool {
        self.state
            .send_if_modified(|state| state.transition_to(target).is_ok())
    }

    /// Fail fast once the session has ended.
    pub(crate) fn check_usable(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Expired => Err(CoordError::SessionExpired),
            ConnectionState::Closed => Err(CoordError::SessionClosed),
            _ => Ok(()),
        }
    }

    /// Map an error from a request or retry loop onto the session's fate.
    pub(crate) fn refine(&self, err: CoordError) -> CoordError {
        match err {
            CoordError::SessionExpired => {
                self.mark_expired();
                CoordError::SessionExpired
            }
            CoordError::SessionClosed if self.state() == ConnectionState::Expired => {
                CoordError::SessionExpired
            }
            other => other,
        }
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    fn drain_watches(&self) -> Vec<Arc<WatchCache>> {
        match self.watches.write() {
            Ok(mut watches) => watches.drain().map(|(_, cache)| cache).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn watch_list(&self) -> Vec<Arc<WatchCache>> {
        self.watches
            .read()
            .map(|w| w.values().cloned().collect())
            .unwrap_or_default()
    }

    fn mark_expired(&self) {
        if self.transition(ConnectionState::Expired) {
            warn!("session {} expired", self.id);
        }
        for cache in self.drain_watches() {
            cache.expire();
        }
        self.shutdown.send_replace(true);
    }

    fn route(&self, watch_id: WatchId, change: crate::ensemble::Change) {
        let cache = self
            .watches
            .read()
            .ok()
            .and_then(|w| w.get(&watch_id).cloned());
        match cache {
            Some(cache) => cache.deliver(change),
            None => debug!("dropping change for unknown watch {}", watch_id),
        }
    }
}

/// A client session with one ensemble.
///
/// Cheap to clone; all clones share the same server session. Ephemeral nodes
/// created through it live until [`Session::close`] or expiry.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.inner.state())
            .finish()
    }
}

impl Session {
    /// Open a session against the first reachable endpoint.
    ///
    /// Every attempt walks the endpoint list once. Between attempts the
    /// retry policy's backoff applies; connecting gives up after
    /// `max_retries` retries or once the next backoff would overrun
    /// `connection_timeout`, whichever comes first.
    pub async fn connect(registry: &Registry, config: SessionConfig) -> Result<Session> {
        if config.endpoints.is_empty() {
            return Err(CoordError::Connection("no endpoints configured".into()));
        }

        let started = Instant::now();
        let mut retry = 0u32;
        loop {
            for endpoint in &config.endpoints {
                let attempt = registry
                    .resolve(endpoint)
                    .and_then(|ens| ens.open_session(config.session_timeout).map(|g| (ens, g)));
                match attempt {
                    Ok((ensemble, grant)) => {
                        let session = Self::start(endpoint.clone(), ensemble, grant, config);
                        info!(
                            "session {} connected to {} (timeout {:?})",
                            session.id(),
                            session.endpoint(),
                            session.negotiated_timeout()
                        );
                        return Ok(session);
                    }
                    Err(e) => warn!("connecting to {} failed: {}", endpoint, e),
                }
            }

            if retry >= config.retry.max_retries {
                return Err(CoordError::Connection(format!(
                    "no endpoint reachable after {} attempt(s)",
                    retry + 1
                )));
            }
            let delay = config.retry.delay_for(retry);
            if started.elapsed() + delay > config.connection_timeout {
                return Err(CoordError::Connection(format!(
                    "connection timeout of {:?} exceeded",
                    config.connection_timeout
                )));
            }
            retry += 1;
            tokio::time::sleep(delay).await;
        }
    }

    fn start(
        endpoint: String,
        ensemble: Arc<Ensemble>,
        grant: crate::ensemble::SessionGrant,
        config: SessionConfig,
    ) -> Session {
        let mut initial = ConnectionState::Disconnected;
        // Disconnected -> Connecting -> Connected; both are always valid.
        let _ = initial.transition_to(ConnectionState::Connecting);
        let _ = initial.transition_to(ConnectionState::Connected);
        let (state, _) = watch::channel(initial);
        let (shutdown, _) = watch::channel(false);

        let inner = Arc::new(SessionInner {
            id: grant.id,
            endpoint,
            ensemble,
            config,
            timeout: grant.timeout,
            state,
            shutdown,
            watches: RwLock::new(HashMap::new()),
            next_watch_id: AtomicU64::new(1),
            tasks: Mutex::new(Vec::new()),
        });

        let keepalive = tokio::spawn(keepalive_loop(
            Arc::downgrade(&inner),
            inner.shutdown.subscribe(),
            grant.timeout,
        ));
        let delivery = tokio::spawn(delivery_loop(
            Arc::downgrade(&inner),
            grant.notifications,
            inner.shutdown.subscribe(),
        ));
        if let Ok(mut tasks) = inner.tasks.lock() {
            tasks.push(keepalive);
            tasks.push(delivery);
        }

        Session { inner }
    }

    /// Session identifier assigned by the ensemble.
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Endpoint the session is connected to.
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Timeout granted by the ensemble.
    pub fn negotiated_timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Subscribe to connection state changes.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Wait until the session reaches `target`, up to `timeout`.
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.state_changes();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == target))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Wait until the session is connected, up to `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        self.wait_for_state(ConnectionState::Connected, timeout).await
    }

    /// The ensemble this session talks to.
    pub fn ensemble(&self) -> &Arc<Ensemble> {
        &self.inner.ensemble
    }

    /// The configuration the session was opened with.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Number of registered watches.
    pub fn watch_count(&self) -> usize {
        self.inner.watches.read().map(|w| w.len()).unwrap_or(0)
    }

    /// Close the session.
    ///
    /// Ephemeral nodes are removed, watches stop and their event streams end.
    /// Closing twice, or closing an expired session, is a no-op on the server
    /// side.
    pub async fn close(&self) -> Result<()> {
        let previous = self.inner.state();
        if previous == ConnectionState::Closed {
            return Ok(());
        }
        self.inner.transition(ConnectionState::Closed);
        self.inner.shutdown.send_replace(true);

        for cache in self.inner.drain_watches() {
            cache.close();
        }

        if previous != ConnectionState::Expired {
            match self.inner.ensemble.close_session(self.inner.id) {
                Ok(()) | Err(CoordError::SessionExpired) => {}
                Err(e) => warn!(
                    "could not release session {} ({}); it will expire on its own",
                    self.inner.id, e
                ),
            }
        }

        let tasks = self
            .inner
            .tasks
            .lock()
            .map(|mut t| std::mem::take(&mut *t))
            .unwrap_or_default();
        for task in tasks {
            let _ = task.await;
        }

        info!("session {} closed", self.inner.id);
        Ok(())
    }

    /// Register a new watch cache with this session.
    pub(crate) fn attach_watch(&self, scope: WatchScope) -> Result<(Arc<WatchCache>, WatchEvents)> {
        self.inner.check_usable()?;
        let id = self.inner.next_watch_id.fetch_add(1, Ordering::Relaxed);
        let (cache, events) = WatchCache::new(
            id,
            scope,
            self.inner.id,
            Arc::clone(&self.inner.ensemble),
        );
        self.inner
            .watches
            .write()
            .map_err(|_| CoordError::LockPoisoned)?
            .insert(id, Arc::clone(&cache));
        debug!("session {} registered watch {} on {:?}", self.inner.id, id, cache.scope());
        Ok((cache, events))
    }

    /// Stop a watch and forget it.
    pub(crate) fn detach_watch(&self, cache: &WatchCache) {
        cache.stop();
        if let Ok(mut watches) = self.inner.watches.write() {
            watches.remove(&cache.id());
        }
    }

    /// Run a request through the retry policy, with session-fate mapping.
    pub(crate) async fn retrying<T, F>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut(&SessionInner) -> Result<T>,
    {
        let inner = &*self.inner;
        inner.check_usable()?;
        let mut shutdown = inner.shutdown_signal();
        let policy = inner.config.retry;
        policy
            .run(label, &mut shutdown, || {
                let result = inner.check_usable().and_then(|_| op(inner));
                async move { result }
            })
            .await
            .map_err(|e| inner.refine(e))
    }
}

async fn keepalive_loop(
    session: Weak<SessionInner>,
    mut shutdown: watch::Receiver<bool>,
    timeout: Duration,
) {
    let interval = (timeout / 3).max(Duration::from_millis(5));
    let mut last_ok = Instant::now();

    loop {
        if !sleep_or_shutdown(interval, &mut shutdown).await {
            break;
        }
        let Some(inner) = session.upgrade() else {
            break;
        };

        match inner.ensemble.ping(inner.id) {
            Ok(()) => {
                last_ok = Instant::now();
                if inner.transition(ConnectionState::Connected) {
                    info!("session {} reconnected", inner.id);
                }
                for cache in inner.watch_list() {
                    cache.ensure_armed();
                }
            }
            Err(CoordError::SessionExpired) => {
                inner.mark_expired();
                break;
            }
            Err(e) => {
                if inner.transition(ConnectionState::Disconnected) {
                    warn!("session {} disconnected: {}", inner.id, e);
                }
                if last_ok.elapsed() > timeout {
                    inner.mark_expired();
                    break;
                }
            }
        }
    }
    debug!("keep-alive stopped");
}

async fn delivery_loop(
    session: Weak<SessionInner>,
    mut notifications: mpsc::UnboundedReceiver<Notification>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            notification = notifications.recv() => {
                let Some(inner) = session.upgrade() else {
                    break;
                };
                match notification {
                    Some(Notification::Watch { watch_id, change }) => inner.route(watch_id, change),
                    Some(Notification::Expired) => {
                        inner.mark_expired();
                        break;
                    }
                    None => break,
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("watch delivery stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config(endpoint: &str) -> SessionConfig {
        SessionConfig::new(endpoint)
            .with_retry(RetryPolicy::exponential(Duration::from_millis(5), 2))
            .with_session_timeout(Duration::from_secs(10))
    }

    fn registry_with(endpoint: &str) -> (Registry, Arc<Ensemble>) {
        let registry = Registry::new();
        let ensemble = Arc::new(Ensemble::default());
        registry.bind(endpoint, Arc::clone(&ensemble)).unwrap();
        (registry, ensemble)
    }

    #[tokio::test]
    async fn test_connect_and_close() {
        let (registry, ensemble) = registry_with("127.0.0.1:2181");
        let session = Session::connect(&registry, fast_config("127.0.0.1:2181"))
            .await
            .unwrap();
        assert_eq!(session.state(), ConnectionState::Connected);
        assert!(ensemble.has_session(session.id()));

        session.close().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Closed);
        assert!(!ensemble.has_session(session.id()));

        // Second close is a no-op.
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_falls_through_endpoints() {
        let (registry, _ensemble) = registry_with("127.0.0.1:2182");
        let config = SessionConfig {
            endpoints: vec!["127.0.0.1:2181".into(), "127.0.0.1:2182".into()],
            ..fast_config("unused")
        };
        let session = Session::connect(&registry, config).await.unwrap();
        assert_eq!(session.endpoint(), "127.0.0.1:2182");
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_gives_up() {
        let registry = Registry::new();
        let result = Session::connect(&registry, fast_config("127.0.0.1:2181")).await;
        assert!(matches!(result, Err(CoordError::Connection(_))));
    }

    #[tokio::test]
    async fn test_connect_respects_connection_timeout() {
        let registry = Registry::new();
        let config = fast_config("127.0.0.1:2181")
            .with_retry(RetryPolicy::exponential(Duration::from_millis(200), 10))
            .with_connection_timeout(Duration::from_millis(100));
        let started = Instant::now();
        let result = Session::connect(&registry, config).await;
        assert!(matches!(result, Err(CoordError::Connection(_))));
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_empty_endpoint_list() {
        let registry = Registry::new();
        let config = SessionConfig {
            endpoints: Vec::new(),
            ..Default::default()
        };
        assert!(Session::connect(&registry, config).await.is_err());
    }

    #[tokio::test]
    async fn test_server_expiry_is_observed() {
        let (registry, ensemble) = registry_with("127.0.0.1:2181");
        let session = Session::connect(&registry, fast_config("127.0.0.1:2181"))
            .await
            .unwrap();

        ensemble.expire_session(session.id());
        assert!(
            session
                .wait_for_state(ConnectionState::Expired, Duration::from_secs(2))
                .await
        );
        assert!(matches!(
            session.inner.check_usable(),
            Err(CoordError::SessionExpired)
        ));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_and_reconnect() {
        let (registry, ensemble) = registry_with("127.0.0.1:2181");
        let config = fast_config("127.0.0.1:2181").with_session_timeout(Duration::from_millis(600));
        let session = Session::connect(&registry, config).await.unwrap();

        ensemble.isolate(session.id());
        assert!(
            session
                .wait_for_state(ConnectionState::Disconnected, Duration::from_secs(2))
                .await
        );
        ensemble.heal(session.id());
        assert!(
            session
                .wait_for_state(ConnectionState::Connected, Duration::from_secs(2))
                .await
        );
        session.close().await.unwrap();
    }

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.session_timeout, Duration::from_secs(60));
        assert_eq!(config.connection_timeout, Duration::from_secs(15));
        assert_eq!(config.default_data, b"127.0.0.1");
        assert_eq!(config.retry.max_retries, 3);
    }
}
