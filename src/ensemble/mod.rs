//! In-process coordination service.
//!
//! The ensemble is the collaborator the client talks to: a single-node,
//! in-memory stand-in for a real coordination cluster. It keeps the node
//! tree, server-side sessions with keep-alive deadlines, ephemeral ownership
//! and one-shot scoped watches. A bounded change log lets clients rearm a
//! watch from the last zxid they saw, so nothing between two deliveries is
//! lost.
//!
//! It also carries fault-injection knobs (unreachable service, failed
//! requests, lost replies, per-session partitions) so retry and expiry paths
//! can be exercised without a network.

mod changelog;
mod registry;
mod tree;

pub use changelog::{Change, ChangeKind, WatchScope};
pub use registry::Registry;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::CoordError;
use crate::node::{CreateMode, NodeData, Stat, Zxid};
use crate::session::SessionId;
use crate::Result;
use changelog::ChangeLog;
use tree::DataTree;

/// Client-chosen identifier of a watch within one session.
pub type WatchId = u64;

/// Ensemble tuning.
#[derive(Debug, Clone)]
pub struct EnsembleConfig {
    /// Number of recent changes kept for gap-free watch rearming.
    pub change_log_capacity: usize,
    /// How often the reaper looks for lapsed sessions.
    pub reaper_interval: Duration,
    /// Lower bound for negotiated session timeouts.
    pub min_session_timeout: Duration,
    /// Upper bound for negotiated session timeouts.
    pub max_session_timeout: Duration,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            change_log_capacity: 10_000,
            reaper_interval: Duration::from_millis(500),
            min_session_timeout: Duration::from_millis(50),
            max_session_timeout: Duration::from_secs(120),
        }
    }
}

/// Pushed to a session's notification channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A one-shot watch fired. The watch is gone until rearmed.
    Watch { watch_id: WatchId, change: Change },
    /// The session expired on the server.
    Expired,
}

/// Result of arming a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Armed {
    /// Every in-scope change after the requested zxid, oldest first.
    Delta { zxid: Zxid, changes: Vec<Change> },
    /// Full contents of the scope; sent on first arm or when the change log
    /// no longer reaches back far enough.
    Snapshot { zxid: Zxid, nodes: Vec<NodeData> },
}

/// A freshly opened server session.
#[derive(Debug)]
pub struct SessionGrant {
    pub id: SessionId,
    /// Timeout after clamping to the ensemble's bounds.
    pub timeout: Duration,
    pub notifications: mpsc::UnboundedReceiver<Notification>,
}

/// Summary of a server session, for inspection.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub timeout_ms: u64,
    pub idle_ms: u64,
    pub ephemeral_count: usize,
    pub watch_count: usize,
}

struct ServerSession {
    timeout: Duration,
    last_seen: Instant,
    watches: HashMap<WatchId, WatchScope>,
    notifier: mpsc::UnboundedSender<Notification>,
}

impl ServerSession {
    fn is_overdue(&self, now: Instant) -> bool {
        now.duration_since(self.last_seen) > self.timeout
    }
}

struct EnsembleState {
    tree: DataTree,
    log: ChangeLog,
    sessions: HashMap<SessionId, ServerSession>,
    isolated: HashSet<SessionId>,
}

impl EnsembleState {
    /// Record changes and fire every watch they match.
    fn commit(&mut self, changes: Vec<Change>) {
        for change in changes {
            for session in self.sessions.values_mut() {
                let fired: Vec<WatchId> = session
                    .watches
                    .iter()
                    .filter(|(_, scope)| scope.matches(&change.node.path))
                    .map(|(id, _)| *id)
                    .collect();
                for watch_id in fired {
                    session.watches.remove(&watch_id);
                    let _ = session.notifier.send(Notification::Watch {
                        watch_id,
                        change: change.clone(),
                    });
                }
            }
            self.log.push(change);
        }
    }

    fn session_mut(&mut self, id: SessionId) -> Result<&mut ServerSession> {
        self.sessions.get_mut(&id).ok_or(CoordError::SessionExpired)
    }

    /// Drop a session and its ephemerals. Returns the removed session so the
    /// caller decides whether to notify it.
    fn end_session(&mut self, id: SessionId) -> Option<ServerSession> {
        let session = self.sessions.remove(&id)?;
        self.isolated.remove(&id);

        let mut changes = Vec::new();
        for path in self.tree.ephemerals_of(id.as_u64()) {
            match self.tree.delete(&path, false) {
                Ok(mut removed) => changes.append(&mut removed),
                Err(e) => warn!("failed to remove ephemeral {} of {}: {}", path, id, e),
            }
        }
        self.commit(changes);
        Some(session)
    }

    fn expire(&mut self, id: SessionId) -> bool {
        match self.end_session(id) {
            Some(session) => {
                info!("session {} expired", id);
                let _ = session.notifier.send(Notification::Expired);
                true
            }
            None => false,
        }
    }
}

/// The in-process coordination service.
pub struct Ensemble {
    config: EnsembleConfig,
    state: Mutex<EnsembleState>,
    reachable: AtomicBool,
    fail_requests: AtomicU32,
    lose_replies: AtomicU32,
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl Ensemble {
    /// Create an ensemble with an empty tree.
    pub fn new(config: EnsembleConfig) -> Self {
        let log = ChangeLog::new(config.change_log_capacity);
        Self {
            config,
            state: Mutex::new(EnsembleState {
                tree: DataTree::new(),
                log,
                sessions: HashMap::new(),
                isolated: HashSet::new(),
            }),
            reachable: AtomicBool::new(true),
            fail_requests: AtomicU32::new(0),
            lose_replies: AtomicU32::new(0),
        }
    }

    /// The ensemble's configuration.
    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    fn lock(&self) -> Result<MutexGuard<'_, EnsembleState>> {
        self.state.lock().map_err(|_| CoordError::LockPoisoned)
    }

    /// Run a session-scoped read through fault injection, liveness checks
    /// and the keep-alive refresh.
    fn request<T>(
        &self,
        id: SessionId,
        op: impl FnOnce(&mut EnsembleState) -> Result<T>,
    ) -> Result<T> {
        self.dispatch(id, false, op)
    }

    /// Like [`Ensemble::request`], but the reply of a mutation can be lost
    /// after it was applied.
    fn mutate<T>(
        &self,
        id: SessionId,
        op: impl FnOnce(&mut EnsembleState) -> Result<T>,
    ) -> Result<T> {
        self.dispatch(id, true, op)
    }

    fn dispatch<T>(
        &self,
        id: SessionId,
        mutation: bool,
        op: impl FnOnce(&mut EnsembleState) -> Result<T>,
    ) -> Result<T> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(CoordError::ConnectionLoss);
        }
        if take_one(&self.fail_requests) {
            debug!("injected request failure for {}", id);
            return Err(CoordError::ConnectionLoss);
        }

        let result = {
            let mut state = self.lock()?;
            if state.isolated.contains(&id) {
                return Err(CoordError::ConnectionLoss);
            }
            let now = Instant::now();
            let overdue = state.session_mut(id)?.is_overdue(now);
            if overdue {
                state.expire(id);
                return Err(CoordError::SessionExpired);
            }
            state.session_mut(id)?.last_seen = now;
            op(&mut *state)
        };

        if mutation && result.is_ok() && take_one(&self.lose_replies) {
            debug!("injected reply loss for {}", id);
            return Err(CoordError::ConnectionLoss);
        }
        result
    }

    /// Open a server session. The requested timeout is clamped to the
    /// configured bounds.
    pub fn open_session(&self, requested_timeout: Duration) -> Result<SessionGrant> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(CoordError::ConnectionLoss);
        }
        let timeout = requested_timeout
            .max(self.config.min_session_timeout)
            .min(self.config.max_session_timeout);
        let (tx, rx) = mpsc::unbounded_channel();
        let id = SessionId::new();

        self.lock()?.sessions.insert(
            id,
            ServerSession {
                timeout,
                last_seen: Instant::now(),
                watches: HashMap::new(),
                notifier: tx,
            },
        );
        debug!("opened session {} with timeout {:?}", id, timeout);

        Ok(SessionGrant {
            id,
            timeout,
            notifications: rx,
        })
    }

    /// Keep-alive. Not subject to injected request failures or reply loss.
    pub fn ping(&self, id: SessionId) -> Result<()> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(CoordError::ConnectionLoss);
        }
        let mut state = self.lock()?;
        if state.isolated.contains(&id) {
            return Err(CoordError::ConnectionLoss);
        }
        let now = Instant::now();
        if state.session_mut(id)?.is_overdue(now) {
            state.expire(id);
            return Err(CoordError::SessionExpired);
        }
        state.session_mut(id)?.last_seen = now;
        Ok(())
    }

    /// Close a session, removing its ephemerals and watches.
    pub fn close_session(&self, id: SessionId) -> Result<()> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(CoordError::ConnectionLoss);
        }
        let mut state = self.lock()?;
        if state.isolated.contains(&id) {
            return Err(CoordError::ConnectionLoss);
        }
        match state.end_session(id) {
            Some(_) => {
                debug!("closed session {}", id);
                Ok(())
            }
            None => Err(CoordError::SessionExpired),
        }
    }

    pub fn create(
        &self,
        id: SessionId,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
        create_parents: bool,
    ) -> Result<String> {
        let owner = match mode {
            CreateMode::Persistent => 0,
            CreateMode::Ephemeral => id.as_u64(),
        };
        self.mutate(id, |state| {
            let changes = state.tree.create(path, data, owner, create_parents)?;
            state.commit(changes);
            Ok(path.to_string())
        })
    }

    pub fn get(&self, id: SessionId, path: &str) -> Result<NodeData> {
        self.request(id, |state| state.tree.get(path))
    }

    pub fn exists(&self, id: SessionId, path: &str) -> Result<Option<Stat>> {
        self.request(id, |state| Ok(state.tree.stat(path)))
    }

    pub fn set(
        &self,
        id: SessionId,
        path: &str,
        data: Vec<u8>,
        expected_version: Option<u32>,
    ) -> Result<Stat> {
        self.mutate(id, |state| {
            let change = state.tree.set(path, data, expected_version)?;
            let stat = change.node.stat;
            state.commit(vec![change]);
            Ok(stat)
        })
    }

    pub fn delete(&self, id: SessionId, path: &str, recursive: bool) -> Result<()> {
        self.mutate(id, |state| {
            let changes = state.tree.delete(path, recursive)?;
            state.commit(changes);
            Ok(())
        })
    }

    pub fn children(&self, id: SessionId, path: &str) -> Result<Vec<String>> {
        self.request(id, |state| state.tree.children(path))
    }

    /// Register a one-shot watch and report what the caller missed.
    ///
    /// Registration and the delta/snapshot are taken under the same lock, so
    /// every change is either in the reply or will fire the watch.
    pub fn arm(
        &self,
        id: SessionId,
        watch_id: WatchId,
        scope: &WatchScope,
        since: Option<Zxid>,
    ) -> Result<Armed> {
        self.request(id, |state| {
            let zxid = state.tree.last_zxid();
            let armed = match since {
                Some(since) if state.log.covers(since) => Armed::Delta {
                    zxid,
                    changes: state.log.since(since, scope),
                },
                _ => Armed::Snapshot {
                    zxid,
                    nodes: state.tree.collect(scope),
                },
            };
            state.session_mut(id)?.watches.insert(watch_id, scope.clone());
            Ok(armed)
        })
    }

    /// Remove a watch registration, if still armed.
    pub fn disarm(&self, id: SessionId, watch_id: WatchId) -> Result<()> {
        self.request(id, |state| {
            state.session_mut(id)?.watches.remove(&watch_id);
            Ok(())
        })
    }

    /// Expire every session whose keep-alive lapsed.
    pub fn reap_expired(&self) -> Vec<SessionId> {
        let Ok(mut state) = self.lock() else {
            return Vec::new();
        };
        let now = Instant::now();
        let overdue: Vec<SessionId> = state
            .sessions
            .iter()
            .filter(|(_, s)| s.is_overdue(now))
            .map(|(id, _)| *id)
            .collect();
        for id in &overdue {
            state.expire(*id);
        }
        overdue
    }

    /// Periodically reap lapsed sessions until `shutdown` flips to `true`.
    pub async fn run_reaper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.reaper_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = self.reap_expired();
                    if !reaped.is_empty() {
                        debug!("reaped {} session(s)", reaped.len());
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("reaper stopped");
    }

    // ----- inspection -----

    /// Read a node without a session.
    pub fn node(&self, path: &str) -> Option<NodeData> {
        self.lock().ok()?.tree.get(path).ok()
    }

    /// Number of nodes, root included.
    pub fn node_count(&self) -> usize {
        self.lock().map(|s| s.tree.len()).unwrap_or(0)
    }

    /// Zxid of the latest mutation.
    pub fn last_zxid(&self) -> Zxid {
        self.lock().map(|s| s.tree.last_zxid()).unwrap_or(0)
    }

    /// Whether a server session is alive.
    pub fn has_session(&self, id: SessionId) -> bool {
        self.lock()
            .map(|s| s.sessions.contains_key(&id))
            .unwrap_or(false)
    }

    /// Live sessions.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let Ok(state) = self.lock() else {
            return Vec::new();
        };
        let now = Instant::now();
        let mut infos: Vec<SessionInfo> = state
            .sessions
            .iter()
            .map(|(id, s)| SessionInfo {
                session_id: *id,
                timeout_ms: s.timeout.as_millis() as u64,
                idle_ms: now.duration_since(s.last_seen).as_millis() as u64,
                ephemeral_count: state.tree.ephemerals_of(id.as_u64()).len(),
                watch_count: s.watches.len(),
            })
            .collect();
        infos.sort_by_key(|i| i.session_id);
        infos
    }

    // ----- fault injection -----

    /// Force-expire a session as if its keep-alives had lapsed.
    pub fn expire_session(&self, id: SessionId) -> bool {
        self.lock().map(|mut s| s.expire(id)).unwrap_or(false)
    }

    /// Make the whole service (un)reachable.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Drop every request from one session without refreshing its keep-alive.
    pub fn isolate(&self, id: SessionId) {
        if let Ok(mut state) = self.lock() {
            state.isolated.insert(id);
        }
    }

    /// Undo [`Ensemble::isolate`].
    pub fn heal(&self, id: SessionId) {
        if let Ok(mut state) = self.lock() {
            state.isolated.remove(&id);
        }
    }

    /// Fail the next `n` requests before they are applied.
    pub fn fail_next_requests(&self, n: u32) {
        self.fail_requests.store(n, Ordering::SeqCst);
    }

    /// Apply the next `n` successful mutations but report connection loss.
    pub fn lose_next_replies(&self, n: u32) {
        self.lose_replies.store(n, Ordering::SeqCst);
    }
}

impl Default for Ensemble {
    fn default() -> Self {
        Self::new(EnsembleConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(ensemble: &Ensemble) -> SessionGrant {
        ensemble.open_session(Duration::from_secs(30)).unwrap()
    }

    #[test]
    fn test_timeout_is_clamped() {
        let ensemble = Ensemble::default();
        let grant = ensemble.open_session(Duration::from_millis(1)).unwrap();
        assert_eq!(grant.timeout, Duration::from_millis(50));
        let grant = ensemble.open_session(Duration::from_secs(3600)).unwrap();
        assert_eq!(grant.timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_unreachable_rejects_open() {
        let ensemble = Ensemble::default();
        ensemble.set_reachable(false);
        assert!(matches!(
            ensemble.open_session(Duration::from_secs(1)),
            Err(CoordError::ConnectionLoss)
        ));
    }

    #[test]
    fn test_close_removes_ephemerals() {
        let ensemble = Ensemble::default();
        let owner = open(&ensemble);
        let other = open(&ensemble);

        ensemble
            .create(owner.id, "/app4", b"hehe".to_vec(), CreateMode::Ephemeral, false)
            .unwrap();
        assert!(ensemble.exists(other.id, "/app4").unwrap().is_some());

        ensemble.close_session(owner.id).unwrap();
        assert!(ensemble.exists(other.id, "/app4").unwrap().is_none());
        assert!(matches!(
            ensemble.ping(owner.id),
            Err(CoordError::SessionExpired)
        ));
    }

    #[test]
    fn test_watch_fires_once() {
        let ensemble = Ensemble::default();
        let mut grant = open(&ensemble);
        let id = grant.id;
        ensemble
            .create(id, "/app1", Vec::new(), CreateMode::Persistent, false)
            .unwrap();

        let scope = WatchScope::Node("/app1".into());
        ensemble.arm(id, 1, &scope, None).unwrap();
        ensemble.set(id, "/app1", b"a".to_vec(), None).unwrap();
        ensemble.set(id, "/app1", b"b".to_vec(), None).unwrap();

        match grant.notifications.try_recv().unwrap() {
            Notification::Watch { watch_id, change } => {
                assert_eq!(watch_id, 1);
                assert_eq!(change.node.data, b"a");
            }
            other => panic!("unexpected notification: {:?}", other),
        }
        assert!(grant.notifications.try_recv().is_err());
    }

    #[test]
    fn test_rearm_returns_gap() {
        let ensemble = Ensemble::default();
        let grant = open(&ensemble);
        let id = grant.id;
        ensemble
            .create(id, "/app1", Vec::new(), CreateMode::Persistent, false)
            .unwrap();

        let scope = WatchScope::Node("/app1".into());
        let Armed::Snapshot { zxid, nodes } = ensemble.arm(id, 1, &scope, None).unwrap() else {
            panic!("first arm must return a snapshot");
        };
        assert_eq!(nodes.len(), 1);

        ensemble.set(id, "/app1", b"1".to_vec(), None).unwrap();
        ensemble.set(id, "/app1", b"2".to_vec(), None).unwrap();

        match ensemble.arm(id, 1, &scope, Some(zxid)).unwrap() {
            Armed::Delta { changes, .. } => {
                let data: Vec<_> = changes.iter().map(|c| c.node.data.clone()).collect();
                assert_eq!(data, vec![b"1".to_vec(), b"2".to_vec()]);
            }
            other => panic!("expected delta, got {:?}", other),
        }
    }

    #[test]
    fn test_compacted_log_falls_back_to_snapshot() {
        let ensemble = Ensemble::new(EnsembleConfig {
            change_log_capacity: 2,
            ..Default::default()
        });
        let grant = open(&ensemble);
        let id = grant.id;
        for i in 0..5 {
            ensemble
                .create(id, &format!("/n{}", i), Vec::new(), CreateMode::Persistent, false)
                .unwrap();
        }
        let scope = WatchScope::Children("/".into());
        assert!(matches!(
            ensemble.arm(id, 1, &scope, Some(1)).unwrap(),
            Armed::Snapshot { .. }
        ));
    }

    #[test]
    fn test_lost_reply_still_applies() {
        let ensemble = Ensemble::default();
        let grant = open(&ensemble);
        ensemble
            .create(grant.id, "/app2", Vec::new(), CreateMode::Persistent, false)
            .unwrap();

        ensemble.lose_next_replies(1);
        assert!(matches!(
            ensemble.delete(grant.id, "/app2", false),
            Err(CoordError::ConnectionLoss)
        ));
        assert!(ensemble.node("/app2").is_none());
    }

    #[test]
    fn test_reads_keep_their_replies() {
        let ensemble = Ensemble::default();
        let grant = open(&ensemble);
        ensemble
            .create(grant.id, "/app2", Vec::new(), CreateMode::Persistent, false)
            .unwrap();

        ensemble.lose_next_replies(1);
        assert!(ensemble.get(grant.id, "/app2").is_ok());
        assert!(ensemble.exists(grant.id, "/app2").unwrap().is_some());
        // Still pending for the next mutation.
        assert!(matches!(
            ensemble.set(grant.id, "/app2", b"x".to_vec(), None),
            Err(CoordError::ConnectionLoss)
        ));
        assert_eq!(ensemble.node("/app2").unwrap().stat.version, 1);
    }

    #[test]
    fn test_failed_request_is_not_applied() {
        let ensemble = Ensemble::default();
        let grant = open(&ensemble);

        ensemble.fail_next_requests(1);
        assert!(ensemble
            .create(grant.id, "/app2", Vec::new(), CreateMode::Persistent, false)
            .is_err());
        assert!(ensemble.node("/app2").is_none());
    }

    #[test]
    fn test_reaper_expires_lapsed_sessions() {
        let ensemble = Ensemble::default();
        let mut grant = ensemble.open_session(Duration::from_millis(50)).unwrap();
        ensemble
            .create(grant.id, "/e", Vec::new(), CreateMode::Ephemeral, false)
            .unwrap();

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(ensemble.reap_expired(), vec![grant.id]);
        assert!(ensemble.node("/e").is_none());
        assert_eq!(grant.notifications.try_recv().unwrap(), Notification::Expired);
    }

    #[test]
    fn test_isolated_session_gets_connection_loss() {
        let ensemble = Ensemble::default();
        let grant = open(&ensemble);
        ensemble.isolate(grant.id);
        assert!(matches!(ensemble.ping(grant.id), Err(CoordError::ConnectionLoss)));
        ensemble.heal(grant.id);
        assert!(ensemble.ping(grant.id).is_ok());
    }

    #[test]
    fn test_session_infos() {
        let ensemble = Ensemble::default();
        let grant = open(&ensemble);
        ensemble
            .create(grant.id, "/e", Vec::new(), CreateMode::Ephemeral, false)
            .unwrap();
        let infos = ensemble.sessions();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].session_id, grant.id);
        assert_eq!(infos[0].ephemeral_count, 1);
    }
}
