//! Scoped watch cache shared by the node, children and tree watches.
//!
//! A cache mirrors every node in its [`WatchScope`] and turns ensemble
//! changes into [`WatchEvent`]s. The ensemble only ever holds one one-shot
//! watch per cache; after each delivery the cache rearms from the last zxid
//! it applied and replays whatever it missed in between.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::ensemble::{Armed, Change, ChangeKind, Ensemble, WatchId, WatchScope};
use crate::error::CoordError;
use crate::node::{NodeData, Zxid};
use crate::session::SessionId;
use crate::Result;

/// Lifecycle state of a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchState {
    /// Not observing anything.
    #[default]
    Stopped,
    /// Loading the initial contents.
    Loading,
    /// Armed and delivering events.
    Active,
}

impl WatchState {
    /// Valid transitions: Stopped -> Loading -> Active -> Stopped, and
    /// Loading -> Stopped when the initial load fails.
    pub fn can_transition_to(&self, target: WatchState) -> bool {
        use WatchState::*;
        matches!(
            (*self, target),
            (Stopped, Loading) | (Loading, Active) | (Loading, Stopped) | (Active, Stopped)
        )
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&mut self, target: WatchState) -> Result<()> {
        if self.can_transition_to(target) {
            *self = target;
            Ok(())
        } else {
            Err(CoordError::InvalidStateTransition {
                from: format!("{:?}", self),
                to: format!("{:?}", target),
            })
        }
    }
}

/// Something that happened in a watched scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatchEvent {
    /// The initial load finished; the cache is active.
    Initialized,
    /// A node appeared.
    Added(NodeData),
    /// A node's data changed.
    Updated { old: NodeData, new: NodeData },
    /// A node disappeared. Carries its last known state.
    Removed(NodeData),
    /// The session expired; the watch is stopped and will not resume.
    Expired,
}

impl WatchEvent {
    /// Path of the affected node, if the event concerns one.
    pub fn path(&self) -> Option<&str> {
        match self {
            WatchEvent::Added(node) | WatchEvent::Removed(node) => Some(&node.path),
            WatchEvent::Updated { new, .. } => Some(&new.path),
            WatchEvent::Initialized | WatchEvent::Expired => None,
        }
    }
}

/// Receiving end of a watch's events.
pub type WatchEvents = mpsc::UnboundedReceiver<WatchEvent>;

struct CacheInner {
    state: WatchState,
    armed: bool,
    last_zxid: Zxid,
    entries: BTreeMap<String, NodeData>,
    events: Option<mpsc::UnboundedSender<WatchEvent>>,
}

impl CacheInner {
    fn emit(&self, event: WatchEvent) {
        trace!("watch event: {:?}", event);
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Fold one change into the cache. Changes at or below the last applied
    /// zxid have been seen already and are skipped.
    fn apply(&mut self, scope: &WatchScope, change: Change) {
        if change.zxid <= self.last_zxid {
            return;
        }
        self.last_zxid = change.zxid;
        if !scope.matches(&change.node.path) {
            return;
        }

        let node = change.node;
        match change.kind {
            ChangeKind::Created | ChangeKind::DataChanged => {
                match self.entries.insert(node.path.clone(), node.clone()) {
                    Some(old) => self.emit(WatchEvent::Updated { old, new: node }),
                    None => self.emit(WatchEvent::Added(node)),
                }
            }
            ChangeKind::Deleted => {
                if self.entries.remove(&node.path).is_some() {
                    self.emit(WatchEvent::Removed(node));
                }
            }
        }
    }

    /// Replace the cache with a snapshot, emitting the difference.
    fn resync(&mut self, nodes: Vec<NodeData>) {
        let fresh: BTreeMap<String, NodeData> =
            nodes.into_iter().map(|n| (n.path.clone(), n)).collect();

        // Reverse path order visits descendants before their ancestors.
        let gone: Vec<NodeData> = self
            .entries
            .iter()
            .rev()
            .filter(|(path, _)| !fresh.contains_key(*path))
            .map(|(_, node)| node.clone())
            .collect();
        for node in gone {
            self.emit(WatchEvent::Removed(node));
        }

        for (path, node) in &fresh {
            match self.entries.get(path) {
                None => self.emit(WatchEvent::Added(node.clone())),
                Some(old)
                    if old.stat.mzxid != node.stat.mzxid || old.stat.czxid != node.stat.czxid =>
                {
                    self.emit(WatchEvent::Updated {
                        old: old.clone(),
                        new: node.clone(),
                    })
                }
                Some(_) => {}
            }
        }
        self.entries = fresh;
    }
}

/// One registered watch.
pub(crate) struct WatchCache {
    id: WatchId,
    scope: WatchScope,
    session_id: SessionId,
    ensemble: Arc<Ensemble>,
    inner: Mutex<CacheInner>,
}

impl WatchCache {
    pub(crate) fn new(
        id: WatchId,
        scope: WatchScope,
        session_id: SessionId,
        ensemble: Arc<Ensemble>,
    ) -> (Arc<Self>, WatchEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cache = Arc::new(Self {
            id,
            scope,
            session_id,
            ensemble,
            inner: Mutex::new(CacheInner {
                state: WatchState::Stopped,
                armed: false,
                last_zxid: 0,
                entries: BTreeMap::new(),
                events: Some(tx),
            }),
        });
        (cache, rx)
    }

    pub(crate) fn id(&self) -> WatchId {
        self.id
    }

    pub(crate) fn scope(&self) -> &WatchScope {
        &self.scope
    }

    fn lock(&self) -> Result<MutexGuard<'_, CacheInner>> {
        self.inner.lock().map_err(|_| CoordError::LockPoisoned)
    }

    /// Load the scope and arm the watch: Stopped -> Loading -> Active.
    ///
    /// With `load_initial` the cache is primed silently; otherwise every
    /// existing node is reported as [`WatchEvent::Added`]. Either way
    /// [`WatchEvent::Initialized`] follows. On failure the cache is left
    /// stopped so the call can be retried.
    pub(crate) fn start(&self, load_initial: bool) -> Result<()> {
        let mut inner = self.lock()?;
        inner.state.transition_to(WatchState::Loading)?;

        let armed = match self
            .ensemble
            .arm(self.session_id, self.id, &self.scope, None)
        {
            Ok(armed) => armed,
            Err(e) => {
                inner.state = WatchState::Stopped;
                return Err(e);
            }
        };

        let (zxid, nodes) = match armed {
            Armed::Snapshot { zxid, nodes } => (zxid, nodes),
            Armed::Delta { zxid, .. } => (zxid, Vec::new()),
        };
        if !load_initial {
            for node in &nodes {
                inner.emit(WatchEvent::Added(node.clone()));
            }
        }
        inner.entries = nodes.into_iter().map(|n| (n.path.clone(), n)).collect();
        inner.last_zxid = zxid;
        inner.armed = true;
        inner.state.transition_to(WatchState::Active)?;
        inner.emit(WatchEvent::Initialized);

        debug!(
            "watch {} on {:?} active with {} cached node(s)",
            self.id,
            self.scope,
            inner.entries.len()
        );
        Ok(())
    }

    /// Handle a fired one-shot watch: apply it, then rearm.
    pub(crate) fn deliver(&self, change: Change) {
        let Ok(mut inner) = self.lock() else {
            return;
        };
        if inner.state != WatchState::Active {
            return;
        }
        inner.armed = false;
        inner.apply(&self.scope, change);
        self.rearm(&mut inner);
    }

    /// Rearm if a previous rearm failed.
    pub(crate) fn ensure_armed(&self) {
        let Ok(mut inner) = self.lock() else {
            return;
        };
        if inner.state == WatchState::Active && !inner.armed {
            self.rearm(&mut inner);
        }
    }

    fn rearm(&self, inner: &mut CacheInner) {
        match self
            .ensemble
            .arm(self.session_id, self.id, &self.scope, Some(inner.last_zxid))
        {
            Ok(Armed::Delta { zxid, changes }) => {
                for change in changes {
                    inner.apply(&self.scope, change);
                }
                inner.last_zxid = inner.last_zxid.max(zxid);
                inner.armed = true;
            }
            Ok(Armed::Snapshot { zxid, nodes }) => {
                debug!("watch {} fell behind the change log, resyncing", self.id);
                inner.resync(nodes);
                inner.last_zxid = zxid;
                inner.armed = true;
            }
            Err(e) => {
                // Picked up again by ensure_armed on the next keep-alive.
                debug!("rearming watch {} failed: {}", self.id, e);
                inner.armed = false;
            }
        }
    }

    /// Stop observing. Cached entries are dropped; the event channel stays
    /// open so the watch can be started again.
    pub(crate) fn stop(&self) {
        let Ok(mut inner) = self.lock() else {
            return;
        };
        if inner.state == WatchState::Stopped {
            return;
        }
        inner.state = WatchState::Stopped;
        if inner.armed {
            let _ = self.ensemble.disarm(self.session_id, self.id);
        }
        inner.armed = false;
        inner.entries.clear();
    }

    /// The session expired: report it, stop for good and end the stream.
    pub(crate) fn expire(&self) {
        let Ok(mut inner) = self.lock() else {
            return;
        };
        let was_running = inner.state != WatchState::Stopped;
        inner.state = WatchState::Stopped;
        inner.armed = false;
        if was_running {
            inner.emit(WatchEvent::Expired);
        }
        inner.events = None;
    }

    /// The session closed: end the event stream.
    pub(crate) fn close(&self) {
        let Ok(mut inner) = self.lock() else {
            return;
        };
        inner.state = WatchState::Stopped;
        inner.armed = false;
        inner.events = None;
    }

    pub(crate) fn state(&self) -> WatchState {
        self.lock().map(|i| i.state).unwrap_or_default()
    }

    pub(crate) fn get(&self, path: &str) -> Option<NodeData> {
        self.lock().ok()?.entries.get(path).cloned()
    }

    pub(crate) fn entries(&self) -> Vec<NodeData> {
        self.lock()
            .map(|i| i.entries.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::CreateMode;
    use std::time::Duration;

    struct Fixture {
        ensemble: Arc<Ensemble>,
        session: SessionId,
        notifications: mpsc::UnboundedReceiver<crate::ensemble::Notification>,
    }

    impl Fixture {
        fn new() -> Self {
            let ensemble = Arc::new(Ensemble::default());
            let grant = ensemble.open_session(Duration::from_secs(30)).unwrap();
            Self {
                ensemble,
                session: grant.id,
                notifications: grant.notifications,
            }
        }

        fn cache(&self, scope: WatchScope) -> (Arc<WatchCache>, WatchEvents) {
            WatchCache::new(1, scope, self.session, Arc::clone(&self.ensemble))
        }

        fn create(&self, path: &str, data: &[u8]) {
            self.ensemble
                .create(self.session, path, data.to_vec(), CreateMode::Persistent, true)
                .unwrap();
        }

        /// Hand every pending notification to the cache, like the session's
        /// delivery task does.
        fn pump(&mut self, cache: &WatchCache) {
            while let Ok(n) = self.notifications.try_recv() {
                if let crate::ensemble::Notification::Watch { change, .. } = n {
                    cache.deliver(change);
                }
            }
        }
    }

    fn drain(rx: &mut WatchEvents) -> Vec<WatchEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_state_transitions() {
        let mut state = WatchState::Stopped;
        assert!(state.transition_to(WatchState::Active).is_err());
        assert!(state.transition_to(WatchState::Loading).is_ok());
        assert!(state.transition_to(WatchState::Active).is_ok());
        assert!(state.transition_to(WatchState::Loading).is_err());
        assert!(state.transition_to(WatchState::Stopped).is_ok());
    }

    #[test]
    fn test_start_silent_vs_announced() {
        let fx = Fixture::new();
        fx.create("/app2/d1", b"1");

        let (cache, mut rx) = fx.cache(WatchScope::Children("/app2".into()));
        cache.start(true).unwrap();
        assert_eq!(drain(&mut rx), vec![WatchEvent::Initialized]);
        assert_eq!(cache.entries().len(), 1);

        let (cache, mut rx) = fx.cache(WatchScope::Children("/app2".into()));
        cache.start(false).unwrap();
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], WatchEvent::Added(n) if n.path == "/app2/d1"));
        assert_eq!(events[1], WatchEvent::Initialized);
    }

    #[test]
    fn test_double_start_rejected() {
        let fx = Fixture::new();
        let (cache, _rx) = fx.cache(WatchScope::Node("/app1".into()));
        cache.start(true).unwrap();
        assert!(matches!(
            cache.start(true),
            Err(CoordError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_gap_between_delivery_and_rearm_is_replayed() {
        let mut fx = Fixture::new();
        fx.create("/app1", b"0");
        let (cache, mut rx) = fx.cache(WatchScope::Node("/app1".into()));
        cache.start(true).unwrap();
        drain(&mut rx);

        // Only the first write fires the one-shot watch; the rest land in
        // the gap before the cache rearms.
        for i in 1..=5 {
            fx.ensemble
                .set(fx.session, "/app1", i.to_string().into_bytes(), None)
                .unwrap();
        }
        fx.pump(&cache);

        let versions: Vec<u32> = drain(&mut rx)
            .into_iter()
            .map(|e| match e {
                WatchEvent::Updated { new, .. } => new.stat.version,
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        assert_eq!(versions, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_node_scope_sees_create_and_delete() {
        let mut fx = Fixture::new();
        let (cache, mut rx) = fx.cache(WatchScope::Node("/app1".into()));
        cache.start(true).unwrap();
        drain(&mut rx);

        fx.create("/app1", b"x");
        fx.pump(&cache);
        fx.ensemble.delete(fx.session, "/app1", false).unwrap();
        fx.pump(&cache);

        let events = drain(&mut rx);
        assert!(matches!(&events[0], WatchEvent::Added(n) if n.data == b"x"));
        assert!(matches!(&events[1], WatchEvent::Removed(n) if n.path == "/app1"));
        assert!(cache.get("/app1").is_none());
    }

    #[test]
    fn test_failed_rearm_recovers_without_loss() {
        let mut fx = Fixture::new();
        fx.create("/app1", b"0");
        let (cache, mut rx) = fx.cache(WatchScope::Node("/app1".into()));
        cache.start(true).unwrap();
        drain(&mut rx);

        fx.ensemble.set(fx.session, "/app1", b"1".to_vec(), None).unwrap();
        fx.ensemble.fail_next_requests(1);
        fx.pump(&cache);
        fx.ensemble.set(fx.session, "/app1", b"2".to_vec(), None).unwrap();
        cache.ensure_armed();

        let data: Vec<Vec<u8>> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                WatchEvent::Updated { new, .. } => Some(new.data),
                _ => None,
            })
            .collect();
        assert_eq!(data, vec![b"1".to_vec(), b"2".to_vec()]);
    }

    #[test]
    fn test_resync_emits_difference() {
        let mut inner = CacheInner {
            state: WatchState::Active,
            armed: true,
            last_zxid: 0,
            entries: BTreeMap::new(),
            events: None,
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        inner.events = Some(tx);

        let node = |path: &str, mzxid: Zxid| NodeData {
            path: path.into(),
            data: Vec::new(),
            stat: crate::node::Stat {
                mzxid,
                ..Default::default()
            },
        };
        inner.entries.insert("/a".into(), node("/a", 1));
        inner.entries.insert("/a/x".into(), node("/a/x", 2));
        inner.entries.insert("/b".into(), node("/b", 3));

        inner.resync(vec![node("/a", 1), node("/b", 9), node("/c", 10)]);

        let events = drain(&mut rx);
        assert!(matches!(&events[0], WatchEvent::Removed(n) if n.path == "/a/x"));
        assert!(matches!(&events[1], WatchEvent::Updated { new, .. } if new.path == "/b"));
        assert!(matches!(&events[2], WatchEvent::Added(n) if n.path == "/c"));
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn test_expire_ends_stream() {
        let fx = Fixture::new();
        let (cache, mut rx) = fx.cache(WatchScope::Subtree("/".into()));
        cache.start(true).unwrap();
        drain(&mut rx);

        cache.expire();
        assert_eq!(cache.state(), WatchState::Stopped);
        assert_eq!(drain(&mut rx), vec![WatchEvent::Expired]);
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_close_ends_stream() {
        let fx = Fixture::new();
        let (cache, mut rx) = fx.cache(WatchScope::Subtree("/".into()));
        cache.start(true).unwrap();
        drain(&mut rx);

        cache.close();
        assert_eq!(cache.state(), WatchState::Stopped);
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_value(WatchEvent::Initialized).unwrap();
        assert_eq!(json["type"], "initialized");

        let node = NodeData {
            path: "/app2/d1".into(),
            data: b"12".to_vec(),
            stat: Default::default(),
        };
        let json = serde_json::to_value(WatchEvent::Added(node)).unwrap();
        assert_eq!(json["type"], "added");
        assert_eq!(json["path"], "/app2/d1");
        assert_eq!(json["data"], "12");
    }
}
