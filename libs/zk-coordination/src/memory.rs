//! In-process coordination service.
//!
//! [`MemoryEnsemble`] holds a node tree shared by any number of
//! [`MemoryClient`] sessions, so several coordinators in one process behave
//! like peers talking to the same cluster. It follows ZooKeeper semantics
//! where they matter here: parents must exist for `create`, ephemeral nodes
//! disappear with their session, lock nodes are sequential, and the lock
//! recipe's acquired flag survives session loss just like it does in real
//! client libraries.
//!
//! Session faults are driven explicitly through [`MemoryClient::suspend`],
//! [`MemoryClient::reconnect`] and [`MemoryClient::expire_session`].

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::client::{
    ClientError, ClientResult, LockRecipe, NodeStat, PartyRecipe, SessionState, StateListener,
    ZkClient,
};

const LOCK_NODE_MARKER: &str = "__lock__";
const PARTY_NODE_MARKER: &str = "__party__";

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    stat: NodeStat,
    /// Owning session for ephemeral nodes.
    owner: Option<u64>,
}

#[derive(Debug)]
struct EnsembleInner {
    nodes: Mutex<BTreeMap<String, Node>>,
    changed: Notify,
    /// Manual clock in ms; wall clock when unset.
    clock: Mutex<Option<i64>>,
    online: AtomicBool,
    next_session: AtomicU64,
    next_sequence: AtomicU64,
}

/// Shared node tree standing in for a coordination service cluster.
#[derive(Debug, Clone)]
pub struct MemoryEnsemble {
    inner: Arc<EnsembleInner>,
}

impl MemoryEnsemble {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_owned(),
            Node {
                data: Vec::new(),
                stat: NodeStat::default(),
                owner: None,
            },
        );
        Self {
            inner: Arc::new(EnsembleInner {
                nodes: Mutex::new(nodes),
                changed: Notify::new(),
                clock: Mutex::new(None),
                online: AtomicBool::new(true),
                next_session: AtomicU64::new(1),
                next_sequence: AtomicU64::new(0),
            }),
        }
    }

    /// A new client session against this ensemble. Call `start` to connect.
    pub fn client(&self) -> MemoryClient {
        MemoryClient {
            ensemble: self.clone(),
            session: Arc::new(ClientSession {
                state: Mutex::new(SessionState::Disconnected),
                id: Mutex::new(None),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// While offline, new sessions cannot be established.
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Pin the clock used for node timestamps.
    pub fn set_clock(&self, millis: i64) {
        *self.inner.clock.lock() = Some(millis);
    }

    /// Move the pinned clock forward, pinning it at the current time first if needed.
    pub fn advance_clock(&self, by: Duration) {
        let mut clock = self.inner.clock.lock();
        let now = clock.unwrap_or_else(|| Utc::now().timestamp_millis());
        *clock = Some(now + by.as_millis() as i64);
    }

    /// Current ensemble time in ms since the Unix epoch.
    pub fn now(&self) -> i64 {
        self.inner
            .clock
            .lock()
            .unwrap_or_else(|| Utc::now().timestamp_millis())
    }

    /// Whether `path` currently exists.
    pub fn contains(&self, path: &str) -> bool {
        self.inner.nodes.lock().contains_key(path)
    }

    /// Data stored at `path`, bypassing any session.
    pub fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.nodes.lock().get(path).map(|n| n.data.clone())
    }

    fn notify(&self) {
        self.inner.changed.notify_waiters();
    }

    fn stat(&self, path: &str) -> Option<NodeStat> {
        self.inner.nodes.lock().get(path).map(|n| n.stat)
    }

    fn get_node(&self, path: &str) -> ClientResult<(Vec<u8>, NodeStat)> {
        self.inner
            .nodes
            .lock()
            .get(path)
            .map(|n| (n.data.clone(), n.stat))
            .ok_or_else(|| ClientError::NoNode(path.to_owned()))
    }

    fn create_node(&self, path: &str, data: &[u8], owner: Option<u64>) -> ClientResult<()> {
        validate(path)?;
        let now = self.now();
        {
            let mut nodes = self.inner.nodes.lock();
            if nodes.contains_key(path) {
                return Err(ClientError::NodeExists(path.to_owned()));
            }
            let parent = parent(path);
            match nodes.get(parent) {
                None => return Err(ClientError::NoNode(parent.to_owned())),
                Some(node) if node.owner.is_some() => {
                    return Err(ClientError::Other(format!(
                        "ephemeral node {parent} cannot have children"
                    )));
                }
                Some(_) => {}
            }
            nodes.insert(
                path.to_owned(),
                Node {
                    data: data.to_vec(),
                    stat: NodeStat {
                        created: now,
                        last_modified: now,
                        version: 0,
                    },
                    owner,
                },
            );
        }
        self.notify();
        Ok(())
    }

    fn ensure(&self, path: &str) -> ClientResult<()> {
        validate(path)?;
        let mut current = String::new();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current.push('/');
            current.push_str(component);
            match self.create_node(&current, &[], None) {
                Ok(()) | Err(ClientError::NodeExists(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn set_node(&self, path: &str, data: &[u8]) -> ClientResult<NodeStat> {
        let now = self.now();
        let stat = {
            let mut nodes = self.inner.nodes.lock();
            let node = nodes
                .get_mut(path)
                .ok_or_else(|| ClientError::NoNode(path.to_owned()))?;
            node.data = data.to_vec();
            node.stat.last_modified = now;
            node.stat.version += 1;
            node.stat
        };
        self.notify();
        Ok(stat)
    }

    fn delete_node(&self, path: &str) -> ClientResult<()> {
        {
            let mut nodes = self.inner.nodes.lock();
            if !nodes.contains_key(path) {
                return Err(ClientError::NoNode(path.to_owned()));
            }
            if !children_of(&nodes, path).is_empty() {
                return Err(ClientError::NotEmpty(path.to_owned()));
            }
            nodes.remove(path);
        }
        self.notify();
        Ok(())
    }

    fn list(&self, path: &str) -> ClientResult<Vec<String>> {
        let nodes = self.inner.nodes.lock();
        if !nodes.contains_key(path) {
            return Err(ClientError::NoNode(path.to_owned()));
        }
        Ok(children_of(&nodes, path))
    }

    fn drop_ephemerals(&self, session: u64) {
        let removed = {
            let mut nodes = self.inner.nodes.lock();
            let before = nodes.len();
            nodes.retain(|_, node| node.owner != Some(session));
            before - nodes.len()
        };
        debug!(session, removed, "dropped ephemeral nodes of expired session");
        self.notify();
    }

    fn next_sequence(&self) -> u64 {
        self.inner.next_sequence.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

fn validate(path: &str) -> ClientResult<()> {
    if !path.starts_with('/') || (path.len() > 1 && path.ends_with('/')) || path.contains("//") {
        return Err(ClientError::Other(format!("invalid node path: {path:?}")));
    }
    Ok(())
}

fn parent(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

fn children_of(nodes: &BTreeMap<String, Node>, path: &str) -> Vec<String> {
    let prefix = if path == "/" {
        "/".to_owned()
    } else {
        format!("{path}/")
    };
    nodes
        .range(prefix.clone()..)
        .take_while(|(key, _)| key.starts_with(&prefix))
        .map(|(key, _)| &key[prefix.len()..])
        .filter(|rest| !rest.is_empty() && !rest.contains('/'))
        .map(str::to_owned)
        .collect()
}

struct ClientSession {
    state: Mutex<SessionState>,
    id: Mutex<Option<u64>>,
    listeners: Mutex<Vec<StateListener>>,
}

/// One client session against a [`MemoryEnsemble`].
#[derive(Clone)]
pub struct MemoryClient {
    ensemble: MemoryEnsemble,
    session: Arc<ClientSession>,
}

impl fmt::Debug for MemoryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryClient")
            .field("state", &*self.session.state.lock())
            .field("session_id", &*self.session.id.lock())
            .finish_non_exhaustive()
    }
}

impl MemoryClient {
    pub fn ensemble(&self) -> &MemoryEnsemble {
        &self.ensemble
    }

    /// Drop the connection but keep the session (and its ephemeral nodes).
    pub fn suspend(&self) {
        if *self.session.state.lock() == SessionState::Connected {
            self.transition(SessionState::Suspended);
        }
    }

    /// Re-establish the connection, opening a new session if the old one
    /// expired. Returns false while the ensemble is offline.
    pub fn reconnect(&self) -> bool {
        if !self.ensemble.is_online() {
            return false;
        }
        {
            let mut id = self.session.id.lock();
            if id.is_none() {
                *id = Some(self.ensemble.inner.next_session.fetch_add(1, Ordering::SeqCst));
            }
        }
        self.transition(SessionState::Connected);
        true
    }

    /// Expire the session server-side: its ephemeral nodes are removed and
    /// the client reports `Lost`.
    pub fn expire_session(&self) {
        let id = self.session.id.lock().take();
        if let Some(id) = id {
            self.ensemble.drop_ephemerals(id);
        }
        self.transition(SessionState::Lost);
    }

    fn transition(&self, state: SessionState) {
        *self.session.state.lock() = state;
        trace!(%state, "memory session state change");
        for listener in self.session.listeners.lock().iter() {
            listener(state);
        }
        self.ensemble.notify();
    }

    /// Fails unless the session is connected, returning the session id.
    fn check(&self) -> ClientResult<u64> {
        if *self.session.state.lock() != SessionState::Connected {
            return Err(ClientError::ConnectionLoss);
        }
        (*self.session.id.lock()).ok_or(ClientError::SessionExpired)
    }
}

#[async_trait]
impl ZkClient for MemoryClient {
    async fn start(&self, timeout: Duration) -> ClientResult<()> {
        if self.check().is_ok() {
            return Ok(());
        }
        if !self.ensemble.is_online() {
            tokio::time::sleep(timeout).await;
        }
        if self.reconnect() {
            Ok(())
        } else {
            Err(ClientError::Timeout(timeout))
        }
    }

    fn state(&self) -> SessionState {
        *self.session.state.lock()
    }

    fn session_id(&self) -> Option<u64> {
        *self.session.id.lock()
    }

    fn add_listener(&self, listener: StateListener) {
        self.session.listeners.lock().push(listener);
    }

    async fn ensure_path(&self, path: &str) -> ClientResult<()> {
        tokio::task::yield_now().await;
        self.check()?;
        self.ensemble.ensure(path)
    }

    async fn get(&self, path: &str) -> ClientResult<(Vec<u8>, NodeStat)> {
        tokio::task::yield_now().await;
        self.check()?;
        self.ensemble.get_node(path)
    }

    async fn set(&self, path: &str, data: &[u8]) -> ClientResult<NodeStat> {
        tokio::task::yield_now().await;
        self.check()?;
        self.ensemble.set_node(path, data)
    }

    async fn create(&self, path: &str, data: &[u8]) -> ClientResult<()> {
        tokio::task::yield_now().await;
        self.check()?;
        self.ensemble.create_node(path, data, None)
    }

    async fn delete(&self, path: &str) -> ClientResult<()> {
        tokio::task::yield_now().await;
        self.check()?;
        self.ensemble.delete_node(path)
    }

    async fn exists(&self, path: &str) -> ClientResult<Option<NodeStat>> {
        tokio::task::yield_now().await;
        self.check()?;
        Ok(self.ensemble.stat(path))
    }

    async fn get_children(&self, path: &str) -> ClientResult<Vec<String>> {
        tokio::task::yield_now().await;
        self.check()?;
        self.ensemble.list(path)
    }

    fn lock(&self, path: &str, identifier: &str) -> Box<dyn LockRecipe> {
        Box::new(MemoryLock {
            client: self.clone(),
            path: path.to_owned(),
            identifier: identifier.to_owned(),
            node: Mutex::new(None),
            acquired: AtomicBool::new(false),
        })
    }

    async fn party(&self, path: &str, identifier: &str) -> ClientResult<Box<dyn PartyRecipe>> {
        self.check()?;
        Ok(Box::new(MemoryParty {
            client: self.clone(),
            path: path.to_owned(),
            identifier: identifier.to_owned(),
            node: Mutex::new(None),
        }))
    }
}

/// Sequential-ephemeral-node lock: the lowest sequence number holds it.
#[derive(Debug)]
struct MemoryLock {
    client: MemoryClient,
    path: String,
    identifier: String,
    node: Mutex<Option<String>>,
    acquired: AtomicBool,
}

impl MemoryLock {
    /// Our contender node, reusing the previous one if it is still alive.
    fn contender(&self, session: u64) -> ClientResult<String> {
        let ensemble = &self.client.ensemble;
        let existing = self.node.lock().clone();
        if let Some(node) = existing {
            if ensemble.stat(&node).is_some() {
                return Ok(node);
            }
        }
        let node = format!(
            "{}/{LOCK_NODE_MARKER}{:010}",
            self.path,
            ensemble.next_sequence()
        );
        ensemble.create_node(&node, self.identifier.as_bytes(), Some(session))?;
        *self.node.lock() = Some(node.clone());
        Ok(node)
    }
}

#[async_trait]
impl LockRecipe for MemoryLock {
    async fn acquire(&self, timeout: Option<Duration>) -> ClientResult<bool> {
        let session = self.client.check()?;
        let ensemble = &self.client.ensemble;
        ensemble.ensure(&self.path)?;
        let node = self.contender(session)?;
        let name = node.rsplit('/').next().unwrap_or_default().to_owned();
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            let notified = ensemble.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.client.check()?;
            let mut contenders = ensemble.list(&self.path)?;
            contenders.sort();
            if !contenders.contains(&name) {
                return Err(ClientError::SessionExpired);
            }
            if contenders.first() == Some(&name) {
                self.acquired.store(true, Ordering::SeqCst);
                return Ok(true);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        let _ = ensemble.delete_node(&node);
                        *self.node.lock() = None;
                        return Err(ClientError::LockTimeout(timeout.unwrap_or_default()));
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn release(&self) -> ClientResult<bool> {
        let Some(node) = self.node.lock().take() else {
            return Ok(false);
        };
        if let Err(err) = self.client.check() {
            *self.node.lock() = Some(node);
            return Err(err);
        }
        self.client.ensemble.delete_node(&node)?;
        self.acquired.store(false, Ordering::SeqCst);
        Ok(true)
    }

    fn is_acquired(&self) -> bool {
        self.acquired.load(Ordering::SeqCst)
    }

    fn reset_acquired(&self) {
        self.acquired.store(false, Ordering::SeqCst);
    }
}

/// One ephemeral child per member, carrying the member identifier as data.
#[derive(Debug)]
struct MemoryParty {
    client: MemoryClient,
    path: String,
    identifier: String,
    node: Mutex<Option<String>>,
}

#[async_trait]
impl PartyRecipe for MemoryParty {
    async fn join(&self) -> ClientResult<()> {
        tokio::task::yield_now().await;
        let session = self.client.check()?;
        let ensemble = &self.client.ensemble;
        ensemble.ensure(&self.path)?;
        let existing = self.node.lock().clone();
        if let Some(node) = existing {
            if ensemble.stat(&node).is_some() {
                return Ok(());
            }
        }
        let node = format!(
            "{}/{}{PARTY_NODE_MARKER}",
            self.path,
            uuid::Uuid::new_v4().simple()
        );
        ensemble.create_node(&node, self.identifier.as_bytes(), Some(session))?;
        *self.node.lock() = Some(node);
        Ok(())
    }

    async fn members(&self) -> ClientResult<Vec<String>> {
        tokio::task::yield_now().await;
        self.client.check()?;
        let ensemble = &self.client.ensemble;
        let children = match ensemble.list(&self.path) {
            Ok(children) => children,
            Err(ClientError::NoNode(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        Ok(children
            .iter()
            .filter_map(|child| ensemble.data(&format!("{}/{child}", self.path)))
            .map(|data| String::from_utf8_lossy(&data).into_owned())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected(ensemble: &MemoryEnsemble) -> MemoryClient {
        let client = ensemble.client();
        client.start(Duration::from_secs(1)).await.unwrap();
        client
    }

    #[tokio::test]
    async fn test_crud() {
        let ensemble = MemoryEnsemble::new();
        let client = connected(&ensemble).await;

        assert!(matches!(
            client.create("/a/b", b"x").await,
            Err(ClientError::NoNode(p)) if p == "/a"
        ));
        client.ensure_path("/a").await.unwrap();
        client.create("/a/b", b"x").await.unwrap();
        assert!(matches!(
            client.create("/a/b", b"y").await,
            Err(ClientError::NodeExists(_))
        ));
        let stat = client.set("/a/b", b"y").await.unwrap();
        assert_eq!(stat.version, 1);
        assert_eq!(client.get("/a/b").await.unwrap().0, b"y");
        assert_eq!(client.get_children("/a").await.unwrap(), vec!["b".to_owned()]);
        assert!(matches!(client.delete("/a").await, Err(ClientError::NotEmpty(_))));
        client.delete("/a/b").await.unwrap();
        assert!(client.exists("/a/b").await.unwrap().is_none());
        assert!(matches!(client.delete("/a/b").await, Err(ClientError::NoNode(_))));
    }

    #[tokio::test]
    async fn test_ops_fail_when_not_connected() {
        let ensemble = MemoryEnsemble::new();
        let client = connected(&ensemble).await;
        client.suspend();
        assert!(matches!(
            client.ensure_path("/a").await,
            Err(ClientError::ConnectionLoss)
        ));
        assert!(client.reconnect());
        client.ensure_path("/a").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_times_out_when_offline() {
        let ensemble = MemoryEnsemble::new();
        ensemble.set_online(false);
        let client = ensemble.client();
        assert!(matches!(
            client.start(Duration::from_millis(100)).await,
            Err(ClientError::Timeout(_))
        ));
        assert_eq!(client.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_listeners_see_transitions() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.client();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            client.add_listener(Box::new(move |state| seen.lock().push(state)));
        }
        client.start(Duration::from_secs(1)).await.unwrap();
        client.suspend();
        client.reconnect();
        client.expire_session();
        assert_eq!(
            *seen.lock(),
            vec![
                SessionState::Connected,
                SessionState::Suspended,
                SessionState::Connected,
                SessionState::Lost
            ]
        );
    }

    #[tokio::test]
    async fn test_expiry_drops_ephemerals_and_keeps_stale_lock_flag() {
        let ensemble = MemoryEnsemble::new();
        let client = connected(&ensemble).await;
        let lock = client.lock("/svc/lock", "me");
        assert!(lock.acquire(Some(Duration::from_millis(10))).await.unwrap());
        assert_eq!(client.get_children("/svc/lock").await.unwrap().len(), 1);

        client.expire_session();
        // the recipe still believes it holds the lock
        assert!(lock.is_acquired());
        assert!(client.reconnect());
        assert!(client.get_children("/svc/lock").await.unwrap().is_empty());
        lock.reset_acquired();
        assert!(!lock.is_acquired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_contention() {
        let ensemble = MemoryEnsemble::new();
        let first = connected(&ensemble).await;
        let second = connected(&ensemble).await;
        let lock_a = first.lock("/svc/lock", "a");
        let lock_b = second.lock("/svc/lock", "b");

        assert!(lock_a.acquire(None).await.unwrap());
        assert!(matches!(
            lock_b.acquire(Some(Duration::from_millis(50))).await,
            Err(ClientError::LockTimeout(_))
        ));
        // the timed-out contender cleaned up after itself
        assert_eq!(first.get_children("/svc/lock").await.unwrap().len(), 1);

        let waiter = tokio::spawn(async move { lock_b.acquire(None).await });
        tokio::task::yield_now().await;
        assert!(lock_a.release().await.unwrap());
        assert!(waiter.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_party_membership() {
        let ensemble = MemoryEnsemble::new();
        let first = connected(&ensemble).await;
        let second = connected(&ensemble).await;
        let party_a = first.party("/svc/party", "a").await.unwrap();
        let party_b = second.party("/svc/party", "b").await.unwrap();
        party_a.join().await.unwrap();
        party_a.join().await.unwrap();
        party_b.join().await.unwrap();

        let mut members = party_a.members().await.unwrap();
        members.sort();
        assert_eq!(members, vec!["a".to_owned(), "b".to_owned()]);

        second.expire_session();
        assert_eq!(party_a.members().await.unwrap(), vec!["a".to_owned()]);
    }

    #[tokio::test]
    async fn test_manual_clock() {
        let ensemble = MemoryEnsemble::new();
        ensemble.set_clock(1_000);
        let client = connected(&ensemble).await;
        client.ensure_path("/c").await.unwrap();
        client.create("/c/x", b"").await.unwrap();
        ensemble.advance_clock(Duration::from_millis(500));
        let stat = client.set("/c/x", b"1").await.unwrap();
        assert_eq!(stat.created, 1_000);
        assert_eq!(stat.last_modified, 1_500);
    }
}
