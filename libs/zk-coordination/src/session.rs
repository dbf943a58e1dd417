//! Session health and the session worker.
//!
//! The coordination client reports state changes through a callback that
//! must never block, so the callback only forwards the new state over an
//! unbounded channel. A single worker task drains that channel in order and
//! does the actual (I/O-bound) reconciliation: re-creating the namespace and
//! cache roots, re-joining parties, and dropping the lock flag the moment the
//! session becomes unusable.

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::cache::SharedCache;
use crate::client::{SessionState, StateListener, ZkClient};
use crate::error::{CoordinationError, CoordinationResult};
use crate::metrics;
use crate::namespace::Namespace;
use crate::party::Party;
use crate::signal::Flag;

/// Zero-argument callback run from the session worker.
pub type Hook = Arc<dyn Fn() + Send + Sync>;

/// Handle on the client session plus the "usable" flag the worker maintains.
///
/// The flag is only set once everything a fresh session needs (namespace,
/// cache roots, party membership) has been re-established, so it can lag
/// behind the raw client state.
#[derive(Debug, Clone)]
pub struct Session {
    client: Arc<dyn ZkClient>,
    connected: Flag,
}

impl Session {
    pub(crate) fn new(client: Arc<dyn ZkClient>) -> Self {
        Self {
            client,
            connected: Flag::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.is_set()
    }

    /// Wait up to `timeout` (forever if `None`) for a usable session.
    pub async fn wait_connected(&self, timeout: Option<Duration>) -> bool {
        self.connected.wait_timeout(timeout).await
    }

    /// Raw state reported by the client.
    pub fn state(&self) -> SessionState {
        self.client.state()
    }

    pub fn session_id(&self) -> Option<u64> {
        self.client.session_id()
    }

    pub(crate) fn client(&self) -> &Arc<dyn ZkClient> {
        &self.client
    }

    pub(crate) fn connected_flag(&self) -> &Flag {
        &self.connected
    }
}

/// Callbacks invoked after a session becomes usable / unusable.
#[derive(Clone, Default)]
pub(crate) struct Hooks {
    pub(crate) on_connect: Option<Hook>,
    pub(crate) on_disconnect: Option<Hook>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .finish()
    }
}

/// Everything that must be re-initialized when a session is (re)established.
///
/// Caches are fixed at build time; parties can be added at any point and are
/// keyed by their absolute path.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    caches: Vec<Arc<SharedCache>>,
    parties: RwLock<BTreeMap<String, Arc<Party>>>,
}

impl Registry {
    pub(crate) fn new(caches: Vec<Arc<SharedCache>>) -> Self {
        Self {
            caches,
            parties: RwLock::new(BTreeMap::new()),
        }
    }

    pub(crate) fn caches(&self) -> &[Arc<SharedCache>] {
        &self.caches
    }

    /// Snapshot of the registered parties. Never hold the lock across an await.
    pub(crate) fn parties(&self) -> Vec<Arc<Party>> {
        self.parties.read().values().cloned().collect()
    }

    pub(crate) fn party(&self, path: &str) -> Option<Arc<Party>> {
        self.parties.read().get(path).cloned()
    }

    /// Register `party`, returning the already registered one if the path is taken.
    pub(crate) fn insert_party(&self, party: Party) -> Arc<Party> {
        self.parties
            .write()
            .entry(party.path().to_owned())
            .or_insert_with(|| Arc::new(party))
            .clone()
    }
}

/// A state-change listener that only forwards the new state to `tx`.
pub(crate) fn state_listener(tx: mpsc::UnboundedSender<SessionState>) -> StateListener {
    Box::new(move |state| {
        // receiver gone means the worker has exited; nothing left to notify
        let _ = tx.send(state);
    })
}

/// Serialized handler of session state transitions.
#[derive(Debug)]
pub(crate) struct StateHandler {
    session: Session,
    lock_held: Flag,
    namespace: Namespace,
    registry: Arc<Registry>,
    hooks: Hooks,
    last: Option<SessionState>,
}

impl StateHandler {
    pub(crate) fn new(
        session: Session,
        lock_held: Flag,
        namespace: Namespace,
        registry: Arc<Registry>,
        hooks: Hooks,
    ) -> Self {
        Self {
            session,
            lock_held,
            namespace,
            registry,
            hooks,
            last: None,
        }
    }

    /// Process transitions until the listener is dropped.
    ///
    /// Returns an error only when re-establishing a session failed for a
    /// reason other than connection loss; the owner is expected to treat that
    /// as fatal.
    pub(crate) async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<SessionState>,
    ) -> CoordinationResult<()> {
        while let Some(state) = rx.recv().await {
            self.handle(state).await?;
        }
        debug!("state listener dropped, session worker exiting");
        Ok(())
    }

    pub(crate) async fn handle(&mut self, state: SessionState) -> CoordinationResult<()> {
        if self.last == Some(state) {
            trace!(%state, "session state unchanged");
            return Ok(());
        }
        self.last = Some(state);
        metrics::SESSION_TRANSITIONS
            .with_label_values(&[state.to_string().as_str()])
            .inc();
        info!(%state, session_id = ?self.session.session_id(), "session state changed");

        match state {
            SessionState::Connected => self.connected().await,
            SessionState::Suspended | SessionState::Lost | SessionState::Disconnected => {
                self.disconnected();
                Ok(())
            }
        }
    }

    async fn connected(&mut self) -> CoordinationResult<()> {
        match self.establish().await {
            Ok(()) => {
                self.session.connected.set();
                metrics::SESSION_CONNECTED.set(1);
                if let Some(hook) = &self.hooks.on_connect {
                    hook();
                }
                Ok(())
            }
            Err(CoordinationError::ConnectionLoss) => {
                warn!("connection lost while setting up session");
                Ok(())
            }
            Err(err) => {
                error!(?err, "failed to set up session");
                Err(err)
            }
        }
    }

    async fn establish(&self) -> CoordinationResult<()> {
        let client = self.session.client();
        client.ensure_path(self.namespace.prefix()).await?;
        for cache in self.registry.caches() {
            client
                .ensure_path(&self.namespace.resolve(cache.path()))
                .await?;
        }
        for party in self.registry.parties() {
            party.autojoin().await?;
        }
        Ok(())
    }

    fn disconnected(&self) {
        self.session.connected.clear();
        self.lock_held.clear();
        metrics::SESSION_CONNECTED.set(0);
        metrics::LOCK_HELD.set(0);
        for cache in self.registry.caches() {
            cache.synced_flag().clear();
        }
        if let Some(hook) = &self.hooks.on_disconnect {
            hook();
        }
    }
}
