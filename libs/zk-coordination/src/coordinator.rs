//! The coordinator facade.
//!
//! [`CoordinatorBuilder`] wires the client, the session worker, the lock,
//! and the registered shared caches together; [`Coordinator`] is the cheap
//! to clone handle applications use afterwards.

use std::{
    collections::HashSet,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use config::CoordinationConfig;
use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::cache::{CacheHandler, CacheStore, CacheWorker, EntryMetadata, SharedCache};
use crate::client::{ClientError, SessionState, ZkClient};
use crate::error::{CoordinationError, CoordinationResult};
use crate::lock::DistributedLock;
use crate::namespace::Namespace;
use crate::party::Party;
use crate::retry::{RetryPolicy, retry};
use crate::session::{Hook, Hooks, Registry, Session, StateHandler, state_listener};
use crate::signal::Flag;

/// Handle to the session worker task.
pub type WorkerHandle = JoinHandle<CoordinationResult<()>>;

/// Collects hooks and shared caches, then connects.
pub struct CoordinatorBuilder {
    config: CoordinationConfig,
    client: Arc<dyn ZkClient>,
    hooks: Hooks,
    caches: Vec<(String, Arc<dyn CacheHandler>)>,
}

impl CoordinatorBuilder {
    pub fn new(config: CoordinationConfig, client: Arc<dyn ZkClient>) -> Self {
        Self {
            config,
            client,
            hooks: Hooks::default(),
            caches: Vec::new(),
        }
    }

    /// Run `hook` every time a session becomes usable.
    pub fn on_connect<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.hooks.on_connect = Some(Arc::new(hook) as Hook);
        self
    }

    /// Run `hook` every time the session is suspended or lost.
    pub fn on_disconnect<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.hooks.on_disconnect = Some(Arc::new(hook) as Hook);
        self
    }

    /// Register a shared cache at the relative `path`, delivering new and
    /// updated entries to `handler` once [`Coordinator::run_shared_cache_handling`]
    /// is called.
    pub fn shared_cache(mut self, path: impl Into<String>, handler: Arc<dyn CacheHandler>) -> Self {
        self.caches.push((path.into(), handler));
        self
    }

    /// Start the session worker and connect.
    ///
    /// Fails with [`CoordinationError::StartupTimeout`] if no session could be
    /// established within the configured session timeout. The coordinator
    /// reports itself connected only after the worker has finished setting up
    /// the session; use [`Coordinator::wait_connected`] to wait for that.
    pub async fn start(self) -> CoordinationResult<Coordinator> {
        let Self {
            config,
            client,
            hooks,
            caches,
        } = self;
        let namespace = Namespace::new(&config.region, &config.cluster, &config.service_type)?;
        if config.service_id.is_empty() {
            return Err(CoordinationError::Config("service_id is empty".into()));
        }

        let mut seen = HashSet::new();
        let mut shared = Vec::with_capacity(caches.len());
        for (path, handler) in caches {
            if path.is_empty() || path.starts_with('/') {
                return Err(CoordinationError::Config(format!(
                    "shared cache path must be relative: {path:?}"
                )));
            }
            if !seen.insert(path.clone()) {
                return Err(CoordinationError::Config(format!(
                    "shared cache registered twice: {path:?}"
                )));
            }
            shared.push(Arc::new(SharedCache::new(path, handler)));
        }

        let session = Session::new(client.clone());
        let lock_held = Flag::new();
        let registry = Arc::new(Registry::new(shared));

        let (tx, rx) = mpsc::unbounded_channel();
        client.add_listener(state_listener(tx.clone()));
        let handler = StateHandler::new(
            session.clone(),
            lock_held.clone(),
            namespace.clone(),
            registry.clone(),
            hooks,
        );
        let worker = tokio::spawn(handler.run(rx));

        info!(
            hosts = ?config.hosts,
            prefix = namespace.prefix(),
            service_id = %config.service_id,
            "connecting to coordination service"
        );
        let timeout = config.session_timeout;
        match tokio::time::timeout(timeout, client.start(timeout)).await {
            Ok(Ok(())) => {}
            Ok(Err(ClientError::Other(msg))) => {
                worker.abort();
                return Err(CoordinationError::Client(msg));
            }
            Ok(Err(_)) | Err(_) => {
                error!(?timeout, "timed out connecting to coordination service on startup");
                worker.abort();
                return Err(CoordinationError::StartupTimeout(timeout));
            }
        }
        // a client that was already connected emits no transition
        let _ = tx.send(client.state());

        let lock = DistributedLock::new(
            session.clone(),
            lock_held,
            namespace.lock_path(),
            &config.service_id,
        );
        let store = CacheStore::new(session.clone(), namespace.clone());
        let retry_policy = RetryPolicy::from(&config.retry);

        Ok(Coordinator {
            inner: Arc::new(Inner {
                config,
                namespace,
                session,
                lock,
                registry,
                store,
                retry_policy,
                worker: Mutex::new(Some(worker)),
                caches_started: AtomicBool::new(false),
            }),
        })
    }
}

#[derive(Debug)]
struct Inner {
    config: CoordinationConfig,
    namespace: Namespace,
    session: Session,
    lock: DistributedLock,
    registry: Arc<Registry>,
    store: CacheStore,
    retry_policy: RetryPolicy,
    worker: Mutex<Option<WorkerHandle>>,
    caches_started: AtomicBool,
}

/// Session-aware access to the coordination service.
#[derive(Debug, Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn builder(config: CoordinationConfig, client: Arc<dyn ZkClient>) -> CoordinatorBuilder {
        CoordinatorBuilder::new(config, client)
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.inner.config
    }

    pub fn namespace(&self) -> &Namespace {
        &self.inner.namespace
    }

    pub fn service_id(&self) -> &str {
        &self.inner.config.service_id
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// True once a session is established and fully set up.
    pub fn is_connected(&self) -> bool {
        self.inner.session.is_connected()
    }

    /// Wait up to `timeout` (forever if `None`) for a usable session.
    pub async fn wait_connected(&self, timeout: Option<Duration>) -> bool {
        self.inner.session.wait_connected(timeout).await
    }

    /// Raw session state reported by the client.
    pub fn session_state(&self) -> SessionState {
        self.inner.session.state()
    }

    /// Take the session worker handle, for supervision. Only the first call
    /// gets it.
    pub fn state_worker(&self) -> Option<WorkerHandle> {
        self.inner.worker.lock().take()
    }

    /// Ensure `path`, relative to the namespace prefix, exists.
    pub async fn ensure_path(&self, path: &str) -> CoordinationResult<()> {
        self.ensure_abs_path(&self.inner.namespace.resolve(path)).await
    }

    /// Ensure the absolute `path` exists.
    pub async fn ensure_abs_path(&self, path: &str) -> CoordinationResult<()> {
        Ok(self.inner.session.client().ensure_path(path).await?)
    }

    /// Set up (or return the already set up) party under `prefix`, or under
    /// the namespace prefix if `None`. The party is re-joined on every
    /// reconnection when `autojoin` is set.
    pub async fn party_setup(
        &self,
        prefix: Option<&str>,
        autojoin: bool,
    ) -> CoordinationResult<Arc<Party>> {
        if !self.is_connected() {
            return Err(CoordinationError::ConnectionLoss);
        }
        let path = self.inner.namespace.party_path(prefix);
        if let Some(party) = self.inner.registry.party(&path) {
            debug!(path, "party already set up");
            return Ok(party);
        }
        self.ensure_abs_path(&path).await?;
        let party = Party::new(
            self.inner.session.client(),
            path,
            self.service_id(),
            autojoin,
        )
        .await?;
        Ok(self.inner.registry.insert_party(party))
    }

    /// All parties set up so far.
    pub fn parties(&self) -> Vec<Arc<Party>> {
        self.inner.registry.parties()
    }

    pub fn lock(&self) -> &DistributedLock {
        &self.inner.lock
    }

    /// Try to get the lock, waiting up to the configured lock timeout.
    pub async fn get_lock(&self) -> CoordinationResult<bool> {
        self.inner.lock.acquire(self.inner.config.lock_timeout).await
    }

    /// Try to get the lock, waiting up to `timeout` (forever if `None`).
    pub async fn get_lock_within(&self, timeout: Option<Duration>) -> CoordinationResult<bool> {
        self.inner.lock.acquire(timeout).await
    }

    pub async fn release_lock(&self) -> CoordinationResult<()> {
        self.inner.lock.release().await
    }

    pub fn have_lock(&self) -> bool {
        self.inner.lock.have_lock()
    }

    /// Wait until we hold the lock.
    pub async fn wait_lock(&self) {
        self.inner.lock.wait_for_lock().await
    }

    /// Store `value` as entry `name` of the shared cache at `path`.
    pub async fn store_shared_item(
        &self,
        path: &str,
        name: &str,
        value: &[u8],
    ) -> CoordinationResult<()> {
        self.inner.store.store(path, name, value).await
    }

    pub async fn get_shared_item(&self, path: &str, name: &str) -> CoordinationResult<Vec<u8>> {
        self.inner.store.get(path, name).await
    }

    /// Name and last-modified time of every entry in `path`.
    pub async fn get_shared_metadata(&self, path: &str) -> CoordinationResult<Vec<EntryMetadata>> {
        self.inner.store.list_metadata(path).await
    }

    /// Delete entries of `path` last modified before `cutoff` (ms since the
    /// Unix epoch), returning how many were deleted.
    pub async fn expire_shared_items(&self, path: &str, cutoff: i64) -> CoordinationResult<usize> {
        self.inner.store.expire(path, cutoff).await
    }

    /// Shared caches registered at build time.
    pub fn shared_caches(&self) -> &[Arc<SharedCache>] {
        self.inner.registry.caches()
    }

    /// Spawn one worker per registered shared cache. Subsequent calls spawn
    /// nothing.
    pub fn run_shared_cache_handling(&self) -> Vec<WorkerHandle> {
        if self.inner.caches_started.swap(true, Ordering::SeqCst) {
            warn!("shared cache handling already running");
            return Vec::new();
        }
        self.shared_caches()
            .iter()
            .map(|cache| {
                let worker = CacheWorker::new(
                    cache.clone(),
                    self.inner.store.clone(),
                    self.inner.session.clone(),
                    self.inner.config.cache_poll_interval,
                );
                tokio::spawn(worker.run())
            })
            .collect()
    }

    /// Run `op` with the configured retry policy.
    pub async fn retry<T, F, Fut>(&self, description: &str, op: F) -> CoordinationResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CoordinationResult<T>>,
    {
        retry(&self.inner.session, description, self.inner.retry_policy, op).await
    }

    /// Run `op` with an explicit retry policy.
    pub async fn retry_with<T, F, Fut>(
        &self,
        description: &str,
        policy: RetryPolicy,
        op: F,
    ) -> CoordinationResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CoordinationResult<T>>,
    {
        retry(&self.inner.session, description, policy, op).await
    }
}
