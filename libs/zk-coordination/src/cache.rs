//! Shared key/value cache.
//!
//! Entries are child nodes of a cache path; the node's last-modified time is
//! the only ordering information. Each registered cache path gets a worker
//! that polls the listing, remembers the newest modification time it has
//! handed out (the high-water mark), and forwards only entries newer than
//! that to its [`CacheHandler`]. Whenever the worker falls out of sync the
//! mark drops back to zero and the whole cache is delivered again.

use std::{fmt, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::client::ClientError;
use crate::error::{CoordinationError, CoordinationResult};
use crate::metrics;
use crate::namespace::Namespace;
use crate::session::Session;
use crate::signal::Flag;

/// Default delay between two polls of a cache path.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Cache operations slower than this are logged.
const SLOW_OPERATION: Duration = Duration::from_secs(1);

/// Receives batches of new or updated entry values.
#[async_trait]
pub trait CacheHandler: Send + Sync + 'static {
    /// `path` is the cache path as registered, `entries` the raw values.
    async fn handle(&self, path: &str, entries: Vec<Vec<u8>>);
}

/// Name and last-modified time (ms since the Unix epoch) of one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMetadata {
    pub name: String,
    pub last_modified: i64,
}

/// Entry-level cache operations, all addressed by relative cache path.
#[derive(Debug, Clone)]
pub(crate) struct CacheStore {
    session: Session,
    namespace: Namespace,
}

impl CacheStore {
    pub(crate) fn new(session: Session, namespace: Namespace) -> Self {
        Self { session, namespace }
    }

    /// Write `value` as entry `name`, creating the entry if needed.
    ///
    /// Losing a create race to another writer counts as success: the other
    /// value is just as recent as ours.
    pub(crate) async fn store(&self, path: &str, name: &str, value: &[u8]) -> CoordinationResult<()> {
        if !self.session.is_connected() {
            return Err(CoordinationError::ConnectionLoss);
        }
        let node = self.namespace.entry(path, name);
        let client = self.session.client();
        match client.set(&node, value).await {
            Ok(_) => return Ok(()),
            Err(ClientError::NoNode(_)) => {}
            Err(err) => return Err(err.into()),
        }
        match client.create(&node, value).await {
            Ok(()) => Ok(()),
            Err(ClientError::NodeExists(_)) => {
                debug!(node, "entry created concurrently, keeping the other write");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) async fn get(&self, path: &str, name: &str) -> CoordinationResult<Vec<u8>> {
        if !self.session.is_connected() {
            return Err(CoordinationError::ConnectionLoss);
        }
        let node = self.namespace.entry(path, name);
        let (data, _) = self.session.client().get(&node).await?;
        Ok(data)
    }

    /// Metadata of every entry under `path`; empty when disconnected.
    pub(crate) async fn list_metadata(&self, path: &str) -> CoordinationResult<Vec<EntryMetadata>> {
        if !self.session.is_connected() {
            return Ok(Vec::new());
        }
        let root = self.namespace.resolve(path);
        timed("listing shared cache entries", &root, async {
            let client = self.session.client();
            let mut entries = Vec::new();
            for name in client.get_children(&root).await? {
                // entries deleted since the listing are skipped
                if let Some(stat) = client.exists(&self.namespace.entry(path, &name)).await? {
                    entries.push(EntryMetadata {
                        name,
                        last_modified: stat.last_modified,
                    });
                }
            }
            Ok::<_, CoordinationError>(entries)
        })
        .await
    }

    /// Delete entries not modified since `cutoff` (ms since the Unix epoch),
    /// returning how many were deleted.
    pub(crate) async fn expire(&self, path: &str, cutoff: i64) -> CoordinationResult<usize> {
        if !self.session.is_connected() {
            return Ok(0);
        }
        let root = self.namespace.resolve(path);
        let count = timed("expiring shared cache entries", &root, async {
            let mut count = 0;
            for entry in self.list_metadata(path).await? {
                if entry.last_modified < cutoff {
                    self.session
                        .client()
                        .delete(&self.namespace.entry(path, &entry.name))
                        .await?;
                    count += 1;
                }
            }
            Ok::<usize, CoordinationError>(count)
        })
        .await?;
        if count > 0 {
            metrics::CACHE_ENTRIES_EXPIRED
                .with_label_values(&[path])
                .inc_by(count as u64);
            debug!(path, count, cutoff, "expired shared cache entries");
        }
        Ok(count)
    }
}

/// Run `fut`, warning if it took longer than [`SLOW_OPERATION`].
async fn timed<T>(description: &str, path: &str, fut: impl Future<Output = T>) -> T {
    let start = Instant::now();
    let out = fut.await;
    let elapsed = start.elapsed();
    if elapsed > SLOW_OPERATION {
        warn!(description, path, ?elapsed, "slow shared cache operation");
    }
    out
}

/// A registered cache path together with its handler and sync flag.
pub struct SharedCache {
    path: String,
    handler: Arc<dyn CacheHandler>,
    synced: Flag,
}

impl fmt::Debug for SharedCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedCache")
            .field("path", &self.path)
            .field("synced", &self.synced.is_set())
            .finish_non_exhaustive()
    }
}

impl SharedCache {
    pub(crate) fn new(path: String, handler: Arc<dyn CacheHandler>) -> Self {
        Self {
            path,
            handler,
            synced: Flag::new(),
        }
    }

    /// Cache path relative to the namespace prefix.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether the worker has caught up with the stored entries.
    pub fn is_synced(&self) -> bool {
        self.synced.is_set()
    }

    /// Wait up to `timeout` for the worker to catch up.
    pub async fn wait_synced(&self, timeout: Option<Duration>) -> bool {
        self.synced.wait_timeout(timeout).await
    }

    pub(crate) fn synced_flag(&self) -> &Flag {
        &self.synced
    }
}

/// Split `entries` into the names modified after `mark`, and the new mark.
pub(crate) fn partition_new(entries: &[EntryMetadata], mark: i64) -> (Vec<String>, i64) {
    let mut newest = mark;
    let mut new = Vec::new();
    for entry in entries {
        if entry.last_modified > mark {
            new.push(entry.name.clone());
        }
        newest = newest.max(entry.last_modified);
    }
    (new, newest)
}

/// Background synchronizer of one cache path.
#[derive(Debug)]
pub(crate) struct CacheWorker {
    cache: Arc<SharedCache>,
    store: CacheStore,
    session: Session,
    poll_interval: Duration,
    latest: i64,
}

impl CacheWorker {
    pub(crate) fn new(
        cache: Arc<SharedCache>,
        store: CacheStore,
        session: Session,
        poll_interval: Duration,
    ) -> Self {
        Self {
            cache,
            store,
            session,
            poll_interval,
            latest: 0,
        }
    }

    /// Poll forever. Only returns on an unexpected (non connection-loss) error.
    pub(crate) async fn run(mut self) -> CoordinationResult<()> {
        let path = self.cache.path.clone();
        debug!(path, "starting shared cache worker");
        loop {
            if !self.session.is_connected() {
                self.cache.synced.clear();
                self.session.wait_connected(None).await;
            } else {
                tokio::time::sleep(self.poll_interval).await;
            }
            if !self.cache.synced.is_set() && self.latest != 0 {
                // re-read everything
                debug!(path, "shared cache out of sync, rescanning");
                metrics::CACHE_RESYNCS
                    .with_label_values(&[path.as_str()])
                    .inc();
                self.latest = 0;
            }

            match self.read_step().await {
                Ok(count) => {
                    if count > 0 {
                        debug!(path, count, "processed new/updated shared cache entries");
                    }
                    self.cache.synced.set();
                }
                Err(CoordinationError::ConnectionLoss) => {
                    self.cache.synced.clear();
                }
                Err(err) => {
                    warn!(path, ?err, "shared cache worker failed");
                    return Err(err);
                }
            }
        }
    }

    /// Deliver every entry newer than the high-water mark, returning how many
    /// were delivered.
    ///
    /// A connection loss while fetching still delivers what was fetched so
    /// far, then surfaces as [`CoordinationError::ConnectionLoss`].
    pub(crate) async fn read_step(&mut self) -> CoordinationResult<usize> {
        if !self.session.is_connected() {
            return Err(CoordinationError::ConnectionLoss);
        }
        let path = self.cache.path.as_str();
        let entries = self.store.list_metadata(path).await?;
        if entries.is_empty() {
            return Ok(0);
        }
        let (new, newest) = partition_new(&entries, self.latest);
        self.latest = newest;
        trace!(path, new = new.len(), latest = newest, "shared cache listing");

        let mut values = Vec::with_capacity(new.len());
        let mut lost = false;
        let fetch = timed("fetching shared cache entries", path, async {
            for name in &new {
                match self.store.get(path, name).await {
                    Ok(value) => values.push(value),
                    Err(CoordinationError::NoNode(_)) => {
                        debug!(path, name, "shared cache entry vanished before it was read");
                    }
                    Err(CoordinationError::ConnectionLoss) => {
                        warn!(path, "unable to fetch shared cache entries: connection lost");
                        lost = true;
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
            Ok(())
        });
        fetch.await?;

        let count = values.len();
        if count > 0 {
            metrics::CACHE_ENTRIES_PROCESSED
                .with_label_values(&[path])
                .inc_by(count as u64);
            self.cache.handler.handle(path, values).await;
        }
        if lost {
            return Err(CoordinationError::ConnectionLoss);
        }
        Ok(count)
    }
}
