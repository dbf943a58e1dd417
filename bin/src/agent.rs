//! Background work the agent runs on top of the coordinator.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use config::PartyConfig;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zk_coordination::{CacheHandler, CoordinationError, Coordinator, Party};

/// Logs every entry delivered by a cache worker.
#[derive(Debug, Default)]
pub struct LogHandler;

#[async_trait]
impl CacheHandler for LogHandler {
    async fn handle(&self, path: &str, entries: Vec<Vec<u8>>) {
        for entry in &entries {
            debug!(path, entry = %String::from_utf8_lossy(entry), "shared cache entry");
        }
        info!(path, count = entries.len(), "shared cache entries received");
    }
}

/// Set up the configured party. Membership follows `autojoin` only, so a
/// non-autojoin instance watches the party without joining it.
pub async fn setup_party(coordinator: &Coordinator, cfg: &PartyConfig) -> Result<Arc<Party>> {
    let party = coordinator
        .party_setup(cfg.prefix.as_deref(), cfg.autojoin)
        .await?;
    if cfg.autojoin {
        info!(party = party.path(), "joined party");
    } else {
        info!(party = party.path(), "watching party without joining");
    }
    Ok(party)
}

/// Session trouble is expected and only logged, everything else ends the task.
fn tolerate(what: &str, err: CoordinationError) -> Result<()> {
    match err {
        CoordinationError::ConnectionLoss | CoordinationError::RetryLimitExceeded { .. } => {
            warn!(?err, "{what} skipped");
            Ok(())
        }
        err => Err(err.into()),
    }
}

/// Publish `<service_id> = <now ms>` into every shared cache each `interval`.
pub fn spawn_heartbeat(
    coordinator: Coordinator,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("heartbeat task stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(err) = heartbeat(&coordinator).await {
                        tolerate("heartbeat", err)?;
                    }
                }
            }
        }
    })
}

pub async fn heartbeat(coordinator: &Coordinator) -> Result<(), CoordinationError> {
    let stamp = Utc::now().timestamp_millis().to_string();
    let value = stamp.as_bytes();
    let id = coordinator.service_id();
    for cache in coordinator.shared_caches() {
        let path = cache.path();
        coordinator
            .retry("heartbeat", move || {
                coordinator.store_shared_item(path, id, value)
            })
            .await?;
    }
    Ok(())
}

/// Contend for the lock each `interval`; the holder expires stale entries.
pub fn spawn_maintenance(
    coordinator: Coordinator,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("maintenance task stopping");
                    if coordinator.have_lock() {
                        if let Err(err) = coordinator.release_lock().await {
                            warn!(?err, "failed to release lock on shutdown");
                        }
                    }
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(err) = maintenance(&coordinator).await {
                        tolerate("maintenance", err)?;
                    }
                }
            }
        }
    })
}

/// Returns the number of expired entries, 0 when another instance holds the lock.
pub async fn maintenance(coordinator: &Coordinator) -> Result<usize, CoordinationError> {
    if !coordinator.have_lock() && !coordinator.get_lock().await? {
        debug!("lock held elsewhere, skipping expiry");
        return Ok(0);
    }
    let now = Utc::now().timestamp_millis();
    let mut total = 0;
    for cache in &coordinator.config().shared_caches {
        let Some(expire_after) = cache.expire_after else {
            continue;
        };
        let cutoff = now - expire_after.as_millis() as i64;
        let path = cache.path.as_str();
        let count = coordinator
            .retry("expire shared items", move || {
                coordinator.expire_shared_items(path, cutoff)
            })
            .await?;
        if count > 0 {
            info!(path, count, "expired shared cache entries");
        }
        total += count;
    }
    Ok(total)
}
