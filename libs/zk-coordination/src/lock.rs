//! Session-reconciled distributed lock.
//!
//! Client lock recipes keep claiming to hold a lock after their session has
//! died, which is an instant split-brain for anything relying on the lock.
//! The authoritative held flag therefore lives here and is cleared by the
//! session worker the moment the session is suspended or lost; the recipe's
//! own flag is treated as untrusted and force-reset on every release.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::client::{ClientError, LockRecipe};
use crate::error::CoordinationResult;
use crate::metrics;
use crate::session::Session;
use crate::signal::Flag;

/// The single mutual-exclusion lock of a coordinator.
#[derive(Debug)]
pub struct DistributedLock {
    recipe: Box<dyn LockRecipe>,
    session: Session,
    held: Flag,
    path: String,
}

impl DistributedLock {
    pub(crate) fn new(session: Session, held: Flag, path: String, identifier: &str) -> Self {
        let recipe = session.client().lock(&path, identifier);
        Self {
            recipe,
            session,
            held,
            path,
        }
    }

    /// Absolute path of the lock node.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Try to get the lock, waiting up to `timeout` (forever if `None`).
    ///
    /// Returns immediately if the lock is already held. Failing to get the
    /// lock, whether by timeout or by connection loss, is reported as
    /// `Ok(false)`; only unexpected client errors are returned as errors.
    pub async fn acquire(&self, timeout: Option<Duration>) -> CoordinationResult<bool> {
        if !self.session.is_connected() {
            self.release().await?;
            return Ok(false);
        }
        if self.held.is_set() {
            return Ok(true);
        }
        match self.recipe.acquire(timeout).await {
            Ok(true) => {
                self.held.set();
                // the session may have dropped while we were waiting
                if !self.session.is_connected() {
                    self.held.clear();
                    // give the node back if the client can still reach it
                    if let Err(err) = self.recipe.release().await {
                        debug!(path = %self.path, ?err, "could not release lock won after session loss");
                    }
                    self.recipe.reset_acquired();
                } else {
                    metrics::LOCK_ACQUISITIONS.inc();
                    metrics::LOCK_HELD.set(1);
                    info!(path = %self.path, "acquired lock");
                }
            }
            Ok(false) => {}
            Err(ClientError::LockTimeout(waited)) => {
                debug!(path = %self.path, ?waited, "lock acquisition timed out");
            }
            Err(err) if err.is_connection_loss() => {
                debug!(path = %self.path, ?err, "connection lost while acquiring lock");
            }
            Err(err) => return Err(err.into()),
        }
        Ok(self.have_lock())
    }

    /// Give up the lock.
    ///
    /// The local flag is cleared unconditionally; the recipe is only asked to
    /// release while connected, and a missing node or lost connection count
    /// as already released.
    pub async fn release(&self) -> CoordinationResult<()> {
        self.held.clear();
        metrics::LOCK_HELD.set(0);
        let result = if self.session.is_connected() {
            match self.recipe.release().await {
                Ok(_) => Ok(()),
                Err(ClientError::NoNode(_)) => Ok(()),
                Err(err) if err.is_connection_loss() => Ok(()),
                Err(err) => {
                    warn!(path = %self.path, ?err, "unexpected error releasing lock");
                    Err(err.into())
                }
            }
        } else {
            Ok(())
        };
        self.recipe.reset_acquired();
        result
    }

    /// True only while both connected and holding the lock.
    pub fn have_lock(&self) -> bool {
        self.session.is_connected() && self.held.is_set()
    }

    /// Wait until the lock is held.
    pub async fn wait_for_lock(&self) {
        self.held.wait().await
    }
}
