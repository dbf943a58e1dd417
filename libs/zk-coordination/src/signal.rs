//! Binary set/clear/wait signal shared between the session worker and callers.

use std::{sync::Arc, time::Duration};

use tokio::sync::watch;

/// A boolean that can be waited on.
///
/// Cloning yields another handle to the same signal.
#[derive(Debug, Clone)]
pub struct Flag {
    tx: Arc<watch::Sender<bool>>,
}

impl Flag {
    /// A new, cleared flag.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the flag is set. Returns immediately if it already is.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|set| *set).await;
    }

    /// Wait until the flag is set or `timeout` elapses, returning whether it
    /// is set. `None` waits forever.
    pub async fn wait_timeout(&self, timeout: Option<Duration>) -> bool {
        match timeout {
            None => {
                self.wait().await;
                true
            }
            Some(timeout) => tokio::time::timeout(timeout, self.wait()).await.is_ok(),
        }
    }
}

impl Default for Flag {
    fn default() -> Self {
        Self::new()
    }
}
