//! Retry-on-connection-loss executor.
//!
//! Only [`CoordinationError::ConnectionLoss`] is retried. Every attempt first
//! waits for a usable session; an attempt whose wait times out is used up
//! without running the operation at all.

use std::{future::Future, time::Duration};

use tracing::{debug, warn};

use crate::error::{CoordinationError, CoordinationResult};
use crate::metrics;
use crate::session::Session;

pub const DEFAULT_MAX_RETRIES: u32 = 4;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How persistently to retry an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `None` retries forever.
    pub max_retries: Option<u32>,
    /// How long each attempt waits for a usable session; `None` waits forever.
    pub connect_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: Some(DEFAULT_MAX_RETRIES),
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
        }
    }
}

impl From<&config::RetryConfig> for RetryPolicy {
    fn from(cfg: &config::RetryConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            connect_timeout: cfg.connect_timeout,
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up.
pub async fn retry<T, F, Fut>(
    session: &Session,
    description: &str,
    policy: RetryPolicy,
    mut op: F,
) -> CoordinationResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CoordinationResult<T>>,
{
    let mut attempts: u32 = 0;
    loop {
        if let Some(max) = policy.max_retries {
            if attempts > max {
                break;
            }
        }
        attempts += 1;

        if !session.wait_connected(policy.connect_timeout).await {
            warn!(description, attempts, "no connection to coordination service");
            metrics::RETRY_ATTEMPTS.inc();
            continue;
        }
        match op().await {
            Err(CoordinationError::ConnectionLoss) => {
                debug!(description, attempts, "connection lost, retrying");
                metrics::RETRY_ATTEMPTS.inc();
            }
            result => return result,
        }
    }

    metrics::RETRY_EXHAUSTED.inc();
    warn!(description, attempts, "giving up");
    Err(CoordinationError::RetryLimitExceeded {
        description: description.to_owned(),
        attempts,
    })
}
