//! Coordination metrics.
//!
//! Metrics are lazily initialized on first access via `lazy_static!`.
//! Registration failures are fatal: they can only come from a duplicate
//! metric name, which is a programming error.

use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{
    IntCounter, IntCounterVec, IntGauge, register_int_counter, register_int_counter_vec,
    register_int_gauge,
};

lazy_static! {
    /// When the process started, for [`UPTIME`]
    pub static ref START_TIME: Instant = Instant::now();

    /// Process uptime, refreshed whenever metrics are scraped
    pub static ref UPTIME: IntGauge = register_int_gauge!("uptime", "process uptime (seconds)").unwrap();

    /// Session state transitions processed by the session worker, by new state
    pub static ref SESSION_TRANSITIONS: IntCounterVec = register_int_counter_vec!(
        "coordination_session_transitions",
        "count of session state transitions processed",
        &["state"]
    ).unwrap();

    /// 1 while the coordinator considers its session usable
    pub static ref SESSION_CONNECTED: IntGauge = register_int_gauge!(
        "coordination_session_connected",
        "whether the coordination session is connected (1) or not (0)"
    ).unwrap();

    /// Successful lock acquisitions
    pub static ref LOCK_ACQUISITIONS: IntCounter = register_int_counter!(
        "coordination_lock_acquisitions",
        "count of successful lock acquisitions"
    ).unwrap();

    /// 1 while this instance holds the lock
    pub static ref LOCK_HELD: IntGauge = register_int_gauge!(
        "coordination_lock_held",
        "whether this instance holds the lock (1) or not (0)"
    ).unwrap();

    /// Retries caused by a lost connection or a failed wait for one
    pub static ref RETRY_ATTEMPTS: IntCounter = register_int_counter!(
        "coordination_retry_attempts",
        "count of operation attempts retried due to connection problems"
    ).unwrap();

    /// Operations that exhausted their retry budget
    pub static ref RETRY_EXHAUSTED: IntCounter = register_int_counter!(
        "coordination_retry_exhausted",
        "count of operations that hit their retry limit"
    ).unwrap();

    /// Shared-cache entries handed to handlers, by cache path
    pub static ref CACHE_ENTRIES_PROCESSED: IntCounterVec = register_int_counter_vec!(
        "coordination_cache_entries_processed",
        "count of new/updated shared cache entries delivered to handlers",
        &["path"]
    ).unwrap();

    /// Full re-reads of a shared cache after losing sync, by cache path
    pub static ref CACHE_RESYNCS: IntCounterVec = register_int_counter_vec!(
        "coordination_cache_resyncs",
        "count of full shared cache re-reads after losing sync",
        &["path"]
    ).unwrap();

    /// Shared-cache entries deleted by expiry, by cache path
    pub static ref CACHE_ENTRIES_EXPIRED: IntCounterVec = register_int_counter_vec!(
        "coordination_cache_entries_expired",
        "count of shared cache entries removed by expiry",
        &["path"]
    ).unwrap();
}
