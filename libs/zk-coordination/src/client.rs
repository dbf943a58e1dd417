//! Capability surface required from the underlying coordination service client.
//!
//! The session/watch machinery and the wire protocol live behind [`ZkClient`].
//! Everything above this module only talks to the trait, which keeps the
//! session reconciliation logic independent of any particular client library.
//! [`crate::memory`] provides an in-process implementation.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

/// Session state as reported by the coordination client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No session has been established yet, or the client was shut down.
    Disconnected,
    /// Session is live.
    Connected,
    /// Connection dropped; the session may still be alive server-side.
    Suspended,
    /// Session expired; all ephemeral state owned by it is gone.
    Lost,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Suspended => write!(f, "suspended"),
            SessionState::Lost => write!(f, "lost"),
        }
    }
}

/// Node metadata returned by `exists`/`get`/`set`.
///
/// Timestamps are milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeStat {
    pub created: i64,
    pub last_modified: i64,
    pub version: u32,
}

/// Errors raised by the coordination client itself.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection lost")]
    ConnectionLoss,
    #[error("session expired")]
    SessionExpired,
    #[error("no node: {0}")]
    NoNode(String),
    #[error("node exists: {0}")]
    NodeExists(String),
    #[error("node not empty: {0}")]
    NotEmpty(String),
    #[error("lock not acquired within {0:?}")]
    LockTimeout(Duration),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Other(String),
}

impl ClientError {
    /// Connection loss and session expiry both mean "the session is unusable right now".
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, ClientError::ConnectionLoss | ClientError::SessionExpired)
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Session state-change callback.
///
/// Called on the client's event-delivery path: implementations must return
/// immediately, blocking here stalls every later notification.
pub type StateListener = Box<dyn Fn(SessionState) + Send + Sync>;

/// Coordination service client: one session, node CRUD and two recipes.
#[async_trait]
pub trait ZkClient: Send + Sync + fmt::Debug + 'static {
    /// Establish the session, failing with [`ClientError::Timeout`] if it
    /// cannot be established within `timeout`.
    async fn start(&self, timeout: Duration) -> ClientResult<()>;

    /// Current session state.
    fn state(&self) -> SessionState;

    /// Identifier of the current session, if any.
    fn session_id(&self) -> Option<u64>;

    /// Register a state-change callback.
    fn add_listener(&self, listener: StateListener);

    /// Create `path` and all of its missing ancestors.
    async fn ensure_path(&self, path: &str) -> ClientResult<()>;

    async fn get(&self, path: &str) -> ClientResult<(Vec<u8>, NodeStat)>;

    /// Overwrite an existing node.
    async fn set(&self, path: &str, data: &[u8]) -> ClientResult<NodeStat>;

    /// Create a persistent node. The parent must exist.
    async fn create(&self, path: &str, data: &[u8]) -> ClientResult<()>;

    async fn delete(&self, path: &str) -> ClientResult<()>;

    async fn exists(&self, path: &str) -> ClientResult<Option<NodeStat>>;

    async fn get_children(&self, path: &str) -> ClientResult<Vec<String>>;

    /// Mutual-exclusion lock recipe rooted at `path`. Does no I/O.
    fn lock(&self, path: &str, identifier: &str) -> Box<dyn LockRecipe>;

    /// Group-membership recipe rooted at `path`.
    async fn party(&self, path: &str, identifier: &str) -> ClientResult<Box<dyn PartyRecipe>>;
}

/// Client-side distributed lock primitive.
///
/// The `is_acquired` flag is the recipe's own bookkeeping and is not updated
/// when the session dies underneath it.
#[async_trait]
pub trait LockRecipe: Send + Sync + fmt::Debug {
    /// Wait up to `timeout` (forever if `None`) for the lock.
    async fn acquire(&self, timeout: Option<Duration>) -> ClientResult<bool>;

    async fn release(&self) -> ClientResult<bool>;

    fn is_acquired(&self) -> bool;

    /// Force the internal acquired flag back to false.
    fn reset_acquired(&self);
}

/// Client-side group-membership primitive.
#[async_trait]
pub trait PartyRecipe: Send + Sync + fmt::Debug {
    /// Register this process as a member. Joining twice is a no-op.
    async fn join(&self) -> ClientResult<()>;

    /// Identifiers of all current members.
    async fn members(&self) -> ClientResult<Vec<String>>;
}
