//! Error types for coordination operations.
//!
//! Failures reported by the underlying [`ZkClient`] are translated here into
//! a small taxonomy so callers can tell a transient session problem apart
//! from a missing node or an exhausted retry budget, without ever seeing the
//! client's own error type.
//!
//! [`ZkClient`]: crate::client::ZkClient

use std::time::Duration;

use thiserror::Error;

use crate::client::ClientError;

/// Top-level error type for the zk-coordination crate.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// The session is currently unusable. Always safe to retry.
    #[error("connection to coordination service lost")]
    ConnectionLoss,

    /// The target node does not exist.
    #[error("no such node: {0}")]
    NoNode(String),

    /// The retry budget of an operation was used up.
    #[error("{description}: failed {attempts} times, giving up")]
    RetryLimitExceeded { description: String, attempts: u32 },

    /// The initial session could not be established in time.
    #[error("timed out connecting to coordination service after {0:?}")]
    StartupTimeout(Duration),

    /// Configuration error (e.g. an invalid namespace component).
    #[error("configuration error: {0}")]
    Config(String),

    /// Any other failure reported by the coordination client.
    #[error("coordination client error: {0}")]
    Client(String),
}

impl CoordinationError {
    /// Returns true if this error indicates a transient session failure that
    /// may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoordinationError::ConnectionLoss)
    }

    /// Returns true if the target node was absent.
    pub fn is_no_node(&self) -> bool {
        matches!(self, CoordinationError::NoNode(_))
    }
}

impl From<ClientError> for CoordinationError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::ConnectionLoss | ClientError::SessionExpired | ClientError::Timeout(_) => {
                CoordinationError::ConnectionLoss
            }
            ClientError::NoNode(path) => CoordinationError::NoNode(path),
            other => CoordinationError::Client(other.to_string()),
        }
    }
}

/// Shorthand result alias for coordination operations.
pub type CoordinationResult<T> = Result<T, CoordinationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(CoordinationError::ConnectionLoss.is_retryable());
        assert!(!CoordinationError::ConnectionLoss.is_no_node());

        let no_node = CoordinationError::NoNode("/a/b".into());
        assert!(!no_node.is_retryable());
        assert!(no_node.is_no_node());

        let limit = CoordinationError::RetryLimitExceeded {
            description: "store".into(),
            attempts: 5,
        };
        assert!(!limit.is_retryable());

        assert!(!CoordinationError::StartupTimeout(Duration::from_secs(1)).is_retryable());
        assert!(!CoordinationError::Client("boom".into()).is_retryable());
    }

    #[test]
    fn test_client_error_translation() {
        assert!(matches!(
            CoordinationError::from(ClientError::ConnectionLoss),
            CoordinationError::ConnectionLoss
        ));
        assert!(matches!(
            CoordinationError::from(ClientError::SessionExpired),
            CoordinationError::ConnectionLoss
        ));
        assert!(matches!(
            CoordinationError::from(ClientError::Timeout(Duration::from_millis(10))),
            CoordinationError::ConnectionLoss
        ));
        match CoordinationError::from(ClientError::NoNode("/x".into())) {
            CoordinationError::NoNode(path) => assert_eq!(path, "/x"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            CoordinationError::from(ClientError::NodeExists("/x".into())),
            CoordinationError::Client(_)
        ));
    }

    #[test]
    fn test_error_display() {
        let err = CoordinationError::RetryLimitExceeded {
            description: "storing heartbeat".into(),
            attempts: 5,
        };
        let msg = format!("{err}");
        assert!(msg.contains("storing heartbeat"));
        assert!(msg.contains("failed 5 times"));
    }
}
