//! Common error types for the cluster coordination layer.

use thiserror::Error;

/// Errors raised by the registry, discovery, bus and coordinator.
///
/// `HandlerUnavailable` is the soft "no node qualifies" outcome of a lookup;
/// callers retry or degrade rather than fail.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Coordination store operation failed.
    #[error("Store error: {0}")]
    Store(String),

    /// Message bus operation failed.
    #[error("Bus error: {0}")]
    Bus(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No live node (or no RPC handle) satisfies the lookup.
    #[error("Handler unavailable: {0}")]
    HandlerUnavailable(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClusterError {
    /// Whether the caller should treat this as a soft, retryable condition.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClusterError::HandlerUnavailable(_) | ClusterError::Store(_) | ClusterError::Bus(_)
        )
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::Serialization(err.to_string())
    }
}

impl From<redis::RedisError> for ClusterError {
    fn from(err: redis::RedisError) -> Self {
        ClusterError::Store(err.to_string())
    }
}

/// Result type alias using `ClusterError`
pub type Result<T> = std::result::Result<T, ClusterError>;
