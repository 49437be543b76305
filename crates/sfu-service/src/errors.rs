//! Media node error types.
//!
//! Errors returned over RPC carry a numeric code (see
//! [`SfuError::error_code`]) and a client-safe reason.

use common::bus::{RpcError, CODE_BAD_REQUEST, CODE_INTERNAL, CODE_NO_RESPONDER};
use common::error::ClusterError;
use thiserror::Error;

/// Media node error type.
#[derive(Debug, Error)]
pub enum SfuError {
    /// The publisher's packet queue is closed.
    #[error("Packet queue closed")]
    ChannelClosed,

    /// The transport session is gone.
    #[error("Transport session absent")]
    SessionAbsent,

    /// Session description exchange failed.
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Transport-layer failure (session creation, RTCP write).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed RPC request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No publisher with this id.
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    /// Cluster layer failure.
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),
}

impl SfuError {
    /// Numeric code returned to RPC callers.
    pub fn error_code(&self) -> i32 {
        match self {
            SfuError::InvalidRequest(_) | SfuError::Negotiation(_) => CODE_BAD_REQUEST,
            SfuError::StreamNotFound(_) => CODE_NO_RESPONDER,
            SfuError::ChannelClosed
            | SfuError::SessionAbsent
            | SfuError::Transport(_)
            | SfuError::Cluster(_) => CODE_INTERNAL,
        }
    }

    /// Reason safe to return to RPC callers.
    pub fn client_message(&self) -> String {
        match self {
            SfuError::InvalidRequest(reason) => format!("invalid request: {reason}"),
            SfuError::Negotiation(_) => "negotiation failed".to_string(),
            SfuError::StreamNotFound(mid) => format!("stream {mid} not found"),
            SfuError::ChannelClosed
            | SfuError::SessionAbsent
            | SfuError::Transport(_)
            | SfuError::Cluster(_) => "internal error".to_string(),
        }
    }
}

impl From<SfuError> for RpcError {
    fn from(err: SfuError) -> Self {
        RpcError::new(err.error_code(), err.client_message())
    }
}

impl From<webrtc::Error> for SfuError {
    fn from(err: webrtc::Error) -> Self {
        SfuError::Transport(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(SfuError::InvalidRequest("x".into()).error_code(), 400);
        assert_eq!(SfuError::Negotiation("bad sdp".into()).error_code(), 400);
        assert_eq!(SfuError::StreamNotFound("m1".into()).error_code(), 404);
        assert_eq!(SfuError::ChannelClosed.error_code(), 500);
        assert_eq!(SfuError::SessionAbsent.error_code(), 500);
    }

    #[test]
    fn test_internal_details_hidden() {
        let err = SfuError::Transport("ice agent exploded at 10.0.0.3".into());
        assert_eq!(err.client_message(), "internal error");

        let err = SfuError::Negotiation("parse error at line 3".into());
        let rpc: RpcError = err.into();
        assert_eq!(rpc.code, 400);
        assert_eq!(rpc.reason, "negotiation failed");
    }
}
