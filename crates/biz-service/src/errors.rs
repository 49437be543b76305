//! Signaling node error types.
//!
//! Errors map to numeric reject codes for signaling responses. Internal
//! details are logged server-side but not exposed to clients.

use common::bus::RpcError;
use common::error::ClusterError;
use thiserror::Error;

/// Reject code for frames that fail validation.
pub const CODE_INVALID_FRAME: i32 = -1;

/// Reject reason for a frame without a method.
pub const ERR_INVALID_METHOD: &str = "invalid method";

/// Reject reason for a frame without an object payload.
pub const ERR_INVALID_DATA: &str = "invalid data";

/// Reject reason for an unrecognised method.
pub const ERR_UNKNOWN_METHOD: &str = "unknown method";

/// Signaling node error type.
///
/// Maps to reject codes:
/// - `InvalidMethod`, `InvalidData`, `UnknownMethod`: -1
/// - `NotInRoom`, `StreamNotFound`: 404
/// - `IslbUnavailable`, `SfuUnavailable`: 503
/// - `Rpc`: the remote code
/// - `Cluster`, `Internal`: 500
#[derive(Debug, Error)]
pub enum BizError {
    /// Frame without a method.
    #[error("Invalid method")]
    InvalidMethod,

    /// Frame without an object payload, or a payload missing required fields.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Method not handled by this node.
    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    /// The peer is not in the room named by the request.
    #[error("Peer not in room: {0}")]
    NotInRoom(String),

    /// The presence service does not know the stream.
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    /// No presence service node is reachable.
    #[error("Presence service unavailable")]
    IslbUnavailable,

    /// No media node is reachable.
    #[error("Media node unavailable: {0}")]
    SfuUnavailable(String),

    /// A remote call failed.
    #[error("RPC {method} failed: {source}")]
    Rpc {
        method: &'static str,
        #[source]
        source: RpcError,
    },

    /// Cluster layer failure.
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BizError {
    /// Returns the reject code for this error.
    pub fn error_code(&self) -> i32 {
        match self {
            BizError::InvalidMethod | BizError::InvalidData(_) | BizError::UnknownMethod(_) => {
                CODE_INVALID_FRAME
            }
            BizError::NotInRoom(_) | BizError::StreamNotFound(_) => 404,
            BizError::IslbUnavailable | BizError::SfuUnavailable(_) => 503,
            BizError::Rpc { source, .. } => source.code,
            BizError::Cluster(_) | BizError::Internal(_) => 500,
        }
    }

    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            BizError::InvalidMethod => ERR_INVALID_METHOD.to_string(),
            BizError::InvalidData(_) => ERR_INVALID_DATA.to_string(),
            BizError::UnknownMethod(_) => ERR_UNKNOWN_METHOD.to_string(),
            BizError::NotInRoom(_) => "Not in room".to_string(),
            BizError::StreamNotFound(_) => "Stream not found".to_string(),
            BizError::IslbUnavailable | BizError::SfuUnavailable(_) => {
                "Service temporarily unavailable, please retry".to_string()
            }
            BizError::Rpc { source, .. } if !source.is_transport() && source.code < 500 => {
                source.reason.clone()
            }
            BizError::Rpc { .. } | BizError::Cluster(_) | BizError::Internal(_) => {
                "An internal error occurred".to_string()
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(BizError::InvalidMethod.error_code(), -1);
        assert_eq!(BizError::InvalidData("x".to_string()).error_code(), -1);
        assert_eq!(BizError::UnknownMethod("x".to_string()).error_code(), -1);
        assert_eq!(BizError::NotInRoom("r1".to_string()).error_code(), 404);
        assert_eq!(BizError::IslbUnavailable.error_code(), 503);
        assert_eq!(
            BizError::Rpc {
                method: "getBizInfo",
                source: RpcError::timeout("rpc-dc1-islb"),
            }
            .error_code(),
            408
        );
        assert_eq!(BizError::Internal("boom".to_string()).error_code(), 500);
    }

    #[test]
    fn test_frame_errors_use_fixed_reasons() {
        assert_eq!(BizError::InvalidMethod.client_message(), "invalid method");
        assert_eq!(
            BizError::InvalidData("missing rid".to_string()).client_message(),
            "invalid data"
        );
        assert_eq!(
            BizError::UnknownMethod("dance".to_string()).client_message(),
            "unknown method"
        );
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let err = BizError::Cluster(ClusterError::Store("redis at 10.0.0.5 refused".to_string()));
        assert_eq!(err.client_message(), "An internal error occurred");

        let err = BizError::Rpc {
            method: "publish",
            source: RpcError::internal("panic in sfu-7 at 10.0.0.9"),
        };
        assert!(!err.client_message().contains("10.0.0.9"));

        // Remote business errors are passed through
        let err = BizError::Rpc {
            method: "publish",
            source: RpcError::new(400, "unsupported codec"),
        };
        assert_eq!(err.client_message(), "unsupported codec");
    }
}
