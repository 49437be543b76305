//! Client signaling.
//!
//! Frames are JSON objects in one of three shapes:
//!
//! ```text
//! request:      {"request": true, "id": 1, "method": "join", "data": {...}}
//! response:     {"response": true, "id": 1, "ok": true, "data": {...}}
//!               {"response": true, "id": 1, "ok": false, "errorCode": -1, "errorReason": "invalid method"}
//! notification: {"notification": true, "method": "peer-join", "data": {...}}
//! ```
//!
//! A frame without a method is rejected with `-1 invalid method`; one whose
//! `data` is missing or not an object with `-1 invalid data`. Notifications
//! from the client get no response, so a bad one is only logged.

pub mod handlers;
pub mod ws;

use crate::context::BizContext;
use crate::errors::BizError;
use crate::observability::metrics;
use crate::session::Peer;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// A validated method call.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub method: String,
    pub data: Map<String, Value>,
}

/// An inbound frame after parsing.
#[derive(Debug)]
pub enum Frame {
    /// Expects a response carrying `id`.
    Request {
        id: Value,
        call: Result<Call, BizError>,
    },
    /// Fire-and-forget.
    Notification(Result<Call, BizError>),
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(default)]
    request: bool,
    #[serde(default)]
    notification: bool,
    #[serde(default)]
    id: Value,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

fn validate(method: Option<String>, data: Option<Value>) -> Result<Call, BizError> {
    let method = method
        .filter(|m| !m.is_empty())
        .ok_or(BizError::InvalidMethod)?;
    match data {
        Some(Value::Object(data)) => Ok(Call { method, data }),
        Some(_) => Err(BizError::InvalidData("data is not an object".to_string())),
        None => Err(BizError::InvalidData("data is missing".to_string())),
    }
}

/// Parse one text frame.
///
/// Returns `None` for text that is not a JSON object or is neither a
/// request nor a notification; such frames cannot be answered.
pub fn parse_frame(text: &str) -> Option<Frame> {
    let raw: RawFrame = serde_json::from_str(text).ok()?;
    if raw.request {
        Some(Frame::Request {
            id: raw.id,
            call: validate(raw.method, raw.data),
        })
    } else if raw.notification {
        Some(Frame::Notification(validate(raw.method, raw.data)))
    } else {
        None
    }
}

/// Successful response frame.
pub fn accept_frame(id: &Value, data: Value) -> Value {
    json!({"response": true, "id": id, "ok": true, "data": data})
}

/// Error response frame.
pub fn reject_frame(id: &Value, error: &BizError) -> Value {
    json!({
        "response": true,
        "id": id,
        "ok": false,
        "errorCode": error.error_code(),
        "errorReason": error.client_message(),
    })
}

/// Server-to-client notification frame.
pub fn notification_frame(method: &str, data: Value) -> Value {
    json!({"notification": true, "method": method, "data": data})
}

/// Handle one inbound text frame from `peer`. Returns the response frame to
/// send, if any.
pub async fn handle_frame(ctx: &BizContext, peer: &Arc<Peer>, text: &str) -> Option<Value> {
    let Some(frame) = parse_frame(text) else {
        warn!(target: "biz.signaling", uid = %peer.id(), "Dropping unrecognised frame");
        return None;
    };

    match frame {
        Frame::Request { id, call } => {
            let result = match call {
                Ok(call) => dispatch(ctx, peer, call).await,
                Err(e) => Err(e),
            };
            Some(match result {
                Ok(data) => accept_frame(&id, data),
                Err(e) => {
                    debug!(
                        target: "biz.signaling",
                        uid = %peer.id(),
                        code = e.error_code(),
                        error = %e,
                        "Request rejected"
                    );
                    reject_frame(&id, &e)
                }
            })
        }
        Frame::Notification(Ok(call)) => {
            if let Err(e) = dispatch(ctx, peer, call).await {
                warn!(target: "biz.signaling", uid = %peer.id(), error = %e, "Notification failed");
            }
            None
        }
        Frame::Notification(Err(e)) => {
            warn!(target: "biz.signaling", uid = %peer.id(), error = %e, "Invalid notification dropped");
            None
        }
    }
}

/// Route a validated call to its handler.
pub async fn dispatch(ctx: &BizContext, peer: &Arc<Peer>, call: Call) -> Result<Value, BizError> {
    let Call { method, data } = call;
    let result = match method.as_str() {
        handlers::METHOD_JOIN => handlers::join(ctx, peer, data).await,
        handlers::METHOD_LEAVE => handlers::leave(ctx, peer, data).await,
        handlers::METHOD_PUBLISH => handlers::publish(ctx, peer, data).await,
        handlers::METHOD_UNPUBLISH => handlers::unpublish(ctx, peer, data).await,
        _ => Err(BizError::UnknownMethod(method.clone())),
    };
    metrics::record_signal_request(&method, result.is_ok());
    result
}
