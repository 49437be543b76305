//! RPC & broadcast fabric.
//!
//! A [`MessageBus`] carries two kinds of traffic:
//!
//! - **Requests** on a per-node request channel. A [`Requestor`] sends one and
//!   waits for the matching response (or the timeout). Every call gets its own
//!   reply path, so concurrent calls on one requestor never see each other's
//!   responses.
//! - **Broadcasts** on a per-node topic. A [`Broadcaster`] publishes
//!   fire-and-forget events; subscribers either receive every event
//!   (one-to-one) or share them within a consumer group (each event reaches
//!   exactly one group member).
//!
//! Delivery is best-effort and at-most-once per subscriber. There is no
//! ordering across topics and no delivery across a crash.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryBus;
pub use self::redis::RedisBus;

use crate::error::ClusterError;
use crate::protocol::RpcMethod;
use async_trait::async_trait;
use metrics::{counter, histogram};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Malformed request payload.
pub const CODE_BAD_REQUEST: i32 = 400;

/// Nobody serves the request channel.
pub const CODE_NO_RESPONDER: i32 = 404;

/// No response within the timeout.
pub const CODE_TIMEOUT: i32 = 408;

/// The remote handler failed.
pub const CODE_INTERNAL: i32 = 500;

/// Capacity of the per-subscription and per-server delivery queues.
pub const DELIVERY_BUFFER: usize = 256;

/// Structured RPC failure: a numeric code and a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("rpc error {code}: {reason}")]
pub struct RpcError {
    /// Numeric error code.
    pub code: i32,
    /// Human-readable reason.
    pub reason: String,
}

impl RpcError {
    /// Create an error with an explicit code.
    #[must_use]
    pub fn new(code: i32, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// The bus gave up waiting for a response.
    #[must_use]
    pub fn timeout(channel: &str) -> Self {
        Self::new(CODE_TIMEOUT, format!("request to {channel} timed out"))
    }

    /// No server is attached to the request channel.
    #[must_use]
    pub fn no_responder(channel: &str) -> Self {
        Self::new(CODE_NO_RESPONDER, format!("no responder on {channel}"))
    }

    /// The payload could not be (de)serialized.
    #[must_use]
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::new(CODE_BAD_REQUEST, reason)
    }

    /// The remote handler or the transport failed.
    #[must_use]
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::new(CODE_INTERNAL, reason)
    }

    /// Whether the failure came from the bus rather than from the remote handler.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self.code, CODE_TIMEOUT | CODE_NO_RESPONDER)
    }
}

impl From<ClusterError> for RpcError {
    fn from(err: ClusterError) -> Self {
        RpcError::internal(err.to_string())
    }
}

/// A fire-and-forget event published on a node's topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEvent {
    /// Event name (see [`crate::protocol::events`]).
    pub method: String,
    /// Event payload.
    pub data: Value,
}

impl BroadcastEvent {
    /// Create an event.
    #[must_use]
    pub fn new(method: impl Into<String>, data: Value) -> Self {
        Self {
            method: method.into(),
            data,
        }
    }

    /// Decode the payload into a typed value.
    ///
    /// # Errors
    ///
    /// Returns `ClusterError::Serialization` if the payload does not match `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ClusterError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// A request delivered to a serving node.
///
/// The server must call [`IncomingRequest::respond`] (or one of its
/// shorthands). Dropping the request without responding surfaces as an
/// internal error to the caller.
#[derive(Debug)]
pub struct IncomingRequest {
    /// Method name.
    pub method: String,
    /// Request payload.
    pub data: Value,
    reply: oneshot::Sender<Result<Value, RpcError>>,
}

impl IncomingRequest {
    /// Create a request and the receiver its response will arrive on.
    #[must_use]
    pub fn new(
        method: impl Into<String>,
        data: Value,
    ) -> (Self, oneshot::Receiver<Result<Value, RpcError>>) {
        let (reply, rx) = oneshot::channel();
        (
            Self {
                method: method.into(),
                data,
                reply,
            },
            rx,
        )
    }

    /// Decode the payload into the method's request type.
    ///
    /// # Errors
    ///
    /// Returns a `400` `RpcError` if the payload does not match `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| RpcError::malformed(format!("invalid {} payload: {e}", self.method)))
    }

    /// Send the outcome back to the caller.
    pub fn respond(self, result: Result<Value, RpcError>) {
        if self.reply.send(result).is_err() {
            debug!(
                target: "common.bus",
                method = %self.method,
                "Caller went away before the response was sent"
            );
        }
    }

    /// Respond with a serializable success value.
    pub fn accept<T: Serialize>(self, value: &T) {
        let result = serde_json::to_value(value)
            .map_err(|e| RpcError::internal(format!("response serialization failed: {e}")));
        self.respond(result);
    }

    /// Respond with an error.
    pub fn reject(self, error: RpcError) {
        self.respond(Err(error));
    }
}

/// The message bus contract shared by the in-memory and Redis backends.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Send a request on `channel` and wait for its response.
    async fn request(
        &self,
        channel: &str,
        method: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError>;

    /// Start serving `channel`. Requests arrive on the returned receiver;
    /// dropping it stops serving.
    async fn serve(&self, channel: &str) -> Result<mpsc::Receiver<IncomingRequest>, ClusterError>;

    /// Publish an event on `topic`.
    async fn publish(&self, topic: &str, event: BroadcastEvent) -> Result<(), ClusterError>;

    /// Subscribe to `topic`. With `group = Some(g)`, delivery is shared with
    /// every other member of group `g`. Dropping the receiver unsubscribes.
    async fn subscribe(
        &self,
        topic: &str,
        group: Option<&str>,
    ) -> Result<mpsc::Receiver<BroadcastEvent>, ClusterError>;
}

/// RPC handle bound to one remote node's request channel.
///
/// Cheap to clone; every clone shares the underlying bus.
#[derive(Clone)]
pub struct Requestor {
    bus: Arc<dyn MessageBus>,
    channel: String,
    timeout: Duration,
}

impl std::fmt::Debug for Requestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Requestor")
            .field("channel", &self.channel)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Requestor {
    /// Create a requestor for `channel`.
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>, channel: impl Into<String>, timeout: Duration) -> Self {
        Self {
            bus,
            channel: channel.into(),
            timeout,
        }
    }

    /// The request channel this requestor targets.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Send a typed request and wait for the typed response.
    ///
    /// # Errors
    ///
    /// Returns the remote `RpcError`, a `408` on timeout, or a `400` if either
    /// side of the exchange does not match the method's shapes.
    pub async fn sync_request<M: RpcMethod>(
        &self,
        request: &M::Request,
    ) -> Result<M::Response, RpcError> {
        let data = serde_json::to_value(request)
            .map_err(|e| RpcError::malformed(format!("request serialization failed: {e}")))?;
        let value = self.request_raw(M::NAME, data).await?;
        serde_json::from_value(value)
            .map_err(|e| RpcError::malformed(format!("invalid {} response: {e}", M::NAME)))
    }

    /// Send an untyped request.
    ///
    /// # Errors
    ///
    /// Returns the remote `RpcError` or a bus-level failure.
    pub async fn request_raw(&self, method: &str, data: Value) -> Result<Value, RpcError> {
        let start = Instant::now();
        let result = self
            .bus
            .request(&self.channel, method, data, self.timeout)
            .await;
        record_rpc(method, &result, start.elapsed());
        result
    }
}

/// Publisher for the local node's broadcast topic.
#[derive(Clone)]
pub struct Broadcaster {
    bus: Arc<dyn MessageBus>,
    topic: String,
}

impl Broadcaster {
    /// Create a broadcaster for `topic`.
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>, topic: impl Into<String>) -> Self {
        Self {
            bus,
            topic: topic.into(),
        }
    }

    /// The topic this broadcaster publishes on.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish an event. Best-effort: failures are logged, never returned.
    pub async fn say<T: Serialize + ?Sized>(&self, method: &str, data: &T) {
        let data = match serde_json::to_value(data) {
            Ok(data) => data,
            Err(e) => {
                warn!(
                    target: "common.bus",
                    method = %method,
                    error = %e,
                    "Dropping broadcast with unserializable payload"
                );
                return;
            }
        };

        if let Err(e) = self
            .bus
            .publish(&self.topic, BroadcastEvent::new(method, data))
            .await
        {
            warn!(
                target: "common.bus",
                topic = %self.topic,
                method = %method,
                error = %e,
                "Broadcast failed"
            );
        }
    }
}

/// Record RPC outcome and latency.
///
/// Metrics: `cluster_rpc_requests_total{method, outcome}` and
/// `cluster_rpc_duration_seconds{method}`. Method names are a fixed set.
fn record_rpc(method: &str, result: &Result<Value, RpcError>, elapsed: Duration) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) if e.code == CODE_TIMEOUT => "timeout",
        Err(e) if e.code == CODE_NO_RESPONDER => "no_responder",
        Err(_) => "error",
    };
    counter!("cluster_rpc_requests_total", "method" => method.to_string(), "outcome" => outcome)
        .increment(1);
    histogram!("cluster_rpc_duration_seconds", "method" => method.to_string())
        .record(elapsed.as_secs_f64());
}
