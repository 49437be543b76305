//! Redis-backed message bus.
//!
//! - Requests: `RPUSH` onto the channel's list, tagged with a correlation id
//!   and this bus's reply inbox. Servers `BLPOP` the list and `RPUSH` the
//!   response onto the inbox (with a short expiry so an inbox nobody reads
//!   doesn't linger). One listener per bus drains the inbox and hands each
//!   response to the call waiting on its correlation id.
//! - Broadcasts: Redis Streams. One-to-one subscribers `XREAD` from the
//!   stream's last entry at subscribe time; group subscribers share a
//!   consumer group via `XREADGROUP`.
//!
//! Blocking commands run on dedicated connections so they never stall the
//! shared multiplexed connection.

use super::{BroadcastEvent, IncomingRequest, MessageBus, RpcError, DELIVERY_BUFFER};
use crate::error::ClusterError;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamMaxlen, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, warn};
use uuid::Uuid;

const RPC_KEY_PREFIX: &str = "conclave:rpc:";
const REPLY_KEY_PREFIX: &str = "conclave:reply:";
const EVENT_KEY_PREFIX: &str = "conclave:event:";

/// How long a blocking read waits before re-checking whether its consumer is gone.
const BLOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Reply keys expire after this many seconds.
const REPLY_TTL_SECONDS: i64 = 30;

/// Approximate cap on stream length per topic.
const STREAM_MAXLEN: usize = 1000;

/// Back-off after a Redis error in a background loop.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Stream id that precedes every entry.
const STREAM_START: &str = "0-0";

#[derive(Debug, Serialize, Deserialize)]
struct RequestEnvelope {
    method: String,
    data: Value,
    reply_to: String,
    correlation_id: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ResponseEnvelope {
    #[serde(default)]
    correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

impl ResponseEnvelope {
    fn from_result(correlation_id: String, result: Result<Value, RpcError>) -> Self {
        match result {
            Ok(data) => Self {
                correlation_id,
                data: Some(data),
                error: None,
            },
            Err(error) => Self {
                correlation_id,
                data: None,
                error: Some(error),
            },
        }
    }

    fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.data.unwrap_or(Value::Null)),
        }
    }
}

fn bus_error(err: &redis::RedisError) -> ClusterError {
    ClusterError::Bus(err.to_string())
}

/// Calls waiting for a response, by correlation id.
type PendingReplies = Mutex<HashMap<String, oneshot::Sender<ResponseEnvelope>>>;

/// Message bus over a Redis server.
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    connection: MultiplexedConnection,
    consumer_name: String,
    inbox: String,
    pending: Arc<PendingReplies>,
}

impl RedisBus {
    /// Connect to Redis. `consumer_name` identifies this node inside
    /// consumer groups.
    ///
    /// # Errors
    ///
    /// Returns `ClusterError::Bus` if the URL is invalid or the connection fails.
    pub async fn connect(url: &str, consumer_name: impl Into<String>) -> Result<Self, ClusterError> {
        let client = redis::Client::open(url).map_err(|e| bus_error(&e))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| bus_error(&e))?;
        let listener = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| bus_error(&e))?;

        let consumer_name = consumer_name.into();
        let inbox = format!("{REPLY_KEY_PREFIX}{consumer_name}:{}", Uuid::new_v4());
        let pending = Arc::new(PendingReplies::default());
        tokio::spawn(run_reply_listener(
            listener,
            inbox.clone(),
            Arc::downgrade(&pending),
        ));

        Ok(Self {
            client,
            connection,
            consumer_name,
            inbox,
            pending,
        })
    }

    async fn dedicated_connection(&self) -> Result<MultiplexedConnection, ClusterError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| bus_error(&e))
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn request(
        &self,
        channel: &str,
        method: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let correlation_id = Uuid::new_v4().to_string();
        let envelope = RequestEnvelope {
            method: method.to_string(),
            data,
            reply_to: self.inbox.clone(),
            correlation_id: correlation_id.clone(),
        };
        let payload = serde_json::to_string(&envelope)
            .map_err(|e| RpcError::malformed(format!("request serialization failed: {e}")))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending
            .lock()
            .await
            .insert(correlation_id.clone(), reply_tx);

        let mut conn = self.connection.clone();
        if let Err(e) = conn
            .rpush::<_, _, ()>(format!("{RPC_KEY_PREFIX}{channel}"), payload)
            .await
        {
            self.pending.lock().await.remove(&correlation_id);
            return Err(RpcError::internal(e.to_string()));
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(response)) => response.into_result(),
            Ok(Err(_)) => Err(RpcError::internal("reply listener stopped")),
            Err(_) => {
                self.pending.lock().await.remove(&correlation_id);
                Err(RpcError::timeout(channel))
            }
        }
    }

    async fn serve(&self, channel: &str) -> Result<mpsc::Receiver<IncomingRequest>, ClusterError> {
        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
        let mut blocking = self.dedicated_connection().await?;
        let replies = self.connection.clone();
        let queue = format!("{RPC_KEY_PREFIX}{channel}");

        tokio::spawn(async move {
            debug!(target: "common.bus", queue = %queue, "Request server started");
            while !tx.is_closed() {
                let popped: Option<(String, String)> =
                    match blocking.blpop(&queue, BLOCK_TIMEOUT.as_secs_f64()).await {
                        Ok(popped) => popped,
                        Err(e) => {
                            warn!(target: "common.bus", queue = %queue, error = %e, "BLPOP failed");
                            tokio::time::sleep(ERROR_BACKOFF).await;
                            continue;
                        }
                    };
                let Some((_, body)) = popped else {
                    continue;
                };

                let envelope: RequestEnvelope = match serde_json::from_str(&body) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(target: "common.bus", queue = %queue, error = %e, "Discarding malformed request");
                        continue;
                    }
                };

                let (request, reply) = IncomingRequest::new(envelope.method, envelope.data);
                if tx.send(request).await.is_err() {
                    break;
                }

                let mut replies = replies.clone();
                let reply_to = envelope.reply_to;
                let correlation_id = envelope.correlation_id;
                tokio::spawn(async move {
                    let result = reply.await.unwrap_or_else(|_| {
                        Err(RpcError::internal("responder dropped the request"))
                    });
                    let response = ResponseEnvelope::from_result(correlation_id, result);
                    let body = match serde_json::to_string(&response) {
                        Ok(body) => body,
                        Err(e) => {
                            error!(target: "common.bus", error = %e, "Response serialization failed");
                            return;
                        }
                    };
                    let pushed: redis::RedisResult<()> = redis::pipe()
                        .rpush(&reply_to, body)
                        .ignore()
                        .expire(&reply_to, REPLY_TTL_SECONDS)
                        .ignore()
                        .query_async(&mut replies)
                        .await;
                    if let Err(e) = pushed {
                        warn!(target: "common.bus", reply_to = %reply_to, error = %e, "Failed to push response");
                    }
                });
            }
            debug!(target: "common.bus", queue = %queue, "Request server stopped");
        });

        Ok(rx)
    }

    async fn publish(&self, topic: &str, event: BroadcastEvent) -> Result<(), ClusterError> {
        let data = serde_json::to_string(&event.data)?;
        let mut conn = self.connection.clone();
        conn.xadd_maxlen::<_, _, _, _, ()>(
            format!("{EVENT_KEY_PREFIX}{topic}"),
            StreamMaxlen::Approx(STREAM_MAXLEN),
            "*",
            &[("method", event.method.as_str()), ("data", data.as_str())],
        )
        .await
        .map_err(|e| bus_error(&e))
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: Option<&str>,
    ) -> Result<mpsc::Receiver<BroadcastEvent>, ClusterError> {
        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
        let mut blocking = self.dedicated_connection().await?;
        let stream = format!("{EVENT_KEY_PREFIX}{topic}");
        #[allow(clippy::cast_possible_truncation)]
        let block_ms = BLOCK_TIMEOUT.as_millis() as usize;

        match group {
            Some(group) => {
                let created: redis::RedisResult<()> =
                    blocking.xgroup_create_mkstream(&stream, group, "$").await;
                if let Err(e) = created {
                    if e.code() != Some("BUSYGROUP") {
                        return Err(bus_error(&e));
                    }
                }

                let group = group.to_string();
                let consumer = self.consumer_name.clone();
                tokio::spawn(async move {
                    let options = StreamReadOptions::default()
                        .group(&group, &consumer)
                        .block(block_ms)
                        .count(64);
                    while !tx.is_closed() {
                        let reply: Option<StreamReadReply> = match blocking
                            .xread_options(&[&stream], &[">"], &options)
                            .await
                        {
                            Ok(reply) => reply,
                            Err(e) => {
                                warn!(target: "common.bus", stream = %stream, error = %e, "XREADGROUP failed");
                                tokio::time::sleep(ERROR_BACKOFF).await;
                                continue;
                            }
                        };
                        let Some(reply) = reply else { continue };

                        let mut acked = Vec::new();
                        for key in reply.keys {
                            for entry in key.ids {
                                acked.push(entry.id.clone());
                                if let Some(event) = decode_entry(&entry) {
                                    if tx.send(event).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        if !acked.is_empty() {
                            let ack: redis::RedisResult<()> =
                                blocking.xack(&stream, &group, &acked).await;
                            if let Err(e) = ack {
                                warn!(target: "common.bus", stream = %stream, error = %e, "XACK failed");
                            }
                        }
                    }
                });
            }
            None => {
                // Anchor at the current tail so nothing published between
                // polls is skipped, as re-reading from `$` would
                let tail: StreamRangeReply = blocking
                    .xrevrange_count(&stream, "+", "-", 1)
                    .await
                    .map_err(|e| bus_error(&e))?;
                let mut last_id = initial_cursor(&tail);
                tokio::spawn(async move {
                    let options = StreamReadOptions::default().block(block_ms).count(64);
                    while !tx.is_closed() {
                        let reply: Option<StreamReadReply> = match blocking
                            .xread_options(&[&stream], &[&last_id], &options)
                            .await
                        {
                            Ok(reply) => reply,
                            Err(e) => {
                                warn!(target: "common.bus", stream = %stream, error = %e, "XREAD failed");
                                tokio::time::sleep(ERROR_BACKOFF).await;
                                continue;
                            }
                        };
                        let Some(reply) = reply else { continue };

                        for key in reply.keys {
                            for entry in key.ids {
                                last_id.clone_from(&entry.id);
                                if let Some(event) = decode_entry(&entry) {
                                    if tx.send(event).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                    }
                });
            }
        }

        Ok(rx)
    }
}

/// Drain this bus's reply inbox until every handle to the bus is gone.
async fn run_reply_listener(
    mut blocking: MultiplexedConnection,
    inbox: String,
    pending: Weak<PendingReplies>,
) {
    debug!(target: "common.bus", inbox = %inbox, "Reply listener started");
    while pending.strong_count() > 0 {
        let popped: Option<(String, String)> =
            match blocking.blpop(&inbox, BLOCK_TIMEOUT.as_secs_f64()).await {
                Ok(popped) => popped,
                Err(e) => {
                    warn!(target: "common.bus", inbox = %inbox, error = %e, "BLPOP on reply inbox failed");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                    continue;
                }
            };
        let Some((_, body)) = popped else { continue };
        let Some(pending) = pending.upgrade() else { break };
        deliver_reply(&pending, &body).await;
    }
    debug!(target: "common.bus", inbox = %inbox, "Reply listener stopped");
}

/// Hand one inbox entry to the call waiting for it. Replies nobody waits
/// for (the call timed out) are dropped.
async fn deliver_reply(pending: &PendingReplies, body: &str) {
    let response: ResponseEnvelope = match serde_json::from_str(body) {
        Ok(response) => response,
        Err(e) => {
            warn!(target: "common.bus", error = %e, "Discarding malformed response");
            return;
        }
    };
    let waiter = pending.lock().await.remove(&response.correlation_id);
    match waiter {
        Some(waiter) => {
            if waiter.send(response).is_err() {
                debug!(target: "common.bus", "Caller went away before its reply arrived");
            }
        }
        None => {
            debug!(target: "common.bus", correlation_id = %response.correlation_id, "Dropping late reply");
        }
    }
}

/// Read position for a one-to-one subscriber: the stream's newest entry, or
/// the very start when the stream is empty or absent.
fn initial_cursor(tail: &StreamRangeReply) -> String {
    tail.ids
        .first()
        .map_or_else(|| STREAM_START.to_string(), |entry| entry.id.clone())
}

fn decode_entry(entry: &redis::streams::StreamId) -> Option<BroadcastEvent> {
    let method: String = entry.get("method")?;
    let raw: String = entry.get("data")?;
    match serde_json::from_str(&raw) {
        Ok(data) => Some(BroadcastEvent { method, data }),
        Err(e) => {
            warn!(target: "common.bus", id = %entry.id, error = %e, "Skipping malformed stream entry");
            None
        }
    }
}
