//! In-process message bus.
//!
//! Used by tests and by single-process deployments without `REDIS_URL`.
//! Broadcast delivery uses `try_send`: a subscriber whose queue is full misses
//! the event, matching the at-most-once contract of the Redis backend.

use super::{BroadcastEvent, IncomingRequest, MessageBus, RpcError, DELIVERY_BUFFER};
use crate::error::ClusterError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

#[derive(Default)]
struct Group {
    members: Vec<mpsc::Sender<BroadcastEvent>>,
    next: usize,
}

#[derive(Default)]
struct Topic {
    direct: Vec<mpsc::Sender<BroadcastEvent>>,
    groups: HashMap<String, Group>,
}

impl Topic {
    fn prune(&mut self) {
        self.direct.retain(|tx| !tx.is_closed());
        for group in self.groups.values_mut() {
            group.members.retain(|tx| !tx.is_closed());
        }
        self.groups.retain(|_, group| !group.members.is_empty());
    }

    fn is_empty(&self) -> bool {
        self.direct.is_empty() && self.groups.is_empty()
    }
}

#[derive(Default)]
struct Inner {
    servers: HashMap<String, mpsc::Sender<IncomingRequest>>,
    topics: HashMap<String, Topic>,
}

/// Message bus backed by tokio channels.
#[derive(Default)]
pub struct MemoryBus {
    inner: Mutex<Inner>,
}

impl MemoryBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on `topic` (direct plus group members).
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.topics.get_mut(topic) else {
            return 0;
        };
        entry.prune();
        let count = entry.direct.len()
            + entry.groups.values().map(|g| g.members.len()).sum::<usize>();
        if count == 0 {
            inner.topics.remove(topic);
        }
        count
    }

    /// Number of topics with at least one subscription entry.
    pub async fn topic_count(&self) -> usize {
        self.inner.lock().await.topics.len()
    }
}

fn deliver(tx: &mpsc::Sender<BroadcastEvent>, topic: &str, event: BroadcastEvent) -> bool {
    match tx.try_send(event) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(target: "common.bus", topic = %topic, "Subscriber queue full, event dropped");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn request(
        &self,
        channel: &str,
        method: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let server = {
            let inner = self.inner.lock().await;
            inner.servers.get(channel).cloned()
        };
        let Some(server) = server else {
            return Err(RpcError::no_responder(channel));
        };

        let (request, reply) = IncomingRequest::new(method, data);
        if server.send(request).await.is_err() {
            let mut inner = self.inner.lock().await;
            if inner.servers.get(channel).is_some_and(mpsc::Sender::is_closed) {
                inner.servers.remove(channel);
            }
            return Err(RpcError::no_responder(channel));
        }

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::internal(format!(
                "{method} on {channel}: responder dropped the request"
            ))),
            Err(_) => Err(RpcError::timeout(channel)),
        }
    }

    async fn serve(&self, channel: &str) -> Result<mpsc::Receiver<IncomingRequest>, ClusterError> {
        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
        let mut inner = self.inner.lock().await;
        if inner.servers.insert(channel.to_string(), tx).is_some() {
            debug!(target: "common.bus", channel = %channel, "Replaced existing server");
        }
        Ok(rx)
    }

    async fn publish(&self, topic: &str, event: BroadcastEvent) -> Result<(), ClusterError> {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.topics.get_mut(topic) else {
            return Ok(());
        };

        entry
            .direct
            .retain(|tx| deliver(tx, topic, event.clone()));

        for group in entry.groups.values_mut() {
            group.members.retain(|tx| !tx.is_closed());
            if group.members.is_empty() {
                continue;
            }
            let idx = group.next % group.members.len();
            group.next = group.next.wrapping_add(1);
            if let Some(member) = group.members.get(idx) {
                deliver(member, topic, event.clone());
            }
        }
        entry.prune();
        if entry.is_empty() {
            inner.topics.remove(topic);
            debug!(target: "common.bus", topic = %topic, "Topic has no subscribers, removed");
        }

        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: Option<&str>,
    ) -> Result<mpsc::Receiver<BroadcastEvent>, ClusterError> {
        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
        let mut inner = self.inner.lock().await;
        let entry = inner.topics.entry(topic.to_string()).or_default();
        match group {
            Some(name) => entry
                .groups
                .entry(name.to_string())
                .or_default()
                .members
                .push(tx),
            None => entry.direct.push(tx),
        }
        Ok(rx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::bus::CODE_INTERNAL;
    use serde_json::json;
    use std::sync::Arc;

    fn spawn_echo(mut rx: mpsc::Receiver<IncomingRequest>) {
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let data = req.data.clone();
                req.respond(Ok(data));
            }
        });
    }

    #[tokio::test]
    async fn test_request_reaches_server() {
        let bus = MemoryBus::new();
        spawn_echo(bus.serve("rpc-dc1-a").await.unwrap());

        let resp = bus
            .request("rpc-dc1-a", "echo", json!({"x": 1}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(resp["x"], 1);
    }

    #[tokio::test]
    async fn test_request_without_server_is_no_responder() {
        let bus = MemoryBus::new();
        let err = bus
            .request("rpc-dc1-missing", "echo", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_request_after_server_dropped_is_no_responder() {
        let bus = MemoryBus::new();
        drop(bus.serve("rpc-dc1-a").await.unwrap());

        let err = bus
            .request("rpc-dc1-a", "echo", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out_when_server_is_silent() {
        let bus = MemoryBus::new();
        let _rx = bus.serve("rpc-dc1-a").await.unwrap();

        let err = bus
            .request("rpc-dc1-a", "echo", json!({}), Duration::from_millis(500))
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::bus::CODE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_dropped_request_is_internal_error() {
        let bus = MemoryBus::new();
        let mut rx = bus.serve("rpc-dc1-a").await.unwrap();
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                drop(req);
            }
        });

        let err = bus
            .request("rpc-dc1-a", "echo", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code, CODE_INTERNAL);
    }

    #[tokio::test]
    async fn test_concurrent_requests_get_their_own_responses() {
        let bus = Arc::new(MemoryBus::new());
        spawn_echo(bus.serve("rpc-dc1-a").await.unwrap());

        let mut handles = Vec::new();
        for i in 0..20 {
            let bus = Arc::clone(&bus);
            handles.push(tokio::spawn(async move {
                let resp = bus
                    .request("rpc-dc1-a", "echo", json!({"i": i}), Duration::from_secs(1))
                    .await
                    .unwrap();
                (i, resp)
            }));
        }
        for handle in handles {
            let (i, resp) = handle.await.unwrap();
            assert_eq!(resp["i"], i);
        }
    }

    #[tokio::test]
    async fn test_direct_subscribers_all_receive() {
        let bus = MemoryBus::new();
        let mut a = bus.subscribe("event-dc1-n1", None).await.unwrap();
        let mut b = bus.subscribe("event-dc1-n1", None).await.unwrap();

        bus.publish("event-dc1-n1", BroadcastEvent::new("ping", json!({})))
            .await
            .unwrap();

        assert_eq!(a.recv().await.unwrap().method, "ping");
        assert_eq!(b.recv().await.unwrap().method, "ping");
    }

    #[tokio::test]
    async fn test_group_delivers_each_event_once() {
        let bus = MemoryBus::new();
        let mut a = bus.subscribe("event-dc1-sfu", Some("biz")).await.unwrap();
        let mut b = bus.subscribe("event-dc1-sfu", Some("biz")).await.unwrap();

        for i in 0..4 {
            bus.publish("event-dc1-sfu", BroadcastEvent::new("e", json!(i)))
                .await
                .unwrap();
        }

        let mut received = Vec::new();
        while let Ok(event) = a.try_recv() {
            received.push(event.data);
        }
        let a_count = received.len();
        while let Ok(event) = b.try_recv() {
            received.push(event.data);
        }

        assert_eq!(received.len(), 4);
        assert_eq!(a_count, 2);
        received.sort_by_key(|v| v.as_i64());
        assert_eq!(received, vec![json!(0), json!(1), json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let bus = MemoryBus::new();
        let a = bus.subscribe("event-dc1-n1", None).await.unwrap();
        let _b = bus.subscribe("event-dc1-n1", Some("biz")).await.unwrap();
        assert_eq!(bus.subscriber_count("event-dc1-n1").await, 2);

        drop(a);
        bus.publish("event-dc1-n1", BroadcastEvent::new("e", json!(null)))
            .await
            .unwrap();
        assert_eq!(bus.subscriber_count("event-dc1-n1").await, 1);
    }

    #[tokio::test]
    async fn test_topic_removed_after_last_subscriber_leaves() {
        let bus = MemoryBus::new();
        let direct = bus.subscribe("event-dc1-n1", None).await.unwrap();
        let grouped = bus.subscribe("event-dc1-sfu", Some("biz")).await.unwrap();
        assert_eq!(bus.topic_count().await, 2);

        drop(direct);
        bus.publish("event-dc1-n1", BroadcastEvent::new("e", json!(null)))
            .await
            .unwrap();
        assert_eq!(bus.topic_count().await, 1);

        drop(grouped);
        assert_eq!(bus.subscriber_count("event-dc1-sfu").await, 0);
        assert_eq!(bus.topic_count().await, 0);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = MemoryBus::new();
        bus.publish("event-dc1-nobody", BroadcastEvent::new("e", json!(null)))
            .await
            .unwrap();
    }
}
