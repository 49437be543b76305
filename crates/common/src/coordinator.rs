//! Discovery-driven cluster coordinator.
//!
//! The coordinator reacts to node transitions from the
//! [`ServiceWatcher`]:
//!
//! - **Up**: create one [`Requestor`] for the node's request channel and, where
//!   the subscription rule applies, subscribe to its broadcast topic.
//! - **Down**: drop the requestor and cancel the subscription.
//!
//! Subscription rule for a local node of service `S`:
//!
//! - a remote node of the same service `S` is followed one-to-one (every
//!   event reaches this node);
//! - a remote media node (`sfu`) is followed through the consumer group `S`,
//!   so each media event reaches exactly one node of service `S`.
//!
//! Every received broadcast is forwarded, tagged with its origin, to the
//! inbound channel handed to [`ClusterCoordinator::new`].

use crate::bus::{BroadcastEvent, MessageBus, Requestor};
use crate::discovery::{NodeEventHandler, ServiceWatcher};
use crate::error::{ClusterError, Result};
use crate::types::{NodeState, ServiceNode, SERVICE_SFU};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A broadcast received from a remote node.
#[derive(Debug, Clone)]
pub struct InboundBroadcast {
    /// The node whose topic carried the event.
    pub from: ServiceNode,
    /// The event.
    pub event: BroadcastEvent,
}

struct NodeLink {
    requestor: Requestor,
    subscription: Option<CancellationToken>,
}

/// Keeps one RPC handle per live node and the matching subscriptions.
pub struct ClusterCoordinator {
    local: ServiceNode,
    watcher: Arc<ServiceWatcher>,
    bus: Arc<dyn MessageBus>,
    rpc_timeout: Duration,
    inbound: Option<mpsc::Sender<InboundBroadcast>>,
    links: Mutex<HashMap<String, NodeLink>>,
    cancel_token: CancellationToken,
}

impl ClusterCoordinator {
    /// Create a coordinator for the local node.
    ///
    /// Broadcasts are forwarded to `inbound`; pass `None` for a node that
    /// consumes no broadcasts (subscriptions are then skipped).
    #[must_use]
    pub fn new(
        local: ServiceNode,
        watcher: Arc<ServiceWatcher>,
        bus: Arc<dyn MessageBus>,
        rpc_timeout: Duration,
        inbound: Option<mpsc::Sender<InboundBroadcast>>,
    ) -> Self {
        Self {
            local,
            watcher,
            bus,
            rpc_timeout,
            inbound,
            links: Mutex::new(HashMap::new()),
            cancel_token: CancellationToken::new(),
        }
    }

    /// The local node.
    #[must_use]
    pub fn local_node(&self) -> &ServiceNode {
        &self.local
    }

    /// The watcher backing the lookups.
    #[must_use]
    pub fn watcher(&self) -> &Arc<ServiceWatcher> {
        &self.watcher
    }

    /// Consumer group to use for `node`'s topic, `Some(None)` for a
    /// one-to-one subscription, `None` for no subscription.
    fn subscription_group(&self, node: &ServiceNode) -> Option<Option<String>> {
        if node.id == self.local.id {
            return None;
        }
        if node.name == self.local.name {
            return Some(None);
        }
        if node.name == SERVICE_SFU {
            return Some(Some(self.local.name.clone()));
        }
        None
    }

    async fn subscribe(&self, node: &ServiceNode) -> Option<CancellationToken> {
        let inbound = self.inbound.clone()?;
        let group = self.subscription_group(node)?;
        let topic = node.event_channel();

        let mut events = match self.bus.subscribe(&topic, group.as_deref()).await {
            Ok(events) => events,
            Err(e) => {
                warn!(
                    target: "common.coordinator",
                    node = %node,
                    topic = %topic,
                    error = %e,
                    "Broadcast subscription failed"
                );
                return None;
            }
        };

        info!(
            target: "common.coordinator",
            node = %node,
            topic = %topic,
            group = group.as_deref().unwrap_or("-"),
            "Subscribed to node broadcasts"
        );

        let token = self.cancel_token.child_token();
        let task_token = token.clone();
        let from = node.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = task_token.cancelled() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        let inbound_event = InboundBroadcast { from: from.clone(), event };
                        if inbound.send(inbound_event).await.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!(target: "common.coordinator", node = %from, "Subscription task stopped");
        });

        Some(token)
    }

    async fn node_up(&self, node: &ServiceNode) {
        if self.links.lock().await.contains_key(&node.id) {
            debug!(target: "common.coordinator", node = %node, "Duplicate Up ignored");
            return;
        }

        // Subscribing talks to the bus; lookups must not wait on it
        let subscription = self.subscribe(node).await;
        let requestor = Requestor::new(Arc::clone(&self.bus), node.rpc_channel(), self.rpc_timeout);

        let mut links = self.links.lock().await;
        if links.contains_key(&node.id) {
            drop(links);
            if let Some(token) = subscription {
                token.cancel();
            }
            debug!(target: "common.coordinator", node = %node, "Concurrent Up won, subscription dropped");
            return;
        }
        links.insert(
            node.id.clone(),
            NodeLink {
                requestor,
                subscription,
            },
        );
        drop(links);

        info!(target: "common.coordinator", node = %node, "Node up, requestor created");
    }

    async fn node_down(&self, node: &ServiceNode) {
        let removed = self.links.lock().await.remove(&node.id);
        match removed {
            Some(link) => {
                if let Some(token) = link.subscription {
                    token.cancel();
                }
                info!(target: "common.coordinator", node = %node, "Node down, requestor dropped");
            }
            None => {
                debug!(target: "common.coordinator", node = %node, "Down for unknown node ignored");
            }
        }
    }

    async fn requestor_for(&self, node: &ServiceNode) -> Result<Requestor> {
        self.links
            .lock()
            .await
            .get(&node.id)
            .map(|link| link.requestor.clone())
            .ok_or_else(|| ClusterError::HandlerUnavailable(format!("no requestor for {node}")))
    }

    /// Requestor of the first live node of service `name` (by id order).
    ///
    /// # Errors
    ///
    /// Returns `HandlerUnavailable` when no such node has a requestor.
    pub async fn requestor_by_service_name(&self, name: &str) -> Result<Requestor> {
        let nodes = self.watcher.get_nodes(name).await;
        let links = self.links.lock().await;
        nodes
            .iter()
            .find_map(|node| links.get(&node.id).map(|link| link.requestor.clone()))
            .ok_or_else(|| ClusterError::HandlerUnavailable(format!("no live {name} node")))
    }

    /// Requestor of the node with id `id`.
    ///
    /// # Errors
    ///
    /// Returns `HandlerUnavailable` when the node is unknown or has no requestor.
    pub async fn requestor_by_node_id(&self, id: &str) -> Result<Requestor> {
        let node = self
            .watcher
            .get_node_by_id(id)
            .await
            .ok_or_else(|| ClusterError::HandlerUnavailable(format!("unknown node {id}")))?;
        self.requestor_for(&node).await
    }

    /// Requestor of the least-loaded node of service `name` in the local
    /// datacenter, together with that node.
    ///
    /// # Errors
    ///
    /// Returns `HandlerUnavailable` when no such node has a requestor.
    pub async fn requestor_by_least_load(&self, name: &str) -> Result<(Requestor, ServiceNode)> {
        let node = self
            .watcher
            .get_node_by_payload(&self.local.dc, name)
            .await
            .ok_or_else(|| {
                ClusterError::HandlerUnavailable(format!("no {name} node in {}", self.local.dc))
            })?;
        let requestor = self.requestor_for(&node).await?;
        Ok((requestor, node))
    }

    /// Whether node `id` currently has a requestor.
    pub async fn has_requestor(&self, id: &str) -> bool {
        self.links.lock().await.contains_key(id)
    }

    /// Whether node `id` currently has a broadcast subscription.
    pub async fn has_subscription(&self, id: &str) -> bool {
        self.links
            .lock()
            .await
            .get(id)
            .is_some_and(|link| link.subscription.is_some())
    }

    /// Number of live requestors.
    pub async fn requestor_count(&self) -> usize {
        self.links.lock().await.len()
    }

    /// Cancel every subscription and drop every requestor.
    pub async fn close(&self) {
        self.cancel_token.cancel();
        self.links.lock().await.clear();
        info!(target: "common.coordinator", "Coordinator closed");
    }
}

#[async_trait]
impl NodeEventHandler for ClusterCoordinator {
    async fn on_node_event(&self, state: NodeState, node: &ServiceNode) {
        match state {
            NodeState::Up => self.node_up(node).await,
            NodeState::Down => self.node_down(node).await,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::store::{MemoryNodeStore, NodeStore};
    use crate::types::SERVICE_BIZ;
    use serde_json::json;

    const TTL: Duration = Duration::from_secs(30);

    struct Harness {
        store: Arc<MemoryNodeStore>,
        bus: Arc<MemoryBus>,
        coordinator: Arc<ClusterCoordinator>,
        inbound: mpsc::Receiver<InboundBroadcast>,
    }

    impl Harness {
        fn new() -> Self {
            let store = Arc::new(MemoryNodeStore::new());
            let bus = Arc::new(MemoryBus::new());
            let watcher = Arc::new(ServiceWatcher::new(Arc::clone(&store) as Arc<dyn NodeStore>));
            let (tx, inbound) = mpsc::channel(16);
            let coordinator = Arc::new(ClusterCoordinator::new(
                ServiceNode::new("biz-1", "dc1", SERVICE_BIZ),
                watcher,
                Arc::clone(&bus) as Arc<dyn MessageBus>,
                Duration::from_secs(1),
                Some(tx),
            ));
            Self {
                store,
                bus,
                coordinator,
                inbound,
            }
        }

        async fn add(&self, node: &ServiceNode) {
            self.store.put(node, TTL).await.unwrap();
            self.sync().await;
        }

        async fn remove(&self, node: &ServiceNode) {
            self.store.delete(&node.dc, &node.id).await.unwrap();
            self.sync().await;
        }

        async fn sync(&self) {
            let transitions = self.coordinator.watcher().poll_once("").await.unwrap();
            for (state, node) in transitions {
                self.coordinator.on_node_event(state, &node).await;
            }
        }
    }

    #[tokio::test]
    async fn test_up_and_down_manage_requestors() {
        let h = Harness::new();
        let sfu = ServiceNode::new("sfu-1", "dc1", SERVICE_SFU);

        h.add(&sfu).await;
        assert!(h.coordinator.has_requestor("sfu-1").await);
        assert_eq!(
            h.coordinator.requestor_by_node_id("sfu-1").await.unwrap().channel(),
            "rpc-dc1-sfu-1"
        );

        h.remove(&sfu).await;
        assert!(!h.coordinator.has_requestor("sfu-1").await);
        assert!(matches!(
            h.coordinator.requestor_by_node_id("sfu-1").await,
            Err(ClusterError::HandlerUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_up_keeps_single_requestor() {
        let h = Harness::new();
        let sfu = ServiceNode::new("sfu-1", "dc1", SERVICE_SFU);
        h.add(&sfu).await;
        h.coordinator.on_node_event(NodeState::Up, &sfu).await;

        assert_eq!(h.coordinator.requestor_count().await, 1);
        assert_eq!(h.bus.subscriber_count(&sfu.event_channel()).await, 1);
    }

    #[tokio::test]
    async fn test_subscription_rule() {
        let h = Harness::new();
        let me = ServiceNode::new("biz-1", "dc1", SERVICE_BIZ);
        let peer = ServiceNode::new("biz-2", "dc1", SERVICE_BIZ);
        let sfu = ServiceNode::new("sfu-1", "dc1", SERVICE_SFU);
        let islb = ServiceNode::new("islb-1", "dc1", "islb");

        for node in [&me, &peer, &sfu, &islb] {
            h.add(node).await;
        }

        assert!(!h.coordinator.has_subscription("biz-1").await);
        assert!(h.coordinator.has_subscription("biz-2").await);
        assert!(h.coordinator.has_subscription("sfu-1").await);
        assert!(!h.coordinator.has_subscription("islb-1").await);
        assert!(h.coordinator.has_requestor("islb-1").await);
    }

    #[tokio::test]
    async fn test_broadcasts_are_forwarded_with_origin() {
        let mut h = Harness::new();
        let sfu = ServiceNode::new("sfu-1", "dc1", SERVICE_SFU);
        h.add(&sfu).await;

        h.bus
            .publish(
                &sfu.event_channel(),
                BroadcastEvent::new("sfu-stream-remove", json!({"mid": "m1"})),
            )
            .await
            .unwrap();

        let inbound = tokio::time::timeout(Duration::from_secs(1), h.inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.from.id, "sfu-1");
        assert_eq!(inbound.event.data["mid"], "m1");
    }

    #[tokio::test]
    async fn test_down_cancels_subscription() {
        let h = Harness::new();
        let sfu = ServiceNode::new("sfu-1", "dc1", SERVICE_SFU);
        h.add(&sfu).await;
        h.remove(&sfu).await;

        // The forwarding task drops its receiver once cancelled
        tokio::time::timeout(Duration::from_secs(1), async {
            while h.bus.subscriber_count(&sfu.event_channel()).await > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_least_load_lookup_stays_in_local_dc() {
        let h = Harness::new();
        h.add(&ServiceNode::new("sfu-a", "dc1", SERVICE_SFU).with_load(3))
            .await;
        h.add(&ServiceNode::new("sfu-b", "dc1", SERVICE_SFU).with_load(1))
            .await;
        h.add(&ServiceNode::new("sfu-c", "dc2", SERVICE_SFU).with_load(0))
            .await;

        let (requestor, node) = h.coordinator.requestor_by_least_load(SERVICE_SFU).await.unwrap();
        assert_eq!(node.id, "sfu-b");
        assert_eq!(requestor.channel(), "rpc-dc1-sfu-b");
    }

    #[tokio::test]
    async fn test_lookups_fail_soft_when_empty() {
        let h = Harness::new();
        assert!(matches!(
            h.coordinator.requestor_by_service_name("islb").await,
            Err(ClusterError::HandlerUnavailable(_))
        ));
        assert!(matches!(
            h.coordinator.requestor_by_least_load(SERVICE_SFU).await,
            Err(ClusterError::HandlerUnavailable(_))
        ));
    }

    /// Bus whose `subscribe` waits until released.
    struct GatedBus {
        inner: MemoryBus,
        gate: tokio::sync::Semaphore,
    }

    #[async_trait]
    impl MessageBus for GatedBus {
        async fn request(
            &self,
            channel: &str,
            method: &str,
            data: serde_json::Value,
            timeout: Duration,
        ) -> std::result::Result<serde_json::Value, crate::bus::RpcError> {
            self.inner.request(channel, method, data, timeout).await
        }

        async fn serve(
            &self,
            channel: &str,
        ) -> Result<mpsc::Receiver<crate::bus::IncomingRequest>> {
            self.inner.serve(channel).await
        }

        async fn publish(&self, topic: &str, event: BroadcastEvent) -> Result<()> {
            self.inner.publish(topic, event).await
        }

        async fn subscribe(
            &self,
            topic: &str,
            group: Option<&str>,
        ) -> Result<mpsc::Receiver<BroadcastEvent>> {
            let _permit = self.gate.acquire().await;
            self.inner.subscribe(topic, group).await
        }
    }

    #[tokio::test]
    async fn test_slow_subscribe_does_not_block_lookups() {
        let store = Arc::new(MemoryNodeStore::new());
        let bus = Arc::new(GatedBus {
            inner: MemoryBus::new(),
            gate: tokio::sync::Semaphore::new(0),
        });
        let watcher = Arc::new(ServiceWatcher::new(Arc::clone(&store) as Arc<dyn NodeStore>));
        let (tx, _inbound) = mpsc::channel(16);
        let coordinator = Arc::new(ClusterCoordinator::new(
            ServiceNode::new("biz-1", "dc1", SERVICE_BIZ),
            Arc::clone(&watcher),
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            Duration::from_secs(1),
            Some(tx),
        ));

        let islb = ServiceNode::new("islb-1", "dc1", "islb");
        let sfu = ServiceNode::new("sfu-1", "dc1", SERVICE_SFU);
        store.put(&islb, TTL).await.unwrap();
        store.put(&sfu, TTL).await.unwrap();
        watcher.poll_once("").await.unwrap();
        coordinator.on_node_event(NodeState::Up, &islb).await;

        let pending = {
            let coordinator = Arc::clone(&coordinator);
            let sfu = sfu.clone();
            tokio::spawn(async move { coordinator.on_node_event(NodeState::Up, &sfu).await })
        };
        tokio::task::yield_now().await;

        let lookup = tokio::time::timeout(
            Duration::from_millis(200),
            coordinator.requestor_by_service_name("islb"),
        )
        .await
        .expect("lookup waited on a pending subscribe");
        assert_eq!(lookup.unwrap().channel(), "rpc-dc1-islb-1");
        assert!(!coordinator.has_requestor("sfu-1").await);

        bus.gate.add_permits(1);
        pending.await.unwrap();
        assert!(coordinator.has_requestor("sfu-1").await);
        assert!(coordinator.has_subscription("sfu-1").await);
    }

    #[tokio::test]
    async fn test_service_name_lookup_uses_first_by_id() {
        let h = Harness::new();
        h.add(&ServiceNode::new("islb-b", "dc1", "islb")).await;
        h.add(&ServiceNode::new("islb-a", "dc1", "islb")).await;

        let requestor = h.coordinator.requestor_by_service_name("islb").await.unwrap();
        assert_eq!(requestor.channel(), "rpc-dc1-islb-a");
    }
}
