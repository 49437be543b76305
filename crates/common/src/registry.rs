//! Local node registration.
//!
//! A node publishes one TTL-bounded record about itself and refreshes it on a
//! fixed interval, carrying its current load. If the process dies the record
//! expires and discovery reports the node Down.
//!
//! # Graceful Shutdown
//!
//! [`NodeRegistry::run_keepalive`] exits when its cancellation token fires;
//! [`NodeRegistry::close`] then deletes the record so peers see the departure
//! without waiting for the TTL.

use crate::error::Result;
use crate::store::NodeStore;
use crate::types::ServiceNode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Registers the local node and keeps its record alive.
pub struct NodeRegistry {
    store: Arc<dyn NodeStore>,
    node: ServiceNode,
    load: AtomicU64,
    ttl: Duration,
}

impl NodeRegistry {
    /// Create a registry for `node`. Nothing is written until
    /// [`register_node`](Self::register_node).
    #[must_use]
    pub fn new(store: Arc<dyn NodeStore>, node: ServiceNode, ttl: Duration) -> Self {
        let load = AtomicU64::new(node.load);
        Self {
            store,
            node,
            load,
            ttl,
        }
    }

    /// Snapshot of the local node with its current load.
    #[must_use]
    pub fn node(&self) -> ServiceNode {
        self.node
            .clone()
            .with_load(self.load.load(Ordering::Relaxed))
    }

    /// Write the node record with a fresh TTL.
    ///
    /// # Errors
    ///
    /// Returns the store error. At startup this is fatal.
    pub async fn register_node(&self) -> Result<()> {
        self.store.put(&self.node(), self.ttl).await?;
        info!(
            target: "common.registry",
            node = %self.node,
            ttl_seconds = self.ttl.as_secs(),
            "Node registered"
        );
        Ok(())
    }

    /// Record a new load value and rewrite the record.
    ///
    /// # Errors
    ///
    /// Returns the store error; the load value is kept for the next refresh.
    pub async fn update_load(&self, load: u64) -> Result<()> {
        self.load.store(load, Ordering::Relaxed);
        self.store.put(&self.node(), self.ttl).await
    }

    /// Refresh the record every `interval` with the value of `load_source`
    /// until `cancel_token` fires.
    ///
    /// Store failures are logged and retried on the next tick; the record
    /// only lapses if failures persist past the TTL.
    #[instrument(skip_all, name = "common.registry.keepalive", fields(node_id = %self.node.id))]
    pub async fn run_keepalive<F>(&self, interval: Duration, load_source: F, cancel_token: CancellationToken)
    where
        F: Fn() -> u64 + Send + Sync,
    {
        info!(
            target: "common.registry",
            interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            "Starting node keepalive"
        );

        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; registration already wrote the record
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let load = load_source();
                    match self.update_load(load).await {
                        Ok(()) => {
                            debug!(target: "common.registry", load = load, "Node record refreshed");
                        }
                        Err(e) => {
                            warn!(
                                target: "common.registry",
                                error = %e,
                                "Failed to refresh node record, will retry"
                            );
                        }
                    }
                }
                () = cancel_token.cancelled() => {
                    info!(target: "common.registry", "Node keepalive received shutdown signal, exiting");
                    break;
                }
            }
        }
    }

    /// Delete the node record.
    pub async fn close(&self) {
        match self.store.delete(&self.node.dc, &self.node.id).await {
            Ok(()) => info!(target: "common.registry", node = %self.node, "Node deregistered"),
            Err(e) => error!(
                target: "common.registry",
                node = %self.node,
                error = %e,
                "Failed to delete node record; it will expire with its TTL"
            ),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::MemoryNodeStore;
    use std::sync::atomic::AtomicU64;

    fn registry(store: &Arc<MemoryNodeStore>, ttl: Duration) -> Arc<NodeRegistry> {
        Arc::new(NodeRegistry::new(
            Arc::clone(store) as Arc<dyn NodeStore>,
            ServiceNode::new("sfu-1", "dc1", "sfu"),
            ttl,
        ))
    }

    #[tokio::test]
    async fn test_register_and_close() {
        let store = Arc::new(MemoryNodeStore::new());
        let registry = registry(&store, Duration::from_secs(30));

        registry.register_node().await.unwrap();
        assert_eq!(store.list("").await.unwrap().len(), 1);

        registry.close().await;
        assert!(store.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_load_is_visible() {
        let store = Arc::new(MemoryNodeStore::new());
        let registry = registry(&store, Duration::from_secs(30));
        registry.register_node().await.unwrap();

        registry.update_load(4).await.unwrap();

        assert_eq!(registry.node().load, 4);
        assert_eq!(store.list("").await.unwrap().first().unwrap().load, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_refreshes_before_ttl() {
        let store = Arc::new(MemoryNodeStore::new());
        let registry = registry(&store, Duration::from_secs(3));
        registry.register_node().await.unwrap();

        let counter = Arc::new(AtomicU64::new(0));
        let cancel_token = CancellationToken::new();
        let handle = {
            let registry = Arc::clone(&registry);
            let counter = Arc::clone(&counter);
            let cancel_token = cancel_token.clone();
            tokio::spawn(async move {
                registry
                    .run_keepalive(
                        Duration::from_secs(1),
                        move || counter.fetch_add(1, Ordering::Relaxed) + 1,
                        cancel_token,
                    )
                    .await;
            })
        };

        // Well past the TTL; the record survives because it is refreshed
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        let nodes = store.list("").await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert!(nodes.first().unwrap().load >= 9);

        cancel_token.cancel();
        handle.await.unwrap();

        // Without refreshes the record lapses
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(store.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keepalive_stops_on_cancel() {
        let store = Arc::new(MemoryNodeStore::new());
        let registry = registry(&store, Duration::from_secs(30));
        let cancel_token = CancellationToken::new();
        cancel_token.cancel();

        tokio::time::timeout(
            Duration::from_secs(1),
            registry.run_keepalive(Duration::from_secs(10), || 0, cancel_token),
        )
        .await
        .expect("keepalive should exit promptly once cancelled");
    }
}
