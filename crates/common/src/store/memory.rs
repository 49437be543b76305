//! In-process node store with TTL expiry.
//!
//! Expiry uses `tokio::time::Instant`, so tests can drive it with a paused
//! clock.

use super::{node_key, NodeRecord, NodeStore};
use crate::error::Result;
use crate::types::ServiceNode;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Node store backed by a map.
#[derive(Default)]
pub struct MemoryNodeStore {
    records: Mutex<BTreeMap<String, (NodeRecord, Instant)>>,
}

impl MemoryNodeStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn put(&self, node: &ServiceNode, ttl: Duration) -> Result<()> {
        let expires_at = Instant::now() + ttl;
        self.records.lock().await.insert(
            node_key(&node.dc, &node.id),
            (NodeRecord::for_node(node), expires_at),
        );
        Ok(())
    }

    async fn delete(&self, dc: &str, id: &str) -> Result<()> {
        self.records.lock().await.remove(&node_key(dc, id));
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ServiceNode>> {
        let now = Instant::now();
        let mut records = self.records.lock().await;
        records.retain(|_, (_, expires_at)| *expires_at > now);

        Ok(records
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .filter_map(|(key, (record, _))| record.clone().into_node(key))
            .collect())
    }
}
