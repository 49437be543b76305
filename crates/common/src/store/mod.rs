//! Coordination store: the shared key space holding node records.
//!
//! Records are keyed by `(dc, id)` and carry a TTL. A record whose TTL lapses
//! disappears on its own, which is how a crashed node leaves the cluster.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryNodeStore;
pub use self::redis::RedisNodeStore;

use crate::error::Result;
use crate::types::ServiceNode;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Store key of a node: `{dc}/{id}`.
///
/// Discovery prefixes match against this key, so `""` selects every node and
/// `"dc1/"` selects the nodes of one datacenter.
#[must_use]
pub fn node_key(dc: &str, id: &str) -> String {
    format!("{dc}/{id}")
}

/// Value stored under a node key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Service name.
    pub name: String,
    /// Load metric.
    pub load: u64,
    /// Unix timestamp (seconds) of the last write.
    pub updated_at: i64,
}

impl NodeRecord {
    /// Build the record for `node`, stamped now.
    #[must_use]
    pub fn for_node(node: &ServiceNode) -> Self {
        Self {
            name: node.name.clone(),
            load: node.load,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Rebuild the node from its store key and record. Returns `None` for
    /// keys that are not `{dc}/{id}`.
    #[must_use]
    pub fn into_node(self, key: &str) -> Option<ServiceNode> {
        let (dc, id) = key.split_once('/')?;
        if dc.is_empty() || id.is_empty() {
            return None;
        }
        Some(ServiceNode::new(id, dc, self.name).with_load(self.load))
    }
}

/// Shared key space for node records.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Create or overwrite the node's record with a fresh TTL.
    async fn put(&self, node: &ServiceNode, ttl: Duration) -> Result<()>;

    /// Delete the node's record. Deleting an absent record is not an error.
    async fn delete(&self, dc: &str, id: &str) -> Result<()>;

    /// Every live record whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<ServiceNode>>;
}
