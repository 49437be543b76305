//! Coordination substrate selection.
//!
//! With `REDIS_URL` set, the node store and message bus run over Redis.
//! Without it, both are in-process, which only makes sense for a single-node
//! deployment or tests.

use crate::bus::{MemoryBus, MessageBus, RedisBus};
use crate::config::ClusterConfig;
use crate::error::Result;
use crate::secret::ExposeSecret;
use crate::store::{MemoryNodeStore, NodeStore, RedisNodeStore};
use std::sync::Arc;
use tracing::{info, warn};

/// The store and bus a node runs on.
#[derive(Clone)]
pub struct Substrate {
    /// Coordination store.
    pub store: Arc<dyn NodeStore>,
    /// Message bus.
    pub bus: Arc<dyn MessageBus>,
}

impl Substrate {
    /// In-process store and bus.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(MemoryNodeStore::new()),
            bus: Arc::new(MemoryBus::new()),
        }
    }

    /// Connect according to `config`.
    ///
    /// # Errors
    ///
    /// Returns the connection error when Redis is configured but unreachable.
    pub async fn connect(config: &ClusterConfig) -> Result<Self> {
        let Some(url) = config.redis_url.as_ref() else {
            warn!(
                target: "common.substrate",
                "REDIS_URL not set, using in-memory substrate (single process only)"
            );
            return Ok(Self::in_memory());
        };

        let store = RedisNodeStore::connect(url.expose_secret()).await?;
        let bus = RedisBus::connect(url.expose_secret(), config.node_id.clone()).await?;
        info!(target: "common.substrate", "Connected to Redis substrate");

        Ok(Self {
            store: Arc::new(store),
            bus: Arc::new(bus),
        })
    }
}
