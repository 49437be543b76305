//! Redis-backed node store.
//!
//! Each record is a string key `conclave:node:{dc}/{id}` holding JSON, written
//! with `SET EX` so Redis expires it when the owner stops refreshing.

use super::{node_key, NodeRecord, NodeStore};
use crate::error::Result;
use crate::types::ServiceNode;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::warn;

const NODE_KEY_PREFIX: &str = "conclave:node:";
const SCAN_COUNT: usize = 100;

/// Node store over a Redis server.
#[derive(Clone)]
pub struct RedisNodeStore {
    connection: MultiplexedConnection,
}

impl RedisNodeStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `ClusterError::Store` if the URL is invalid or the connection fails.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self { connection })
    }
}

fn redis_key(dc: &str, id: &str) -> String {
    format!("{NODE_KEY_PREFIX}{}", node_key(dc, id))
}

#[async_trait]
impl NodeStore for RedisNodeStore {
    async fn put(&self, node: &ServiceNode, ttl: Duration) -> Result<()> {
        let body = serde_json::to_string(&NodeRecord::for_node(node))?;
        let mut conn = self.connection.clone();
        conn.set_ex::<_, _, ()>(redis_key(&node.dc, &node.id), body, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn delete(&self, dc: &str, id: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(redis_key(dc, id)).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ServiceNode>> {
        let mut conn = self.connection.clone();
        let pattern = format!("{NODE_KEY_PREFIX}{prefix}*");

        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();

        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        let mut nodes = Vec::with_capacity(keys.len());
        for (key, value) in keys.iter().zip(values) {
            // Expired between SCAN and MGET
            let Some(body) = value else { continue };
            let Some(store_key) = key.strip_prefix(NODE_KEY_PREFIX) else {
                continue;
            };
            match serde_json::from_str::<NodeRecord>(&body) {
                Ok(record) => {
                    if let Some(node) = record.into_node(store_key) {
                        nodes.push(node);
                    }
                }
                Err(e) => {
                    warn!(target: "common.store", key = %key, error = %e, "Skipping malformed node record");
                }
            }
        }
        Ok(nodes)
    }
}
