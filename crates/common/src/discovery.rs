//! Service discovery.
//!
//! [`ServiceWatcher`] polls the coordination store, diffs the result against
//! its cache of known nodes, and reports each transition (first sighting: Up,
//! disappearance: Down) to a [`NodeEventHandler`]. Load changes update the
//! cache silently.
//!
//! Transitions are delivered sequentially from the watch task, after the cache
//! already reflects them, so a handler can query the watcher from inside its
//! callback.

use crate::error::Result;
use crate::store::NodeStore;
use crate::types::{NodeState, ServiceNode};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Receives node transitions from a [`ServiceWatcher`].
#[async_trait]
pub trait NodeEventHandler: Send + Sync {
    /// Called once per transition, in the order observed.
    async fn on_node_event(&self, state: NodeState, node: &ServiceNode);
}

/// Pick the least-loaded node of `name` in `dc`. Ties go to the lowest id.
#[must_use]
pub fn select_least_loaded<'a, I>(nodes: I, dc: &str, name: &str) -> Option<&'a ServiceNode>
where
    I: IntoIterator<Item = &'a ServiceNode>,
{
    nodes
        .into_iter()
        .filter(|node| node.dc == dc && node.name == name)
        .min_by(|a, b| a.load.cmp(&b.load).then_with(|| a.id.cmp(&b.id)))
}

/// Polling watcher over the coordination store.
pub struct ServiceWatcher {
    store: Arc<dyn NodeStore>,
    nodes: RwLock<HashMap<String, ServiceNode>>,
}

impl ServiceWatcher {
    /// Create a watcher with an empty cache.
    #[must_use]
    pub fn new(store: Arc<dyn NodeStore>) -> Self {
        Self {
            store,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    /// Poll the store once and update the cache.
    ///
    /// Returns the transitions, Downs before Ups, each group ordered by id.
    ///
    /// # Errors
    ///
    /// Returns the store error; the cache is left untouched.
    pub async fn poll_once(&self, prefix: &str) -> Result<Vec<(NodeState, ServiceNode)>> {
        let listed = self.store.list(prefix).await?;
        let mut current: HashMap<String, ServiceNode> = HashMap::with_capacity(listed.len());
        for node in listed {
            current.insert(node.id.clone(), node);
        }

        let mut cache = self.nodes.write().await;

        let mut downs: Vec<ServiceNode> = cache
            .iter()
            .filter(|(id, node)| !current.contains_key(*id) && node_matches(node, prefix))
            .map(|(_, node)| node.clone())
            .collect();
        let mut ups: Vec<ServiceNode> = current
            .values()
            .filter(|node| !cache.contains_key(&node.id))
            .cloned()
            .collect();
        downs.sort_by(|a, b| a.id.cmp(&b.id));
        ups.sort_by(|a, b| a.id.cmp(&b.id));

        for node in &downs {
            cache.remove(&node.id);
        }
        // Inserting refreshes load for known nodes too
        for (id, node) in current {
            cache.insert(id, node);
        }

        Ok(downs
            .into_iter()
            .map(|node| (NodeState::Down, node))
            .chain(ups.into_iter().map(|node| (NodeState::Up, node)))
            .collect())
    }

    /// Poll every `interval` and deliver transitions to `handler` until
    /// `cancel_token` fires.
    ///
    /// A failed poll is logged and skipped; nothing is reported Down because
    /// the store was unreachable.
    #[instrument(skip_all, name = "common.discovery.watch", fields(prefix = %prefix))]
    pub async fn watch_service_nodes(
        &self,
        prefix: &str,
        interval: Duration,
        handler: Arc<dyn NodeEventHandler>,
        cancel_token: CancellationToken,
    ) {
        info!(target: "common.discovery", "Starting service watcher");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.poll_once(prefix).await {
                        Ok(transitions) => {
                            for (state, node) in transitions {
                                debug!(
                                    target: "common.discovery",
                                    state = state.as_str(),
                                    node = %node,
                                    "Node transition"
                                );
                                handler.on_node_event(state, &node).await;
                            }
                        }
                        Err(e) => {
                            warn!(target: "common.discovery", error = %e, "Discovery poll failed");
                        }
                    }
                }
                () = cancel_token.cancelled() => {
                    info!(target: "common.discovery", "Service watcher received shutdown signal, exiting");
                    break;
                }
            }
        }
    }

    /// Known nodes of service `name`, ordered by id.
    pub async fn get_nodes(&self, name: &str) -> Vec<ServiceNode> {
        let cache = self.nodes.read().await;
        let mut nodes: Vec<ServiceNode> = cache
            .values()
            .filter(|node| node.name == name)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// The known node with this id.
    pub async fn get_node_by_id(&self, id: &str) -> Option<ServiceNode> {
        self.nodes.read().await.get(id).cloned()
    }

    /// The least-loaded known node of `name` in `dc`.
    pub async fn get_node_by_payload(&self, dc: &str, name: &str) -> Option<ServiceNode> {
        let cache = self.nodes.read().await;
        select_least_loaded(cache.values(), dc, name).cloned()
    }

    /// Number of known nodes.
    pub async fn node_count(&self) -> usize {
        self.nodes.read().await.len()
    }
}

fn node_matches(node: &ServiceNode, prefix: &str) -> bool {
    crate::store::node_key(&node.dc, &node.id).starts_with(prefix)
}
