//! Per-process signaling node state.
//!
//! Everything a handler or background task needs is reached through one
//! [`BizContext`], created at startup and shared behind an `Arc`.

use crate::errors::BizError;
use crate::session::SessionStore;
use common::bus::{Broadcaster, Requestor};
use common::coordinator::ClusterCoordinator;
use common::error::ClusterError;
use common::types::{ServiceNode, SERVICE_ISLB};
use std::sync::Arc;

/// Shared state of a signaling node.
pub struct BizContext {
    node: ServiceNode,
    coordinator: Arc<ClusterCoordinator>,
    broadcaster: Broadcaster,
    rooms: SessionStore,
}

impl BizContext {
    pub fn new(coordinator: Arc<ClusterCoordinator>, broadcaster: Broadcaster) -> Self {
        Self {
            node: coordinator.local_node().clone(),
            coordinator,
            broadcaster,
            rooms: SessionStore::new(),
        }
    }

    /// The local node.
    pub fn node(&self) -> &ServiceNode {
        &self.node
    }

    pub fn node_id(&self) -> &str {
        &self.node.id
    }

    pub fn rooms(&self) -> &SessionStore {
        &self.rooms
    }

    pub fn coordinator(&self) -> &Arc<ClusterCoordinator> {
        &self.coordinator
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// RPC handle of the presence service.
    pub async fn islb(&self) -> Result<Requestor, BizError> {
        self.coordinator
            .requestor_by_service_name(SERVICE_ISLB)
            .await
            .map_err(|e| match e {
                ClusterError::HandlerUnavailable(_) => BizError::IslbUnavailable,
                other => BizError::Cluster(other),
            })
    }

    /// Whether `bizid` names a live signaling node: this one, or one with a
    /// live requestor.
    pub async fn is_biz_alive(&self, bizid: &str) -> bool {
        if bizid.is_empty() {
            return false;
        }
        bizid == self.node.id || self.coordinator.has_requestor(bizid).await
    }
}
