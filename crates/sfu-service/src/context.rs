//! Shared state for the media node's request handlers and tasks.

use crate::rtc::{PubRegistry, TransportFactory};
use common::types::ServiceNode;
use std::sync::Arc;

pub struct SfuContext {
    node: ServiceNode,
    registry: Arc<PubRegistry>,
    factory: Arc<dyn TransportFactory>,
    queue_capacity: usize,
}

impl SfuContext {
    pub fn new(
        node: ServiceNode,
        registry: Arc<PubRegistry>,
        factory: Arc<dyn TransportFactory>,
        queue_capacity: usize,
    ) -> Self {
        Self {
            node,
            registry,
            factory,
            queue_capacity,
        }
    }

    pub fn node(&self) -> &ServiceNode {
        &self.node
    }

    pub fn registry(&self) -> &Arc<PubRegistry> {
        &self.registry
    }

    pub fn factory(&self) -> &dyn TransportFactory {
        self.factory.as_ref()
    }

    /// Per-kind packet queue capacity for new publishers.
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }
}
