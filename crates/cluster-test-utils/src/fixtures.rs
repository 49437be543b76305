//! Node harnesses over one in-memory substrate.
//!
//! Discovery does not run in the background here: call `sync()` on a harness
//! to poll the store once and feed the transitions to its coordinator, so
//! tests control exactly when a node sees another come or go.

use crate::mock_transport::MockTransportFactory;
use biz_service::context::BizContext;
use common::bus::{Broadcaster, DELIVERY_BUFFER};
use common::coordinator::{ClusterCoordinator, InboundBroadcast};
use common::discovery::{NodeEventHandler, ServiceWatcher};
use common::protocol::RemovedPub;
use common::substrate::Substrate;
use common::types::{ServiceNode, SERVICE_BIZ, SERVICE_SFU};
use sfu_service::context::SfuContext;
use sfu_service::rpc_handler::serve_rpc;
use sfu_service::rtc::{PubRegistry, TransportFactory};
use sfu_service::tasks::run_stream_cleanup;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Datacenter every fixture node lives in.
pub const TEST_DC: &str = "dc1";

/// RPC timeout for fixture coordinators.
pub const TEST_RPC_TIMEOUT: Duration = Duration::from_secs(2);

const TEST_TTL: Duration = Duration::from_secs(3600);

/// A shared substrate for several nodes.
#[derive(Clone)]
pub struct TestCluster {
    pub substrate: Substrate,
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            substrate: Substrate::in_memory(),
        }
    }

    /// Register a bare node record, e.g. a peer signaling node that only
    /// needs to look alive.
    pub async fn register(&self, node: &ServiceNode) {
        self.substrate.store.put(node, TEST_TTL).await.unwrap();
    }

    /// Remove a node record, as if its TTL had lapsed.
    pub async fn deregister(&self, node: &ServiceNode) {
        self.substrate
            .store
            .delete(&node.dc, &node.id)
            .await
            .unwrap();
    }

    /// Register a signaling node and build its context.
    pub async fn biz_node(&self, id: &str) -> BizHarness {
        let node = ServiceNode::new(id, TEST_DC, SERVICE_BIZ);
        self.register(&node).await;

        let (inbound_tx, inbound_rx) = mpsc::channel(DELIVERY_BUFFER);
        let watcher = Arc::new(ServiceWatcher::new(Arc::clone(&self.substrate.store)));
        let coordinator = Arc::new(ClusterCoordinator::new(
            node.clone(),
            Arc::clone(&watcher),
            Arc::clone(&self.substrate.bus),
            TEST_RPC_TIMEOUT,
            Some(inbound_tx),
        ));
        let broadcaster = Broadcaster::new(Arc::clone(&self.substrate.bus), node.event_channel());
        let ctx = Arc::new(BizContext::new(Arc::clone(&coordinator), broadcaster));

        BizHarness {
            ctx,
            coordinator,
            watcher,
            inbound: Mutex::new(inbound_rx),
        }
    }

    /// Register a media node backed by a scripted transport and start
    /// serving its RPC channel and stream cleanup broadcasts.
    pub async fn sfu_node(&self, id: &str, load: u64) -> SfuHarness {
        let node = ServiceNode::new(id, TEST_DC, SERVICE_SFU).with_load(load);
        self.register(&node).await;

        let factory = Arc::new(MockTransportFactory::new());
        let (registry, cleanup_rx) = PubRegistry::new();
        let registry = Arc::new(registry);
        let ctx = Arc::new(SfuContext::new(
            node.clone(),
            Arc::clone(&registry),
            Arc::clone(&factory) as Arc<dyn TransportFactory>,
            100,
        ));

        let cancel = CancellationToken::new();
        serve_rpc(
            Arc::clone(&ctx),
            self.substrate.bus.as_ref(),
            cancel.child_token(),
        )
        .await
        .unwrap();

        let broadcaster = Broadcaster::new(Arc::clone(&self.substrate.bus), node.event_channel());
        SfuHarness {
            node,
            ctx,
            factory,
            registry,
            broadcaster,
            cleanup_rx: Mutex::new(Some(cleanup_rx)),
            cancel,
        }
    }
}

/// A signaling node under test.
pub struct BizHarness {
    pub ctx: Arc<BizContext>,
    pub coordinator: Arc<ClusterCoordinator>,
    pub watcher: Arc<ServiceWatcher>,
    inbound: Mutex<mpsc::Receiver<InboundBroadcast>>,
}

impl BizHarness {
    /// Poll discovery once and apply the transitions.
    pub async fn sync(&self) {
        let transitions = self.watcher.poll_once("").await.unwrap();
        for (state, node) in transitions {
            self.coordinator.on_node_event(state, &node).await;
        }
    }

    /// Next broadcast delivered to this node, failing after `timeout`.
    pub async fn next_broadcast(&self, timeout: Duration) -> InboundBroadcast {
        tokio::time::timeout(timeout, self.inbound.lock().await.recv())
            .await
            .expect("no broadcast delivered in time")
            .expect("inbound channel closed")
    }

    /// Whether a broadcast arrives within `timeout`.
    pub async fn try_next_broadcast(&self, timeout: Duration) -> Option<InboundBroadcast> {
        tokio::time::timeout(timeout, self.inbound.lock().await.recv())
            .await
            .ok()
            .flatten()
    }
}

/// A media node under test.
pub struct SfuHarness {
    pub node: ServiceNode,
    pub ctx: Arc<SfuContext>,
    pub factory: Arc<MockTransportFactory>,
    pub registry: Arc<PubRegistry>,
    broadcaster: Broadcaster,
    cleanup_rx: Mutex<Option<mpsc::Receiver<RemovedPub>>>,
    cancel: CancellationToken,
}

impl SfuHarness {
    /// Start turning registry removals into `sfu-stream-remove` broadcasts.
    pub async fn start_stream_cleanup(&self) {
        let rx = self
            .cleanup_rx
            .lock()
            .await
            .take()
            .expect("stream cleanup already started");
        tokio::spawn(run_stream_cleanup(
            self.broadcaster.clone(),
            rx,
            self.cancel.child_token(),
        ));
    }

    /// Take the registry's cleanup channel to inspect removals directly.
    pub async fn take_cleanup_rx(&self) -> mpsc::Receiver<RemovedPub> {
        self.cleanup_rx
            .lock()
            .await
            .take()
            .expect("cleanup channel already taken")
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SfuHarness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
