//! Recording client transport.
//!
//! ```rust,ignore
//! let (peer, transport) = MockPeer::connect("alice");
//! // ... handlers notify the peer ...
//! assert_eq!(transport.methods(), vec!["peer-join"]);
//! ```

use async_trait::async_trait;
use biz_service::errors::BizError;
use biz_service::session::{Peer, PeerTransport};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Records every notification pushed to a peer.
#[derive(Debug, Default)]
pub struct MockPeer {
    notifications: Mutex<Vec<(String, Value)>>,
    closed: AtomicBool,
}

impl MockPeer {
    /// Create a peer backed by a fresh recording transport.
    pub fn connect(uid: &str) -> (Arc<Peer>, Arc<MockPeer>) {
        let transport = Arc::new(MockPeer::default());
        let peer = Arc::new(Peer::new(uid, Arc::clone(&transport) as Arc<dyn PeerTransport>));
        (peer, transport)
    }

    /// Every notification received, oldest first.
    pub fn notifications(&self) -> Vec<(String, Value)> {
        self.notifications.lock().unwrap().clone()
    }

    /// Method names of every notification received.
    pub fn methods(&self) -> Vec<String> {
        self.notifications()
            .into_iter()
            .map(|(method, _)| method)
            .collect()
    }

    /// Payloads of the notifications named `method`.
    pub fn notifications_named(&self, method: &str) -> Vec<Value> {
        self.notifications()
            .into_iter()
            .filter(|(m, _)| m == method)
            .map(|(_, data)| data)
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerTransport for MockPeer {
    async fn notify(&self, method: &str, data: Value) -> Result<(), BizError> {
        if self.is_closed() {
            return Err(BizError::Internal("peer connection closed".to_string()));
        }
        self.notifications
            .lock()
            .unwrap()
            .push((method.to_string(), data));
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
