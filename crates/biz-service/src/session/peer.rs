//! Connected signaling peers.

use crate::errors::BizError;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Outbound side of a client connection.
///
/// The websocket adapter implements this for real clients; tests use a
/// recording mock.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Push a notification to the client.
    async fn notify(&self, method: &str, data: Value) -> Result<(), BizError>;

    /// Close the connection.
    async fn close(&self);
}

/// A client connected to this node.
#[derive(Clone)]
pub struct Peer {
    id: String,
    transport: Arc<dyn PeerTransport>,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Peer {
    pub fn new(id: impl Into<String>, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            id: id.into(),
            transport,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Push a notification to the client.
    pub async fn notify(&self, method: &str, data: Value) -> Result<(), BizError> {
        self.transport.notify(method, data).await
    }

    /// Close the client connection.
    pub async fn close(&self) {
        self.transport.close().await;
    }
}
