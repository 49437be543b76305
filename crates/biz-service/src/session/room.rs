//! A room and its local peers.

use super::peer::Peer;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A room as seen by this node.
#[derive(Debug)]
pub struct Room {
    id: String,
    peers: BTreeMap<String, Arc<Peer>>,
}

impl Room {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            peers: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Add or replace a peer. Returns the replaced peer, if any.
    pub fn add_peer(&mut self, peer: Arc<Peer>) -> Option<Arc<Peer>> {
        self.peers.insert(peer.id().to_string(), peer)
    }

    pub fn remove_peer(&mut self, uid: &str) -> Option<Arc<Peer>> {
        self.peers.remove(uid)
    }

    pub fn get_peer(&self, uid: &str) -> Option<Arc<Peer>> {
        self.peers.get(uid).cloned()
    }

    /// Peers ordered by id.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
