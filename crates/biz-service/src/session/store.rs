//! Room map guarded by a single mutex.
//!
//! Callers never hold the lock across an RPC: the reconciler takes a
//! [`snapshot`](SessionStore::snapshot), talks to the presence service, then
//! applies removals.

use super::peer::Peer;
use super::room::Room;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Every room with at least one local peer.
#[derive(Debug, Default)]
pub struct SessionStore {
    rooms: Mutex<BTreeMap<String, Room>>,
    // Mirrors the peer total for lock-free load reporting
    peers: AtomicUsize,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer, creating the room on first join.
    ///
    /// Returns the peer previously registered under the same id, if any.
    pub async fn add_peer(&self, rid: &str, peer: Arc<Peer>) -> Option<Arc<Peer>> {
        let mut rooms = self.rooms.lock().await;
        let room = rooms.entry(rid.to_string()).or_insert_with(|| {
            debug!(target: "biz.session", rid = %rid, "Room created");
            Room::new(rid)
        });
        let previous = room.add_peer(peer);
        if previous.is_none() {
            self.peers.fetch_add(1, Ordering::Relaxed);
        }
        previous
    }

    /// Remove a peer. The room is kept even when it becomes empty; see
    /// [`delete_room_if_empty`](Self::delete_room_if_empty).
    pub async fn remove_peer(&self, rid: &str, uid: &str) -> Option<Arc<Peer>> {
        let mut rooms = self.rooms.lock().await;
        let removed = rooms.get_mut(rid).and_then(|room| room.remove_peer(uid));
        if removed.is_some() {
            self.peers.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Remove `peer` from `rid` only while it is still the connection
    /// registered under its id. A newer connection for the same id stays.
    pub async fn remove_peer_if_current(&self, rid: &str, peer: &Arc<Peer>) -> bool {
        let mut rooms = self.rooms.lock().await;
        let Some(room) = rooms.get_mut(rid) else {
            return false;
        };
        if !room
            .get_peer(peer.id())
            .is_some_and(|current| Arc::ptr_eq(&current, peer))
        {
            return false;
        }
        room.remove_peer(peer.id());
        self.peers.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// Rooms in which `peer` is the connection registered under its id.
    pub async fn rooms_of(&self, peer: &Arc<Peer>) -> Vec<String> {
        self.rooms
            .lock()
            .await
            .values()
            .filter(|room| {
                room.get_peer(peer.id())
                    .is_some_and(|current| Arc::ptr_eq(&current, peer))
            })
            .map(|room| room.id().to_string())
            .collect()
    }

    /// Delete the room if it has no peers. Returns whether it was deleted.
    pub async fn delete_room_if_empty(&self, rid: &str) -> bool {
        let mut rooms = self.rooms.lock().await;
        if rooms.get(rid).is_some_and(Room::is_empty) {
            rooms.remove(rid);
            debug!(target: "biz.session", rid = %rid, "Room deleted");
            return true;
        }
        false
    }

    pub async fn get_peer(&self, rid: &str, uid: &str) -> Option<Arc<Peer>> {
        self.rooms
            .lock()
            .await
            .get(rid)
            .and_then(|room| room.get_peer(uid))
    }

    /// Peers of a room, ordered by id. Empty when the room does not exist.
    pub async fn room_peers(&self, rid: &str) -> Vec<Arc<Peer>> {
        self.rooms
            .lock()
            .await
            .get(rid)
            .map(Room::peers)
            .unwrap_or_default()
    }

    /// Point-in-time copy of every room and its peers.
    pub async fn snapshot(&self) -> Vec<(String, Vec<Arc<Peer>>)> {
        self.rooms
            .lock()
            .await
            .values()
            .map(|room| (room.id().to_string(), room.peers()))
            .collect()
    }

    pub async fn has_room(&self, rid: &str) -> bool {
        self.rooms.lock().await.contains_key(rid)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }

    pub async fn peer_count(&self) -> usize {
        self.rooms.lock().await.values().map(Room::len).sum()
    }

    /// Peer total without taking the lock; used as the node's reported load.
    pub fn load(&self) -> u64 {
        u64::try_from(self.peers.load(Ordering::Relaxed)).unwrap_or(u64::MAX)
    }
}
