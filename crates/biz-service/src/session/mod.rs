//! Room and peer bookkeeping for the signaling node.
//!
//! The session store is a local cache of who is connected here. The presence
//! service is authoritative; the room reconciler converges this cache to it.

pub mod peer;
pub mod room;
pub mod store;

pub use peer::{Peer, PeerTransport};
pub use room::Room;
pub use store::SessionStore;
