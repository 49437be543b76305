//! Common data types for Conclave nodes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Service name of signaling nodes.
pub const SERVICE_BIZ: &str = "biz";

/// Service name of media-forwarding nodes.
pub const SERVICE_SFU: &str = "sfu";

/// Service name of the authoritative presence service.
pub const SERVICE_ISLB: &str = "islb";

/// A cluster node as recorded in the coordination store.
///
/// The local process owns exactly one of these. Remote ones are cached by the
/// [`ServiceWatcher`](crate::discovery::ServiceWatcher).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceNode {
    /// Unique node id.
    pub id: String,
    /// Datacenter the node runs in.
    pub dc: String,
    /// Service name (`biz`, `sfu`, `islb`, ...).
    pub name: String,
    /// Load metric; lower is less loaded.
    pub load: u64,
}

impl ServiceNode {
    /// Create a node record with zero load.
    #[must_use]
    pub fn new(id: impl Into<String>, dc: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            dc: dc.into(),
            name: name.into(),
            load: 0,
        }
    }

    /// Builder-style load setter.
    #[must_use]
    pub fn with_load(mut self, load: u64) -> Self {
        self.load = load;
        self
    }

    /// Request channel other nodes use to call this node.
    #[must_use]
    pub fn rpc_channel(&self) -> String {
        format!("rpc-{}-{}", self.dc, self.id)
    }

    /// Broadcast topic this node publishes its events on.
    #[must_use]
    pub fn event_channel(&self) -> String {
        format!("event-{}-{}", self.dc, self.id)
    }
}

impl fmt::Display for ServiceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.dc, self.name, self.id)
    }
}

/// Node state transition observed by discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// The node appeared (first sighting).
    Up,
    /// The node's record disappeared or expired.
    Down,
}

impl NodeState {
    /// Returns the state as a string for logging and metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            NodeState::Up => "up",
            NodeState::Down => "down",
        }
    }
}
