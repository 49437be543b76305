//! Publisher-side media handling.

pub mod publisher;
pub mod registry;
pub mod transport;
pub mod webrtc;

pub use publisher::{Pub, PubState};
pub use registry::{PubEntry, PubRegistry, RemoveReason};
pub use transport::{
    ConnectionState, MediaKind, TrackReadError, TrackReceiver, TransportEvent, TransportFactory,
    TransportSession,
};
pub use webrtc::WebRtcFactory;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod test_support;
