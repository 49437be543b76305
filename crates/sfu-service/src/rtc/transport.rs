//! Media transport seam.
//!
//! A [`Pub`](super::publisher::Pub) never touches the WebRTC stack directly.
//! It asks a [`TransportFactory`] for a [`TransportSession`] plus a stream of
//! [`TransportEvent`]s, and reads packets from the [`TrackReceiver`]s those
//! events hand over. The production implementation lives in
//! [`webrtc`](super::webrtc); tests plug in scripted mocks.

use crate::errors::SfuError;
use async_trait::async_trait;
use common::protocol::SessionDescription;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::rtcp::packet::Packet as RtcpPacket;
use webrtc::rtp::packet::Packet as RtpPacket;

/// Media kind of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Returns the kind as a string for logging and metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Why a track read produced no packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackReadError {
    /// The remote stopped sending; no further packets will arrive.
    EndOfStream,
    /// A transient failure; the next read may succeed.
    Transport(String),
}

/// Inbound RTP source for one track.
#[async_trait]
pub trait TrackReceiver: Send + Sync {
    /// Wait for the next packet.
    async fn read_rtp(&self) -> Result<RtpPacket, TrackReadError>;
}

/// Something the transport reports to its publisher.
pub enum TransportEvent {
    /// The connection moved to a new state.
    StateChanged(ConnectionState),
    /// The remote started sending a track.
    Track(MediaKind, Arc<dyn TrackReceiver>),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::StateChanged(state) => f.debug_tuple("StateChanged").field(state).finish(),
            TransportEvent::Track(kind, _) => f.debug_tuple("Track").field(kind).finish(),
        }
    }
}

/// One inbound media session.
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Apply the remote offer and return the local answer.
    async fn answer(&self, offer: SessionDescription) -> Result<SessionDescription, SfuError>;

    /// Send one feedback packet to the remote.
    async fn write_rtcp(&self, packet: Box<dyn RtcpPacket + Send + Sync>) -> Result<(), SfuError>;

    /// Tear the session down. Safe to call more than once.
    async fn close(&self);
}

/// Creates transport sessions.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Create a recvonly session for publisher `pub_id`.
    ///
    /// On failure any partially created session has already been released.
    async fn create(
        &self,
        pub_id: &str,
    ) -> Result<(Arc<dyn TransportSession>, mpsc::Receiver<TransportEvent>), SfuError>;
}
