//! Scripted media transport.
//!
//! [`MockTransportFactory`] hands out sessions whose connection state and
//! tracks are driven by the test through a [`MockSessionHandle`]:
//!
//! ```rust,ignore
//! let factory = Arc::new(MockTransportFactory::new());
//! // ... a Pub is created through the factory ...
//! let session = factory.last_session();
//! let audio = session.add_track(MediaKind::Audio).await;
//! session.set_state(ConnectionState::Connected).await;
//! audio.send(1).await;
//! ```

use async_trait::async_trait;
use common::protocol::SessionDescription;
use sfu_service::errors::SfuError;
use sfu_service::rtc::{
    ConnectionState, MediaKind, TrackReadError, TrackReceiver, TransportEvent, TransportFactory,
    TransportSession,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use webrtc::rtcp::packet::Packet as RtcpPacket;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet as RtpPacket;

/// SDP body of every answer produced by a mock session.
pub const MOCK_ANSWER_SDP: &str = "v=0\r\ns=mock-answer\r\n";

/// Build a packet carrying `sequence_number`.
pub fn rtp_packet(sequence_number: u16) -> RtpPacket {
    RtpPacket {
        header: Header {
            sequence_number,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// A track whose packets come from the test.
pub struct MockTrack {
    rx: tokio::sync::Mutex<mpsc::Receiver<Result<RtpPacket, TrackReadError>>>,
}

#[async_trait]
impl TrackReceiver for MockTrack {
    async fn read_rtp(&self) -> Result<RtpPacket, TrackReadError> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .unwrap_or(Err(TrackReadError::EndOfStream))
    }
}

/// Test side of a [`MockTrack`]. Dropping it ends the stream.
#[derive(Clone)]
pub struct MockTrackFeed {
    tx: mpsc::Sender<Result<RtpPacket, TrackReadError>>,
}

impl MockTrackFeed {
    pub async fn send(&self, sequence_number: u16) {
        self.tx.send(Ok(rtp_packet(sequence_number))).await.unwrap();
    }

    /// Deliver a transient read failure.
    pub async fn fail(&self, reason: &str) {
        self.tx
            .send(Err(TrackReadError::Transport(reason.to_string())))
            .await
            .unwrap();
    }

    /// Deliver end-of-stream.
    pub async fn end(&self) {
        self.tx.send(Err(TrackReadError::EndOfStream)).await.unwrap();
    }
}

/// A scripted transport session.
#[derive(Default)]
pub struct MockSession {
    closed: AtomicBool,
    close_calls: AtomicUsize,
    rtcp_writes: AtomicUsize,
}

impl MockSession {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn rtcp_writes(&self) -> usize {
        self.rtcp_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportSession for MockSession {
    async fn answer(&self, offer: SessionDescription) -> Result<SessionDescription, SfuError> {
        if offer.kind != "offer" {
            return Err(SfuError::Negotiation(format!(
                "expected an offer, got {}",
                offer.kind
            )));
        }
        Ok(SessionDescription::answer(MOCK_ANSWER_SDP))
    }

    async fn write_rtcp(&self, _packet: Box<dyn RtcpPacket + Send + Sync>) -> Result<(), SfuError> {
        if self.is_closed() {
            return Err(SfuError::SessionAbsent);
        }
        self.rtcp_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Test side of a created session.
#[derive(Clone)]
pub struct MockSessionHandle {
    pub pub_id: String,
    pub session: Arc<MockSession>,
    events: mpsc::Sender<TransportEvent>,
}

impl MockSessionHandle {
    pub async fn set_state(&self, state: ConnectionState) {
        self.events
            .send(TransportEvent::StateChanged(state))
            .await
            .unwrap();
    }

    /// Attach a remote track of `kind` and return its feed.
    pub async fn add_track(&self, kind: MediaKind) -> MockTrackFeed {
        let (tx, rx) = mpsc::channel(256);
        let track = Arc::new(MockTrack {
            rx: tokio::sync::Mutex::new(rx),
        });
        self.events
            .send(TransportEvent::Track(kind, track))
            .await
            .unwrap();
        MockTrackFeed { tx }
    }
}

/// Factory producing [`MockSession`]s.
#[derive(Default)]
pub struct MockTransportFactory {
    sessions: Mutex<Vec<MockSessionHandle>>,
    fail_create: AtomicBool,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `create` calls fail.
    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn sessions(&self) -> Vec<MockSessionHandle> {
        self.sessions.lock().unwrap().clone()
    }

    pub fn last_session(&self) -> MockSessionHandle {
        self.sessions
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no session created yet")
    }

    pub fn session_for(&self, pub_id: &str) -> MockSessionHandle {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .find(|handle| handle.pub_id == pub_id)
            .cloned()
            .unwrap_or_else(|| panic!("no session for {pub_id}"))
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(
        &self,
        pub_id: &str,
    ) -> Result<(Arc<dyn TransportSession>, mpsc::Receiver<TransportEvent>), SfuError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(SfuError::Transport("scripted create failure".to_string()));
        }
        let session = Arc::new(MockSession::default());
        let (tx, rx) = mpsc::channel(64);
        self.sessions.lock().unwrap().push(MockSessionHandle {
            pub_id: pub_id.to_string(),
            session: Arc::clone(&session),
            events: tx,
        });
        Ok((session, rx))
    }
}
