//! Scripted transport used by the unit tests in this module.

use super::transport::{
    TrackReadError, TrackReceiver, TransportEvent, TransportFactory, TransportSession,
};
use crate::errors::SfuError;
use async_trait::async_trait;
use common::protocol::SessionDescription;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use webrtc::rtcp::packet::Packet as RtcpPacket;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet as RtpPacket;

pub fn packet(sequence_number: u16) -> RtpPacket {
    RtpPacket {
        header: Header {
            sequence_number,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Track fed from a channel; dropping the sender ends the stream.
pub struct ScriptedTrack {
    rx: tokio::sync::Mutex<mpsc::Receiver<RtpPacket>>,
}

impl ScriptedTrack {
    pub fn new() -> (Arc<Self>, mpsc::Sender<RtpPacket>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Arc::new(Self {
                rx: tokio::sync::Mutex::new(rx),
            }),
            tx,
        )
    }
}

#[async_trait]
impl TrackReceiver for ScriptedTrack {
    async fn read_rtp(&self) -> Result<RtpPacket, TrackReadError> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TrackReadError::EndOfStream)
    }
}

#[derive(Default)]
pub struct ScriptedSession {
    pub closed: AtomicBool,
}

#[async_trait]
impl TransportSession for ScriptedSession {
    async fn answer(&self, offer: SessionDescription) -> Result<SessionDescription, SfuError> {
        if offer.kind == "offer" {
            Ok(SessionDescription::answer("v=0 answer"))
        } else {
            Err(SfuError::Negotiation("not an offer".to_string()))
        }
    }

    async fn write_rtcp(&self, _packet: Box<dyn RtcpPacket + Send + Sync>) -> Result<(), SfuError> {
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out scripted sessions and keeps their event senders for the test.
#[derive(Default)]
pub struct ScriptedFactory {
    pub sessions: Mutex<Vec<(Arc<ScriptedSession>, mpsc::Sender<TransportEvent>)>>,
}

impl ScriptedFactory {
    pub fn last(&self) -> (Arc<ScriptedSession>, mpsc::Sender<TransportEvent>) {
        self.sessions.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl TransportFactory for ScriptedFactory {
    async fn create(
        &self,
        _pub_id: &str,
    ) -> Result<(Arc<dyn TransportSession>, mpsc::Receiver<TransportEvent>), SfuError> {
        let session = Arc::new(ScriptedSession::default());
        let (tx, rx) = mpsc::channel(16);
        self.sessions
            .lock()
            .unwrap()
            .push((Arc::clone(&session), tx));
        Ok((session, rx))
    }
}

/// Poll `condition` until it holds, failing the test after one second.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
