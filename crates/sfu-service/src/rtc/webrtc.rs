//! `webrtc`-rs implementation of the transport seam.
//!
//! Each session is a recvonly peer connection with one audio (Opus, PT 111,
//! 48 kHz) and one video (VP8, PT 96, 90 kHz) transceiver. Connection state
//! changes and remote tracks are forwarded as [`TransportEvent`]s.

use super::transport::{
    ConnectionState, MediaKind, TrackReadError, TrackReceiver, TransportEvent, TransportFactory,
    TransportSession,
};
use crate::errors::SfuError;
use async_trait::async_trait;
use common::protocol::SessionDescription;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::packet::Packet as RtcpPacket;
use webrtc::rtp::packet::Packet as RtpPacket;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_remote::TrackRemote;

const PAYLOAD_TYPE_OPUS: u8 = 111;
const PAYLOAD_TYPE_VP8: u8 = 96;
const EVENT_BUFFER: usize = 16;
const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(10);

/// Creates `webrtc`-rs sessions.
pub struct WebRtcFactory {
    ice_servers: Vec<String>,
    port_range: Option<(u16, u16)>,
}

impl WebRtcFactory {
    pub fn new(ice_servers: Vec<String>, port_range: Option<(u16, u16)>) -> Self {
        Self {
            ice_servers,
            port_range,
        }
    }

    fn build_api(&self) -> Result<API, SfuError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                    rtcp_feedback: vec![],
                },
                payload_type: PAYLOAD_TYPE_OPUS,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![],
                },
                payload_type: PAYLOAD_TYPE_VP8,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let mut setting_engine = SettingEngine::default();
        if let Some((start, end)) = self.port_range {
            let ephemeral = EphemeralUDP::new(start, end)
                .map_err(|e| SfuError::Transport(format!("invalid UDP port range: {e}")))?;
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
        }

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build())
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

async fn add_recvonly(pc: &RTCPeerConnection, kind: RTPCodecType) -> Result<(), SfuError> {
    pc.add_transceiver_from_kind(
        kind,
        Some(RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Recvonly,
            send_encodings: vec![],
        }),
    )
    .await?;
    Ok(())
}

fn map_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn create(
        &self,
        pub_id: &str,
    ) -> Result<(Arc<dyn TransportSession>, mpsc::Receiver<TransportEvent>), SfuError> {
        let api = self.build_api()?;
        let pc = Arc::new(api.new_peer_connection(self.rtc_configuration()).await?);

        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            if let Err(e) = add_recvonly(&pc, kind).await {
                warn!(target: "sfu.rtc.webrtc", pub_id = %pub_id, kind = %kind, error = %e, "Transceiver setup failed");
                if let Err(close_err) = pc.close().await {
                    debug!(target: "sfu.rtc.webrtc", error = %close_err, "Close after failed setup");
                }
                return Err(e);
            }
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

        {
            let events_tx = events_tx.clone();
            let pub_id = pub_id.to_string();
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let events_tx = events_tx.clone();
                let pub_id = pub_id.clone();
                Box::pin(async move {
                    debug!(target: "sfu.rtc.webrtc", pub_id = %pub_id, state = %state, "Peer connection state changed");
                    forward_event(&events_tx, &pub_id, TransportEvent::StateChanged(map_state(state)))
                        .await;
                })
            }));
        }

        {
            let pub_id = pub_id.to_string();
            pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
                let events_tx = events_tx.clone();
                let pub_id = pub_id.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => MediaKind::Audio,
                        RTPCodecType::Video => MediaKind::Video,
                        RTPCodecType::Unspecified => return,
                    };
                    info!(
                        target: "sfu.rtc.webrtc",
                        pub_id = %pub_id,
                        kind = %kind,
                        ssrc = track.ssrc(),
                        "Remote track received"
                    );
                    let receiver: Arc<dyn TrackReceiver> = Arc::new(WebRtcTrack { track });
                    forward_event(&events_tx, &pub_id, TransportEvent::Track(kind, receiver)).await;
                })
            }));
        }

        let session: Arc<dyn TransportSession> = Arc::new(WebRtcSession {
            pc,
            closed: AtomicBool::new(false),
        });
        Ok((session, events_rx))
    }
}

/// Hand a peer-connection event to the publisher. Returns false once the
/// publisher has gone away.
async fn forward_event(
    events_tx: &mpsc::Sender<TransportEvent>,
    pub_id: &str,
    event: TransportEvent,
) -> bool {
    if events_tx.send(event).await.is_err() {
        debug!(target: "sfu.rtc.webrtc", pub_id = %pub_id, "Publisher gone, transport event dropped");
        return false;
    }
    true
}

/// One recvonly peer connection.
pub struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
    closed: AtomicBool,
}

#[async_trait]
impl TransportSession for WebRtcSession {
    async fn answer(&self, offer: SessionDescription) -> Result<SessionDescription, SfuError> {
        if offer.kind != "offer" {
            return Err(SfuError::Negotiation(format!(
                "expected an offer, got {}",
                offer.kind
            )));
        }
        let offer = RTCSessionDescription::offer(offer.sdp)
            .map_err(|e| SfuError::Negotiation(e.to_string()))?;

        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| SfuError::Negotiation(e.to_string()))?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| SfuError::Negotiation(e.to_string()))?;

        let mut gather_complete = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| SfuError::Negotiation(e.to_string()))?;
        if tokio::time::timeout(ICE_GATHER_TIMEOUT, gather_complete.recv())
            .await
            .is_err()
        {
            warn!(target: "sfu.rtc.webrtc", "ICE gathering timed out, answering with partial candidates");
        }

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| SfuError::Negotiation("local description unavailable".to_string()))?;
        Ok(SessionDescription::answer(local.sdp))
    }

    async fn write_rtcp(&self, packet: Box<dyn RtcpPacket + Send + Sync>) -> Result<(), SfuError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SfuError::SessionAbsent);
        }
        self.pc.write_rtcp(&[packet]).await?;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.pc.close().await {
            warn!(target: "sfu.rtc.webrtc", error = %e, "Peer connection close failed");
        }
    }
}

struct WebRtcTrack {
    track: Arc<TrackRemote>,
}

#[async_trait]
impl TrackReceiver for WebRtcTrack {
    async fn read_rtp(&self) -> Result<RtpPacket, TrackReadError> {
        // Any read failure means the track is finished for our purposes
        self.track
            .read_rtp()
            .await
            .map(|(packet, _attributes)| packet)
            .map_err(|e| {
                debug!(target: "sfu.rtc.webrtc", error = %e, "Track read ended");
                TrackReadError::EndOfStream
            })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(map_state(RTCPeerConnectionState::Connected), ConnectionState::Connected);
        assert_eq!(map_state(RTCPeerConnectionState::Failed), ConnectionState::Failed);
        assert_eq!(
            map_state(RTCPeerConnectionState::Disconnected),
            ConnectionState::Disconnected
        );
        assert_eq!(map_state(RTCPeerConnectionState::Unspecified), ConnectionState::New);
    }

    #[tokio::test]
    async fn test_event_for_departed_publisher_is_dropped() {
        let (tx, mut rx) = mpsc::channel(1);
        let event = || TransportEvent::StateChanged(ConnectionState::Connected);

        assert!(forward_event(&tx, "pub-1", event()).await);
        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::StateChanged(ConnectionState::Connected))
        ));

        drop(rx);
        assert!(!forward_event(&tx, "pub-1", event()).await);
    }

    #[test]
    fn test_invalid_port_range_rejected() {
        let factory = WebRtcFactory::new(vec![], Some((6000, 5000)));
        assert!(matches!(factory.build_api(), Err(SfuError::Transport(_))));
    }

    #[tokio::test]
    async fn test_create_session_and_reject_non_offer() {
        let factory = WebRtcFactory::new(vec![], None);
        let (session, _events) = factory.create("pub-1").await.unwrap();

        let result = session.answer(SessionDescription::answer("v=0")).await;
        assert!(matches!(result, Err(SfuError::Negotiation(_))));

        session.close().await;
        session.close().await;
    }
}
