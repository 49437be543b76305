//! Publisher media ingestion.
//!
//! A [`Pub`] owns one transport session and turns the client's inbound audio
//! and video tracks into two bounded packet queues that forwarders drain with
//! [`Pub::read_audio_rtp`] and [`Pub::read_video_rtp`].
//!
//! # Lifecycle
//!
//! ```text
//! Created ──answer()──> Negotiating ──Connected──> Active
//!                                                  │  ▲
//!                            Disconnected (soft) / │  │ Connected
//!                            Failed / Closed       ▼  │
//!                                                 Stopped
//! ```
//!
//! On entering Active one ingestion loop starts per track that has arrived; a
//! track arriving later while Active starts its loop on arrival. Leaving
//! Active clears the alive flag, and every loop exits on its next iteration.
//! End-of-stream on either track clears the alive flag for the whole Pub.
//!
//! Disconnected is soft: ICE may recover and a later Connected resumes
//! ingestion. Failed, Closed and end-of-stream are terminal and mark the Pub
//! [dead](Pub::is_dead), which is what the registry reaper looks for.
//!
//! # Shutdown
//!
//! [`Pub::close`] fires the halt token, closes the session and closes both
//! queues. Every blocking point in an ingestion loop (track read and enqueue)
//! selects against the halt token, so a full queue never holds up shutdown
//! and nothing is enqueued once close has begun.

use super::transport::{
    ConnectionState, MediaKind, TrackReadError, TrackReceiver, TransportEvent, TransportFactory,
    TransportSession,
};
use crate::errors::SfuError;
use crate::observability::metrics;
use common::protocol::SessionDescription;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use webrtc::rtcp::packet::Packet as RtcpPacket;
use webrtc::rtp::packet::Packet as RtpPacket;

/// Publisher lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PubState {
    Created = 0,
    Negotiating = 1,
    Active = 2,
    Stopped = 3,
}

impl PubState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PubState::Created,
            1 => PubState::Negotiating,
            2 => PubState::Active,
            _ => PubState::Stopped,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PubState::Created => "created",
            PubState::Negotiating => "negotiating",
            PubState::Active => "active",
            PubState::Stopped => "stopped",
        }
    }
}

/// Per-kind producer side: the queue sender and whether a loop is running.
struct KindSlot {
    tx: mpsc::Sender<RtpPacket>,
    running: AtomicBool,
}

/// State shared between the [`Pub`] handle, its control task and its
/// ingestion loops.
struct Shared {
    id: String,
    state: AtomicU8,
    alive: AtomicBool,
    // Set once on Failed, Closed or end-of-stream; never cleared
    ended: AtomicBool,
    halt: CancellationToken,
    audio: KindSlot,
    video: KindSlot,
    tracks: Mutex<HashMap<MediaKind, Arc<dyn TrackReceiver>>>,
}

impl Shared {
    fn slot(&self, kind: MediaKind) -> &KindSlot {
        match kind {
            MediaKind::Audio => &self.audio,
            MediaKind::Video => &self.video,
        }
    }

    fn state(&self) -> PubState {
        PubState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: PubState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn end(&self) {
        self.ended.store(true, Ordering::Release);
        self.alive.store(false, Ordering::Release);
    }

    fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    fn should_stop(&self) -> bool {
        self.halt.is_cancelled() || !self.is_alive()
    }
}

/// One client's publishing session.
pub struct Pub {
    shared: Arc<Shared>,
    session: Arc<dyn TransportSession>,
    audio_rx: Mutex<mpsc::Receiver<RtpPacket>>,
    video_rx: Mutex<mpsc::Receiver<RtpPacket>>,
    closed: AtomicBool,
}

impl fmt::Debug for Pub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pub")
            .field("id", &self.shared.id)
            .field("state", &self.shared.state())
            .field("alive", &self.shared.is_alive())
            .finish_non_exhaustive()
    }
}

impl Pub {
    /// Create a publisher and its transport session.
    ///
    /// # Errors
    ///
    /// Returns the factory error; nothing is left running.
    #[instrument(skip_all, name = "sfu.rtc.pub.new", fields(pub_id = %id))]
    pub async fn new(
        id: &str,
        factory: &dyn TransportFactory,
        queue_capacity: usize,
    ) -> Result<Arc<Self>, SfuError> {
        let (session, events) = factory.create(id).await.map_err(|e| {
            warn!(target: "sfu.rtc.publisher", pub_id = %id, error = %e, "Transport session creation failed");
            e
        })?;

        let (audio_tx, audio_rx) = mpsc::channel(queue_capacity);
        let (video_tx, video_rx) = mpsc::channel(queue_capacity);

        let shared = Arc::new(Shared {
            id: id.to_string(),
            state: AtomicU8::new(PubState::Created as u8),
            alive: AtomicBool::new(true),
            ended: AtomicBool::new(false),
            halt: CancellationToken::new(),
            audio: KindSlot {
                tx: audio_tx,
                running: AtomicBool::new(false),
            },
            video: KindSlot {
                tx: video_tx,
                running: AtomicBool::new(false),
            },
            tracks: Mutex::new(HashMap::new()),
        });

        tokio::spawn(run_control(Arc::clone(&shared), events));
        metrics::pub_opened();
        debug!(target: "sfu.rtc.publisher", pub_id = %id, "Publisher created");

        Ok(Arc::new(Self {
            shared,
            session,
            audio_rx: Mutex::new(audio_rx),
            video_rx: Mutex::new(video_rx),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn state(&self) -> PubState {
        self.shared.state()
    }

    /// Whether the connection is up and no track has ended.
    pub fn is_alive(&self) -> bool {
        self.shared.is_alive()
    }

    /// Whether the Pub can no longer recover: the connection failed or
    /// closed, a track ended, or the Pub itself was closed. A soft
    /// disconnect is not dead.
    pub fn is_dead(&self) -> bool {
        self.shared.is_ended() || self.shared.halt.is_cancelled()
    }

    /// Whether an ingestion loop is currently running for `kind`.
    pub fn is_ingesting(&self, kind: MediaKind) -> bool {
        self.shared.slot(kind).running.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Exchange session descriptions with the client.
    ///
    /// # Errors
    ///
    /// `SessionAbsent` after close; otherwise the transport's negotiation
    /// error. The caller is expected to close the Pub on failure.
    pub async fn answer(&self, offer: SessionDescription) -> Result<SessionDescription, SfuError> {
        if self.is_closed() {
            return Err(SfuError::SessionAbsent);
        }
        if self.shared.state() == PubState::Created {
            self.shared.set_state(PubState::Negotiating);
        }
        self.session.answer(offer).await
    }

    /// Next audio packet. Blocks until one arrives or the Pub is closed.
    ///
    /// # Errors
    ///
    /// `ChannelClosed` once the Pub is closed.
    pub async fn read_audio_rtp(&self) -> Result<RtpPacket, SfuError> {
        self.read(MediaKind::Audio).await
    }

    /// Next video packet. Blocks until one arrives or the Pub is closed.
    ///
    /// # Errors
    ///
    /// `ChannelClosed` once the Pub is closed.
    pub async fn read_video_rtp(&self) -> Result<RtpPacket, SfuError> {
        self.read(MediaKind::Video).await
    }

    async fn read(&self, kind: MediaKind) -> Result<RtpPacket, SfuError> {
        if self.shared.halt.is_cancelled() {
            return Err(SfuError::ChannelClosed);
        }
        let rx = match kind {
            MediaKind::Audio => &self.audio_rx,
            MediaKind::Video => &self.video_rx,
        };
        let mut rx = tokio::select! {
            biased;
            () = self.shared.halt.cancelled() => return Err(SfuError::ChannelClosed),
            guard = rx.lock() => guard,
        };
        tokio::select! {
            biased;
            () = self.shared.halt.cancelled() => Err(SfuError::ChannelClosed),
            packet = rx.recv() => packet.ok_or(SfuError::ChannelClosed),
        }
    }

    /// Send one feedback packet (PLI, REMB, ...) to the publisher.
    ///
    /// # Errors
    ///
    /// `SessionAbsent` after close; otherwise the transport error.
    pub async fn write_video_rtcp(
        &self,
        packet: Box<dyn RtcpPacket + Send + Sync>,
    ) -> Result<(), SfuError> {
        if self.is_closed() {
            return Err(SfuError::SessionAbsent);
        }
        self.session.write_rtcp(packet).await
    }

    /// Stop ingestion, close the session and close both queues.
    ///
    /// Idempotent: only the first call does anything.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shared.halt.cancel();
        self.shared.alive.store(false, Ordering::Release);
        self.shared.set_state(PubState::Stopped);
        self.session.close().await;

        // Drain and close; no producer can enqueue once halt has fired
        for rx in [&self.audio_rx, &self.video_rx] {
            let mut rx = rx.lock().await;
            rx.close();
            while rx.try_recv().is_ok() {}
        }

        metrics::pub_closed();
        info!(target: "sfu.rtc.publisher", pub_id = %self.shared.id, "Publisher closed");
    }
}

/// Consume transport events until halt or until the transport goes away.
async fn run_control(shared: Arc<Shared>, mut events: mpsc::Receiver<TransportEvent>) {
    loop {
        let event = tokio::select! {
            biased;
            () = shared.halt.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else { break };

        match event {
            TransportEvent::StateChanged(state) => on_state_change(&shared, state).await,
            TransportEvent::Track(kind, track) => {
                debug!(target: "sfu.rtc.publisher", pub_id = %shared.id, kind = %kind, "Track attached");
                shared.tracks.lock().await.insert(kind, track);
                if shared.state() == PubState::Active && shared.is_alive() {
                    start_ingestion(&shared, kind).await;
                }
            }
        }
    }
    debug!(target: "sfu.rtc.publisher", pub_id = %shared.id, "Control task stopped");
}

async fn on_state_change(shared: &Arc<Shared>, state: ConnectionState) {
    if shared.halt.is_cancelled() {
        return;
    }
    match state {
        ConnectionState::Connected => {
            if shared.is_ended() {
                debug!(target: "sfu.rtc.publisher", pub_id = %shared.id, "Ignoring reconnect of an ended publisher");
                return;
            }
            shared.alive.store(true, Ordering::Release);
            shared.set_state(PubState::Active);
            info!(target: "sfu.rtc.publisher", pub_id = %shared.id, "Publisher active");
            for kind in [MediaKind::Audio, MediaKind::Video] {
                start_ingestion(shared, kind).await;
            }
        }
        ConnectionState::Disconnected => {
            shared.alive.store(false, Ordering::Release);
            shared.set_state(PubState::Stopped);
            info!(target: "sfu.rtc.publisher", pub_id = %shared.id, "Publisher disconnected, awaiting reconnect");
        }
        ConnectionState::Failed | ConnectionState::Closed => {
            shared.end();
            shared.set_state(PubState::Stopped);
            info!(
                target: "sfu.rtc.publisher",
                pub_id = %shared.id,
                state = ?state,
                "Publisher stopped"
            );
        }
        ConnectionState::New | ConnectionState::Connecting => {}
    }
}

/// Start the ingestion loop for `kind` if its track has arrived and no loop
/// is running.
async fn start_ingestion(shared: &Arc<Shared>, kind: MediaKind) {
    let Some(track) = shared.tracks.lock().await.get(&kind).cloned() else {
        return;
    };
    if shared.slot(kind).running.swap(true, Ordering::AcqRel) {
        return;
    }
    tokio::spawn(run_ingestion(Arc::clone(shared), kind, track));
}

async fn run_ingestion(shared: Arc<Shared>, kind: MediaKind, track: Arc<dyn TrackReceiver>) {
    let slot = shared.slot(kind);
    debug!(target: "sfu.rtc.publisher", pub_id = %shared.id, kind = %kind, "Ingestion loop started");

    loop {
        if shared.should_stop() {
            break;
        }

        let read = tokio::select! {
            biased;
            () = shared.halt.cancelled() => break,
            read = track.read_rtp() => read,
        };

        match read {
            Ok(packet) => {
                // The Pub may have stopped while the read was pending
                if shared.should_stop() {
                    break;
                }
                let permit = tokio::select! {
                    biased;
                    () = shared.halt.cancelled() => break,
                    permit = slot.tx.reserve() => permit,
                };
                let Ok(permit) = permit else { break };
                // A full queue may have held us past a stop
                if shared.should_stop() {
                    break;
                }
                permit.send(packet);
                metrics::record_rtp_packet(kind);
            }
            Err(TrackReadError::EndOfStream) => {
                shared.end();
                info!(target: "sfu.rtc.publisher", pub_id = %shared.id, kind = %kind, "Track ended");
                break;
            }
            Err(TrackReadError::Transport(reason)) => {
                debug!(
                    target: "sfu.rtc.publisher",
                    pub_id = %shared.id,
                    kind = %kind,
                    reason = %reason,
                    "Transient track read failure"
                );
            }
        }
    }

    slot.running.store(false, Ordering::Release);
    debug!(target: "sfu.rtc.publisher", pub_id = %shared.id, kind = %kind, "Ingestion loop stopped");
}
