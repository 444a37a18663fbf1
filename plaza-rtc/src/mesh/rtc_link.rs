use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use webrtc::api::API;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

use plaza_core::models::{MediaKind, ParticipantId};
use plaza_core::protocol::{IceCandidate, IceServer, PeerSignal, StreamTags};

use super::link::{LinkEvent, LinkEventSender, LinkFactory, PeerLink};
use crate::error::{Result, RtcError};
use crate::media::{MediaStream, MediaTrack, TrackSource};
use crate::message::InboundMessage;
use crate::rtc::{
    build_api, drain_rtcp, from_candidate_init, lossy_channel_init, reliable_channel_init,
    rtc_configuration, to_candidate_init, OutboundQueue, LOSSY_CHANNEL, RELIABLE_CHANNEL,
};

/// How long a disconnected link may take to recover before the peer is dropped
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

/// Wait out `grace`; true if the connection is still disconnected afterwards
async fn outlasted_grace<F>(grace: Duration, shutdown: &CancellationToken, state: F) -> bool
where
    F: Fn() -> Option<RTCPeerConnectionState>,
{
    tokio::select! {
        () = shutdown.cancelled() => false,
        () = tokio::time::sleep(grace) => state() == Some(RTCPeerConnectionState::Disconnected),
    }
}

/// Builds webrtc-rs peer connections for the mesh
pub struct RtcLinkFactory {
    api: Arc<API>,
    ice_servers: Vec<IceServer>,
}

impl RtcLinkFactory {
    pub fn new(ice_servers: &[IceServer]) -> Result<Self> {
        Ok(Self {
            api: Arc::new(build_api()?),
            ice_servers: ice_servers.to_vec(),
        })
    }
}

#[async_trait]
impl LinkFactory for RtcLinkFactory {
    async fn open(
        &self,
        local: &ParticipantId,
        remote: ParticipantId,
        generation: u64,
        initiator: bool,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerLink>> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_configuration(&self.ice_servers))
                .await?,
        );
        let emitter = Emitter {
            events,
            remote: remote.clone(),
            generation,
        };
        let link = RtcPeerLink::new(pc, remote, initiator, emitter);
        link.install_handlers();

        if initiator {
            let lossy = link
                .pc
                .create_data_channel(LOSSY_CHANNEL, Some(lossy_channel_init()))
                .await?;
            let reliable = link
                .pc
                .create_data_channel(RELIABLE_CHANNEL, Some(reliable_channel_init()))
                .await?;
            link.channels.wire(&lossy);
            link.channels.wire(&reliable);
        }

        debug!(local = %local, remote = %link.remote, generation, initiator, "Peer link created");
        Ok(Arc::new(link))
    }
}

#[derive(Clone)]
struct Emitter {
    events: LinkEventSender,
    remote: ParticipantId,
    generation: u64,
}

impl Emitter {
    fn emit(&self, event: LinkEvent) {
        let _ = self
            .events
            .send((self.remote.clone(), self.generation, event));
    }
}

/// The two data channels of a link and their outbound queues
struct Channels {
    lossy: OutboundQueue,
    reliable: OutboundQueue,
    opened: AtomicU8,
    emitter: Emitter,
    shutdown: CancellationToken,
}

impl Channels {
    fn slot(&self, label: &str) -> Option<&OutboundQueue> {
        match label {
            LOSSY_CHANNEL => Some(&self.lossy),
            RELIABLE_CHANNEL => Some(&self.reliable),
            _ => None,
        }
    }

    fn wire(self: &Arc<Self>, dc: &Arc<RTCDataChannel>) {
        let label = dc.label().to_string();
        if self.slot(&label).is_none() {
            warn!(peer = %self.emitter.remote, label = %label, "Ignoring unknown data channel");
            return;
        }

        let channels = Arc::clone(self);
        let weak = Arc::downgrade(dc);
        let open_label = label.clone();
        dc.on_open(Box::new(move || {
            Box::pin(async move {
                channels.on_open(&open_label, &weak);
            })
        }));

        let emitter = self.emitter.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let emitter = emitter.clone();
            Box::pin(async move {
                match InboundMessage::from_json(&msg.data) {
                    Ok(message) => emitter.emit(LinkEvent::Message(message)),
                    Err(e) => debug!(peer = %emitter.remote, error = %e, "Dropping malformed data frame"),
                }
            })
        }));
    }

    fn on_open(&self, label: &str, dc: &Weak<RTCDataChannel>) {
        let (Some(slot), Some(dc)) = (self.slot(label), dc.upgrade()) else {
            return;
        };
        if !slot.start(dc, self.shutdown.clone()) {
            return;
        }
        trace!(peer = %self.emitter.remote, label = %label, "Data channel open");

        if self.opened.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
            self.emitter.emit(LinkEvent::Open);
        }
    }
}

struct Attachment {
    senders: Vec<Arc<RTCRtpSender>>,
    tag_keys: Vec<String>,
}

/// Offer/answer bookkeeping, only touched under the negotiation lock
#[derive(Default)]
struct Negotiation {
    /// First offer/answer round finished
    exchanged: bool,
    /// Local media changed while an exchange was in flight
    pending: bool,
    buffered_candidates: Vec<IceCandidate>,
}

/// webrtc-rs backed link to one remote participant
///
/// Renegotiation follows the perfect negotiation pattern: the side that did
/// not initiate is polite and rolls back its own offer on glare, the
/// initiator ignores the colliding offer.
pub struct RtcPeerLink {
    pc: Arc<RTCPeerConnection>,
    remote: ParticipantId,
    polite: bool,
    channels: Arc<Channels>,
    negotiation: tokio::sync::Mutex<Negotiation>,
    local_tags: Mutex<StreamTags>,
    remote_tags: Arc<Mutex<StreamTags>>,
    attachments: Mutex<HashMap<String, Attachment>>,
    closed: AtomicBool,
}

impl RtcPeerLink {
    fn new(
        pc: Arc<RTCPeerConnection>,
        remote: ParticipantId,
        initiator: bool,
        emitter: Emitter,
    ) -> Self {
        Self {
            pc,
            remote,
            polite: !initiator,
            channels: Arc::new(Channels {
                lossy: OutboundQueue::new(),
                reliable: OutboundQueue::new(),
                opened: AtomicU8::new(0),
                emitter,
                shutdown: CancellationToken::new(),
            }),
            negotiation: tokio::sync::Mutex::new(Negotiation::default()),
            local_tags: Mutex::new(StreamTags::new()),
            remote_tags: Arc::new(Mutex::new(StreamTags::new())),
            attachments: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn emitter(&self) -> &Emitter {
        &self.channels.emitter
    }

    fn install_handlers(&self) {
        let emitter = self.emitter().clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            let emitter = emitter.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => emitter.emit(LinkEvent::Signal(PeerSignal::Candidate(
                        from_candidate_init(init),
                    ))),
                    Err(e) => warn!(peer = %emitter.remote, error = %e, "Failed to serialize ICE candidate"),
                }
            })
        }));

        let emitter = self.emitter().clone();
        let pc = Arc::downgrade(&self.pc);
        let shutdown = self.channels.shutdown.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let emitter = emitter.clone();
                let pc = pc.clone();
                let shutdown = shutdown.clone();
                Box::pin(async move {
                    debug!(peer = %emitter.remote, state = %state, "Peer connection state changed");
                    match state {
                        RTCPeerConnectionState::Disconnected => {
                            tokio::spawn(async move {
                                let state = || pc.upgrade().map(|pc| pc.connection_state());
                                if outlasted_grace(DISCONNECT_GRACE, &shutdown, state).await {
                                    emitter.emit(LinkEvent::Closed(
                                        "connection did not recover".to_string(),
                                    ));
                                }
                            });
                        }
                        RTCPeerConnectionState::Failed => {
                            emitter.emit(LinkEvent::Closed("connection failed".to_string()));
                        }
                        RTCPeerConnectionState::Closed => {
                            emitter.emit(LinkEvent::Closed("connection closed".to_string()));
                        }
                        _ => {}
                    }
                })
            }));

        let channels = Arc::clone(&self.channels);
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let channels = Arc::clone(&channels);
                Box::pin(async move {
                    channels.wire(&dc);
                })
            }));

        let emitter = self.emitter().clone();
        let remote_tags = Arc::clone(&self.remote_tags);
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let emitter = emitter.clone();
            let stream_id = track.stream_id();
            let tag = remote_tags.lock().get(&stream_id).copied();
            Box::pin(async move {
                debug!(peer = %emitter.remote, stream_id = %stream_id, track_id = %track.id(), "Remote track received");
                emitter.emit(LinkEvent::Track {
                    stream_id,
                    tag,
                    track: MediaTrack::remote(track),
                });
            })
        }));
    }

    /// Create and send an offer; caller holds the negotiation lock
    async fn make_offer(&self, state: &mut Negotiation) -> Result<()> {
        state.pending = false;
        let offer = self.pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await?;

        let streams = self.local_tags.lock().clone();
        self.emitter()
            .emit(LinkEvent::Signal(PeerSignal::Offer { sdp, streams }));
        Ok(())
    }

    async fn flush_candidates(&self, state: &mut Negotiation) {
        for candidate in state.buffered_candidates.drain(..) {
            if let Err(e) = self.pc.add_ice_candidate(to_candidate_init(candidate)).await {
                debug!(peer = %self.remote, error = %e, "Buffered ICE candidate rejected");
            }
        }
    }

    async fn finish_exchange(&self, state: &mut Negotiation) -> Result<()> {
        state.exchanged = true;
        if state.pending {
            self.make_offer(state).await?;
        }
        Ok(())
    }

    async fn on_offer(&self, sdp: String, streams: StreamTags) -> Result<()> {
        let mut state = self.negotiation.lock().await;

        if self.pc.signaling_state() != RTCSignalingState::Stable {
            if !self.polite {
                debug!(peer = %self.remote, "Ignoring colliding offer");
                return Ok(());
            }
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            self.pc.set_local_description(rollback).await?;
            state.pending = true;
        }

        *self.remote_tags.lock() = streams;
        self.pc
            .set_remote_description(RTCSessionDescription::offer(sdp)?)
            .await?;
        self.flush_candidates(&mut state).await;

        let answer = self.pc.create_answer(None).await?;
        let sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await?;

        let streams = self.local_tags.lock().clone();
        self.emitter()
            .emit(LinkEvent::Signal(PeerSignal::Answer { sdp, streams }));

        self.finish_exchange(&mut state).await
    }

    async fn on_answer(&self, sdp: String, streams: StreamTags) -> Result<()> {
        let mut state = self.negotiation.lock().await;
        if self.pc.signaling_state() != RTCSignalingState::HaveLocalOffer {
            debug!(peer = %self.remote, "Ignoring unexpected answer");
            return Ok(());
        }

        *self.remote_tags.lock() = streams;
        self.pc
            .set_remote_description(RTCSessionDescription::answer(sdp)?)
            .await?;
        self.flush_candidates(&mut state).await;
        self.finish_exchange(&mut state).await
    }

    async fn on_candidate(&self, candidate: IceCandidate) {
        let mut state = self.negotiation.lock().await;
        if self.pc.remote_description().await.is_none() {
            state.buffered_candidates.push(candidate);
            return;
        }
        if let Err(e) = self.pc.add_ice_candidate(to_candidate_init(candidate)).await {
            debug!(peer = %self.remote, error = %e, "ICE candidate rejected");
        }
    }

    /// Offer now if the link is idle, otherwise once the current round ends
    async fn renegotiate(&self) -> Result<()> {
        let mut state = self.negotiation.lock().await;
        if !state.exchanged || self.pc.signaling_state() != RTCSignalingState::Stable {
            state.pending = true;
            return Ok(());
        }
        self.make_offer(&mut state).await
    }
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    fn remote(&self) -> &ParticipantId {
        &self.remote
    }

    async fn start(&self) -> Result<()> {
        let mut state = self.negotiation.lock().await;
        self.make_offer(&mut state).await
    }

    async fn handle_signal(&self, signal: PeerSignal) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RtcError::Closed);
        }
        match signal {
            PeerSignal::Offer { sdp, streams } => self.on_offer(sdp, streams).await,
            PeerSignal::Answer { sdp, streams } => self.on_answer(sdp, streams).await,
            PeerSignal::Candidate(candidate) => {
                self.on_candidate(candidate).await;
                Ok(())
            }
        }
    }

    fn send(&self, message: &InboundMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RtcError::Closed);
        }
        let reliable = message.topic().is_reliable();
        let slot = if reliable {
            &self.channels.reliable
        } else {
            &self.channels.lossy
        };

        if !slot.push(message.to_json()?)? {
            if reliable {
                warn!(peer = %self.remote, topic = %message.topic().as_str(), "Outbound queue full, dropping message");
            } else {
                trace!(peer = %self.remote, "Outbound queue full, dropping update");
            }
        }
        Ok(())
    }

    async fn attach(&self, stream: &MediaStream, kind: MediaKind) -> Result<()> {
        if self.attachments.lock().contains_key(stream.id()) {
            return Ok(());
        }

        let mut attachment = Attachment {
            senders: Vec::new(),
            tag_keys: Vec::new(),
        };
        for track in stream.tracks() {
            let TrackSource::Local(local) = track.source() else {
                continue;
            };
            let sender = self
                .pc
                .add_track(Arc::clone(local) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| RtcError::Negotiation(format!("track {} rejected: {e}", track.id())))?;
            drain_rtcp(Arc::clone(&sender));

            let key = local.stream_id().to_string();
            self.local_tags.lock().insert(key.clone(), kind);
            attachment.senders.push(sender);
            attachment.tag_keys.push(key);
        }

        if attachment.senders.is_empty() {
            return Err(RtcError::Negotiation(format!(
                "stream {} has no local tracks",
                stream.id()
            )));
        }
        self.attachments
            .lock()
            .insert(stream.id().to_string(), attachment);
        self.renegotiate().await
    }

    async fn detach(&self, stream: &MediaStream) -> Result<()> {
        let Some(attachment) = self.attachments.lock().remove(stream.id()) else {
            return Ok(());
        };
        {
            let mut tags = self.local_tags.lock();
            for key in &attachment.tag_keys {
                tags.remove(key);
            }
        }
        for sender in &attachment.senders {
            if let Err(e) = self.pc.remove_track(sender).await {
                debug!(peer = %self.remote, error = %e, "Failed to remove track");
            }
        }
        self.renegotiate().await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.channels.shutdown.cancel();
        if let Err(e) = self.pc.close().await {
            debug!(peer = %self.remote, error = %e, "Error closing peer connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_without_recovery_outlasts_grace() {
        let shutdown = CancellationToken::new();
        let state = || Some(RTCPeerConnectionState::Disconnected);
        assert!(outlasted_grace(DISCONNECT_GRACE, &shutdown, state).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovered_connection_is_kept() {
        let shutdown = CancellationToken::new();
        let current = Arc::new(Mutex::new(RTCPeerConnectionState::Disconnected));
        let observed = Arc::clone(&current);
        let check = tokio::spawn(async move {
            outlasted_grace(DISCONNECT_GRACE, &shutdown, || Some(*observed.lock())).await
        });

        tokio::time::sleep(DISCONNECT_GRACE / 2).await;
        *current.lock() = RTCPeerConnectionState::Connected;
        assert!(!check.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_link_stops_waiting() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let state = || Some(RTCPeerConnectionState::Disconnected);
        assert!(!outlasted_grace(DISCONNECT_GRACE, &shutdown, state).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_connection_is_not_reported() {
        let shutdown = CancellationToken::new();
        assert!(!outlasted_grace(DISCONNECT_GRACE, &shutdown, || None).await);
    }
}
