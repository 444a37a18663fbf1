use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
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
use plaza_core::protocol::{IceCandidate, IceServer, RelayClientMessage, RelayServerMessage};

use super::link::{RelayEvent, RelayEventSender, RelayLink};
use crate::error::{Result, RtcError};
use crate::media::{MediaStream, MediaTrack, TrackSource};
use crate::rtc::{
    build_api, drain_rtcp, from_candidate_init, lossy_channel_init, reliable_channel_init,
    rtc_configuration, to_candidate_init, OutboundQueue,
};

/// Data channel labels the relay expects
pub const RELAY_LOSSY_CHANNEL: &str = "_lossy";
pub const RELAY_RELIABLE_CHANNEL: &str = "_reliable";

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Default)]
struct Negotiation {
    pending: bool,
    buffered_candidates: Vec<IceCandidate>,
}

#[derive(Default)]
struct Subscriptions {
    /// sid -> (publisher, kind) from `TrackAnnounced`
    announced: HashMap<String, (ParticipantId, MediaKind)>,
    /// Tracks that arrived before their announcement
    unannounced: HashMap<String, MediaTrack>,
}

struct Shared {
    pc: Arc<RTCPeerConnection>,
    signaling: mpsc::UnboundedSender<RelayClientMessage>,
    events: RelayEventSender,
    negotiation: tokio::sync::Mutex<Negotiation>,
    publish_acks: Mutex<HashMap<String, oneshot::Sender<String>>>,
    unpublish_acks: Mutex<HashMap<String, oneshot::Sender<()>>>,
    subscriptions: Mutex<Subscriptions>,
    lossy: OutboundQueue,
    reliable: OutboundQueue,
    opened: AtomicU8,
    ready: Mutex<Option<oneshot::Sender<()>>>,
    shutdown: CancellationToken,
    disconnected: AtomicBool,
}

impl Shared {
    fn send_signal(&self, msg: RelayClientMessage) -> Result<()> {
        self.signaling.send(msg).map_err(|_| RtcError::Closed)
    }

    /// Report the loss once; later failures are echoes of the same one
    fn disconnected(&self, reason: String) {
        if self.disconnected.swap(true, Ordering::SeqCst) || self.shutdown.is_cancelled() {
            return;
        }
        let _ = self.events.send(RelayEvent::Disconnected(reason));
    }

    async fn make_offer(&self, state: &mut Negotiation) -> Result<()> {
        state.pending = false;
        let offer = self.pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await?;
        self.send_signal(RelayClientMessage::Offer { sdp })
    }

    async fn renegotiate(&self) -> Result<()> {
        let mut state = self.negotiation.lock().await;
        if self.pc.signaling_state() != RTCSignalingState::Stable {
            state.pending = true;
            return Ok(());
        }
        self.make_offer(&mut state).await
    }

    async fn flush_candidates(&self, state: &mut Negotiation) {
        for candidate in state.buffered_candidates.drain(..) {
            if let Err(e) = self.pc.add_ice_candidate(to_candidate_init(candidate)).await {
                debug!(error = %e, "Buffered relay candidate rejected");
            }
        }
    }

    async fn on_answer(&self, sdp: String) -> Result<()> {
        let mut state = self.negotiation.lock().await;
        if self.pc.signaling_state() != RTCSignalingState::HaveLocalOffer {
            debug!("Ignoring unexpected relay answer");
            return Ok(());
        }
        self.pc
            .set_remote_description(RTCSessionDescription::answer(sdp)?)
            .await?;
        self.flush_candidates(&mut state).await;
        if state.pending {
            self.make_offer(&mut state).await?;
        }
        Ok(())
    }

    /// The relay offers when our subscriptions change; we always yield to it
    async fn on_offer(&self, sdp: String) -> Result<()> {
        let mut state = self.negotiation.lock().await;
        if self.pc.signaling_state() != RTCSignalingState::Stable {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            self.pc.set_local_description(rollback).await?;
            state.pending = true;
        }
        self.pc
            .set_remote_description(RTCSessionDescription::offer(sdp)?)
            .await?;
        self.flush_candidates(&mut state).await;

        let answer = self.pc.create_answer(None).await?;
        let sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await?;
        self.send_signal(RelayClientMessage::Answer { sdp })?;

        if state.pending {
            self.make_offer(&mut state).await?;
        }
        Ok(())
    }

    async fn on_candidate(&self, candidate: IceCandidate) {
        let mut state = self.negotiation.lock().await;
        if self.pc.remote_description().await.is_none() {
            state.buffered_candidates.push(candidate);
            return;
        }
        if let Err(e) = self.pc.add_ice_candidate(to_candidate_init(candidate)).await {
            debug!(error = %e, "Relay candidate rejected");
        }
    }

    fn on_announced(&self, participant: ParticipantId, sid: String, kind: MediaKind) {
        let track = {
            let mut subs = self.subscriptions.lock();
            subs.announced.insert(sid.clone(), (participant.clone(), kind));
            subs.unannounced.remove(&sid)
        };
        if let Some(track) = track {
            self.subscribed(participant, kind, sid, track);
        }
    }

    fn on_track(&self, track: MediaTrack) {
        let sid = track.id().to_string();
        let announced = {
            let mut subs = self.subscriptions.lock();
            let announced = subs.announced.get(&sid).cloned();
            if announced.is_none() {
                subs.unannounced.insert(sid.clone(), track.clone());
            }
            announced
        };
        match announced {
            Some((participant, kind)) => self.subscribed(participant, kind, sid, track),
            None => trace!(sid = %sid, "Track arrived before its announcement"),
        }
    }

    fn subscribed(&self, participant: ParticipantId, kind: MediaKind, sid: String, track: MediaTrack) {
        debug!(participant = %participant, sid = %sid, kind = %kind, "Subscribed to relay track");
        let _ = self.events.send(RelayEvent::TrackSubscribed {
            participant,
            kind,
            sid,
            track,
        });
    }

    fn on_track_ended(&self, participant: ParticipantId, sid: String) {
        {
            let mut subs = self.subscriptions.lock();
            subs.announced.remove(&sid);
            subs.unannounced.remove(&sid);
        }
        let _ = self
            .events
            .send(RelayEvent::TrackUnsubscribed { participant, sid });
    }

    async fn handle(&self, msg: RelayServerMessage) -> Result<()> {
        match msg {
            RelayServerMessage::Offer { sdp } => self.on_offer(sdp).await?,
            RelayServerMessage::Answer { sdp } => self.on_answer(sdp).await?,
            RelayServerMessage::Candidate { candidate } => self.on_candidate(candidate).await,
            RelayServerMessage::ParticipantJoined { identity } => {
                let _ = self.events.send(RelayEvent::ParticipantJoined(identity));
            }
            RelayServerMessage::ParticipantLeft { identity } => {
                let _ = self.events.send(RelayEvent::ParticipantLeft(identity));
            }
            RelayServerMessage::TrackPublished { cid, sid } => {
                if let Some(ack) = self.publish_acks.lock().remove(&cid) {
                    let _ = ack.send(sid);
                }
            }
            RelayServerMessage::TrackUnpublished { sid } => {
                if let Some(ack) = self.unpublish_acks.lock().remove(&sid) {
                    let _ = ack.send(());
                }
            }
            RelayServerMessage::TrackAnnounced {
                participant,
                sid,
                kind,
            } => self.on_announced(participant, sid, kind),
            RelayServerMessage::TrackEnded { participant, sid } => {
                self.on_track_ended(participant, sid);
            }
            RelayServerMessage::Joined { .. } => debug!("Duplicate relay join acknowledgement"),
            RelayServerMessage::Error { message } => {
                warn!(message = %message, "Relay reported an error");
            }
        }
        Ok(())
    }

    fn wire_channel(self: &Arc<Self>, dc: &Arc<RTCDataChannel>) {
        let shared = Arc::clone(self);
        let weak = Arc::downgrade(dc);
        let label = dc.label().to_string();
        dc.on_open(Box::new(move || {
            Box::pin(async move {
                let Some(dc) = weak.upgrade() else {
                    return;
                };
                let queue = if label == RELAY_LOSSY_CHANNEL {
                    &shared.lossy
                } else {
                    &shared.reliable
                };
                if queue.start(dc, shared.shutdown.clone())
                    && shared.opened.fetch_add(1, Ordering::SeqCst) + 1 == 2
                {
                    if let Some(ready) = shared.ready.lock().take() {
                        let _ = ready.send(());
                    }
                }
            })
        }));

        let events = self.events.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let _ = events.send(RelayEvent::Data(msg.data));
            Box::pin(async {})
        }));
    }

    fn install_handlers(self: &Arc<Self>) {
        let signaling = self.signaling.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            let signaling = signaling.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = signaling.send(RelayClientMessage::Candidate {
                            candidate: from_candidate_init(init),
                        });
                    }
                    Err(e) => warn!(error = %e, "Failed to serialize relay ICE candidate"),
                }
            })
        }));

        let shared = Arc::downgrade(self);
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let shared = shared.clone();
                Box::pin(async move {
                    debug!(state = %state, "Relay peer connection state changed");
                    if matches!(
                        state,
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                    ) {
                        if let Some(shared) = shared.upgrade() {
                            shared.disconnected(format!("peer connection {state}"));
                        }
                    }
                })
            }));

        let shared = Arc::downgrade(self);
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            if let Some(shared) = shared.upgrade() {
                shared.on_track(MediaTrack::remote(track));
            }
            Box::pin(async {})
        }));
    }
}

/// webrtc-rs connection to the media relay
pub struct RtcRelayLink {
    shared: Arc<Shared>,
    identity: ParticipantId,
    participants: Vec<ParticipantId>,
    senders: Mutex<HashMap<String, Arc<RTCRtpSender>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RtcRelayLink {
    /// Join the relay with `token` and wait until both data channels are open
    pub async fn connect(
        url: &str,
        token: &str,
        ice_servers: &[IceServer],
        events: RelayEventSender,
    ) -> Result<Self> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| RtcError::RelayFatal(format!("cannot reach relay {url}: {e}")))?;
        let (mut sink, mut stream) = ws.split();

        send_frame(
            &mut sink,
            &RelayClientMessage::Join {
                token: token.to_string(),
            },
        )
        .await?;
        let (identity, participants) = tokio::time::timeout(JOIN_TIMEOUT, await_joined(&mut stream))
            .await
            .map_err(|_| RtcError::RelayFatal("relay did not answer the join".to_string()))??;

        let api = build_api()?;
        let pc = Arc::new(api.new_peer_connection(rtc_configuration(ice_servers)).await?);
        let (signaling_tx, signaling_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let shared = Arc::new(Shared {
            pc,
            signaling: signaling_tx,
            events,
            negotiation: tokio::sync::Mutex::new(Negotiation::default()),
            publish_acks: Mutex::new(HashMap::new()),
            unpublish_acks: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Subscriptions::default()),
            lossy: OutboundQueue::new(),
            reliable: OutboundQueue::new(),
            opened: AtomicU8::new(0),
            ready: Mutex::new(Some(ready_tx)),
            shutdown: CancellationToken::new(),
            disconnected: AtomicBool::new(false),
        });
        shared.install_handlers();

        let lossy = shared
            .pc
            .create_data_channel(RELAY_LOSSY_CHANNEL, Some(lossy_channel_init()))
            .await?;
        let reliable = shared
            .pc
            .create_data_channel(RELAY_RELIABLE_CHANNEL, Some(reliable_channel_init()))
            .await?;
        shared.wire_channel(&lossy);
        shared.wire_channel(&reliable);

        let task = tokio::spawn(run_signaling(
            Arc::clone(&shared),
            sink,
            stream,
            signaling_rx,
        ));
        let link = Self {
            shared,
            identity,
            participants,
            senders: Mutex::new(HashMap::new()),
            task: Mutex::new(Some(task)),
        };

        let connected = async {
            link.shared.renegotiate().await?;
            tokio::time::timeout(JOIN_TIMEOUT, ready_rx)
                .await
                .map_err(|_| RtcError::RelayFatal("relay data channels did not open".to_string()))?
                .map_err(|_| RtcError::RelayFatal("relay connection closed during setup".to_string()))
        };
        if let Err(e) = connected.await {
            link.close().await;
            return Err(e);
        }

        info!(url = %url, identity = %link.identity, "Joined relay");
        Ok(link)
    }
}

async fn await_joined(
    stream: &mut SplitStream<WsStream>,
) -> Result<(ParticipantId, Vec<ParticipantId>)> {
    while let Some(frame) = stream.next().await {
        let Message::Text(text) = frame.map_err(|e| RtcError::RelayFatal(e.to_string()))? else {
            continue;
        };
        match serde_json::from_str::<RelayServerMessage>(text.as_str())? {
            RelayServerMessage::Joined {
                identity,
                participants,
            } => return Ok((identity, participants)),
            RelayServerMessage::Error { message } => return Err(RtcError::RelayFatal(message)),
            other => debug!(message = ?other, "Relay message before join"),
        }
    }
    Err(RtcError::RelayFatal("relay closed the connection during join".to_string()))
}

async fn send_frame(
    sink: &mut SplitSink<WsStream, Message>,
    msg: &RelayClientMessage,
) -> Result<()> {
    let text = serde_json::to_string(msg)?;
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|e| RtcError::RelayFatal(e.to_string()))
}

async fn run_signaling(
    shared: Arc<Shared>,
    mut sink: SplitSink<WsStream, Message>,
    mut stream: SplitStream<WsStream>,
    mut outbound: mpsc::UnboundedReceiver<RelayClientMessage>,
) {
    let reason = loop {
        tokio::select! {
            () = shared.shutdown.cancelled() => {
                let _ = send_frame(&mut sink, &RelayClientMessage::Leave).await;
                let _ = sink.close().await;
                return;
            }
            msg = outbound.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = send_frame(&mut sink, &msg).await {
                        break e.to_string();
                    }
                }
                None => return,
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<RelayServerMessage>(text.as_str()) {
                        Ok(msg) => {
                            if let Err(e) = shared.handle(msg).await {
                                warn!(error = %e, "Relay negotiation failed");
                                break e.to_string();
                            }
                        }
                        Err(e) => warn!(error = %e, "Ignoring malformed relay frame"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break "relay closed the connection".to_string(),
                Some(Ok(_)) => {}
                Some(Err(e)) => break e.to_string(),
            },
        }
    };
    shared.disconnected(reason);
}

#[async_trait]
impl RelayLink for RtcRelayLink {
    fn identity(&self) -> ParticipantId {
        self.identity.clone()
    }

    fn participants(&self) -> Vec<ParticipantId> {
        self.participants.clone()
    }

    fn publish_data(&self, data: Bytes, reliable: bool) -> Result<()> {
        if self.shared.shutdown.is_cancelled() {
            return Err(RtcError::Closed);
        }
        let queue = if reliable {
            &self.shared.reliable
        } else {
            &self.shared.lossy
        };
        if !queue.push(data)? {
            if reliable {
                warn!("Relay reliable queue full, dropping packet");
            } else {
                trace!("Relay lossy queue full, dropping packet");
            }
        }
        Ok(())
    }

    async fn publish_track(&self, stream: &MediaStream, kind: MediaKind) -> Result<Vec<String>> {
        let mut pending = Vec::new();
        for track in stream.tracks() {
            let TrackSource::Local(local) = track.source() else {
                continue;
            };
            let cid = track.id().to_string();
            let (ack_tx, ack_rx) = oneshot::channel();
            self.shared.publish_acks.lock().insert(cid.clone(), ack_tx);
            self.shared.send_signal(RelayClientMessage::Publish {
                cid: cid.clone(),
                kind,
            })?;

            let sender = self
                .shared
                .pc
                .add_track(Arc::clone(local) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| RtcError::Negotiation(format!("track {cid} rejected: {e}")))?;
            drain_rtcp(Arc::clone(&sender));
            pending.push((cid, sender, ack_rx));
        }
        if pending.is_empty() {
            return Err(RtcError::Negotiation(format!(
                "stream {} has no local tracks",
                stream.id()
            )));
        }

        self.shared.renegotiate().await?;

        let mut sids = Vec::with_capacity(pending.len());
        for (cid, sender, ack_rx) in pending {
            let sid = tokio::time::timeout(ACK_TIMEOUT, ack_rx)
                .await
                .map_err(|_| {
                    self.shared.publish_acks.lock().remove(&cid);
                    RtcError::Negotiation(format!("relay did not acknowledge track {cid}"))
                })?
                .map_err(|_| RtcError::Closed)?;
            self.senders.lock().insert(sid.clone(), sender);
            sids.push(sid);
        }
        debug!(stream = %stream.id(), sids = ?sids, "Tracks published to relay");
        Ok(sids)
    }

    async fn unpublish_track(&self, sids: &[String]) -> Result<()> {
        let mut pending = Vec::new();
        for sid in sids {
            let sender = self.senders.lock().remove(sid);
            let Some(sender) = sender else {
                continue;
            };
            let (ack_tx, ack_rx) = oneshot::channel();
            self.shared.unpublish_acks.lock().insert(sid.clone(), ack_tx);
            self.shared
                .send_signal(RelayClientMessage::Unpublish { sid: sid.clone() })?;
            if let Err(e) = self.shared.pc.remove_track(&sender).await {
                debug!(sid = %sid, error = %e, "Failed to remove relay track");
            }
            pending.push((sid.clone(), ack_rx));
        }
        if pending.is_empty() {
            return Ok(());
        }

        self.shared.renegotiate().await?;

        for (sid, ack_rx) in pending {
            tokio::time::timeout(ACK_TIMEOUT, ack_rx)
                .await
                .map_err(|_| {
                    self.shared.unpublish_acks.lock().remove(&sid);
                    RtcError::Negotiation(format!("relay did not confirm unpublishing {sid}"))
                })?
                .map_err(|_| RtcError::Closed)?;
        }
        Ok(())
    }

    async fn close(&self) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        self.shared.shutdown.cancel();

        let task = self.task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
                debug!("Relay signaling task did not finish in time");
            }
        }
        if let Err(e) = self.shared.pc.close().await {
            debug!(error = %e, "Error closing relay peer connection");
        }
        self.shared.publish_acks.lock().clear();
        self.shared.unpublish_acks.lock().clear();
    }
}

impl Drop for RtcRelayLink {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}
