//! Relay strategy: a single connection to a selective-forwarding relay

mod codec;
mod link;
mod rtc_link;

pub use codec::{
    decode_packet, encode_packet, stamp_participant, ChatBody, DataPacket, ReactionBody,
    StreamEndedBody, UpdateBody,
};
pub use link::{RelayEvent, RelayEventReceiver, RelayEventSender, RelayLink};
pub use rtc_link::{RtcRelayLink, RELAY_LOSSY_CHANNEL, RELAY_RELIABLE_CHANNEL};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use plaza_core::models::{MediaKind, ParticipantId, RoomId};
use plaza_core::protocol::IceServer;

use crate::error::{Result, RtcError};
use crate::media::MediaStream;
use crate::message::InboundMessage;
use crate::transport::{EventSender, Transport, TransportEvent, TransportMode};

struct Published {
    stream: MediaStream,
    kind: MediaKind,
    sids: Vec<String>,
}

/// Remote tracks grouped into one stream per (publisher, kind)
#[derive(Default)]
struct Subscribed {
    streams: HashMap<(ParticipantId, MediaKind), (MediaStream, Vec<String>)>,
}

impl Subscribed {
    fn remove_participant(&mut self, participant: &ParticipantId) {
        self.streams.retain(|(p, _), _| p != participant);
    }

    /// Fresh handles for a participant's streams; the session released the old ones
    fn rebind(&mut self, participant: &ParticipantId) -> Vec<(MediaKind, MediaStream)> {
        self.streams
            .iter_mut()
            .filter(|((p, _), _)| p == participant)
            .map(|((_, kind), (stream, _))| {
                *stream = MediaStream::with_tracks(stream.id(), stream.tracks());
                (*kind, stream.clone())
            })
            .collect()
    }
}

/// Whether the session currently knows about a relay participant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Presence {
    Active,
    /// Still on the relay but evicted for silence
    Evicted,
}

struct RelayInner {
    room_id: RoomId,
    link: Arc<dyn RelayLink>,
    local_id: ParticipantId,
    events: EventSender,
    members: Mutex<HashMap<ParticipantId, Presence>>,
    subscribed: Mutex<Subscribed>,
}

/// Connected relay transport
pub struct RelayTransport {
    inner: Arc<RelayInner>,
    published: tokio::sync::Mutex<Vec<Published>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RelayTransport {
    /// Join the relay at `url` with a pre-issued access token
    pub async fn connect(
        room_id: &RoomId,
        url: &str,
        token: &str,
        ice_servers: &[IceServer],
        events: EventSender,
    ) -> Result<Self> {
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let link = RtcRelayLink::connect(url, token, ice_servers, relay_tx).await?;
        Ok(Self::with_link(room_id, Arc::new(link), relay_rx, events))
    }

    /// Wrap an already joined relay link
    #[must_use]
    pub fn with_link(
        room_id: &RoomId,
        link: Arc<dyn RelayLink>,
        relay_events: RelayEventReceiver,
        events: EventSender,
    ) -> Self {
        let inner = Arc::new(RelayInner {
            room_id: room_id.clone(),
            local_id: link.identity(),
            link,
            events,
            members: Mutex::new(HashMap::new()),
            subscribed: Mutex::new(Subscribed::default()),
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(Arc::clone(&inner), relay_events, cancel.clone()));

        Self {
            inner,
            published: tokio::sync::Mutex::new(Vec::new()),
            cancel,
            task: Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(RtcError::Closed)
        } else {
            Ok(())
        }
    }
}

async fn run(inner: Arc<RelayInner>, mut relay_events: RelayEventReceiver, cancel: CancellationToken) {
    for participant in inner.link.participants() {
        inner.on_event(RelayEvent::ParticipantJoined(participant));
    }

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = relay_events.recv() => match event {
                Some(RelayEvent::Disconnected(reason)) => {
                    error!(room_id = %inner.room_id, reason = %reason, "Relay connection lost");
                    let _ = inner.events.send(TransportEvent::Fatal(RtcError::RelayFatal(reason)));
                    break;
                }
                Some(event) => inner.on_event(event),
                None => break,
            },
        }
    }
    debug!(room_id = %inner.room_id, "Relay event loop stopped");
}

impl RelayInner {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn on_event(&self, event: RelayEvent) {
        match event {
            RelayEvent::ParticipantJoined(participant) => {
                if participant != self.local_id {
                    self.participant_joined(participant);
                }
            }
            RelayEvent::ParticipantLeft(participant) => self.participant_left(&participant),
            RelayEvent::Data(data) => self.on_data(&data),
            RelayEvent::TrackSubscribed {
                participant,
                kind,
                sid,
                track,
            } => {
                if !self.admit(&participant) {
                    trace!(peer = %participant, sid = %sid, "Ignoring track from absent participant");
                    return;
                }
                let stream = {
                    let mut subscribed = self.subscribed.lock();
                    let (stream, sids) = subscribed
                        .streams
                        .entry((participant.clone(), kind))
                        .or_insert_with(|| {
                            (
                                MediaStream::new(format!("{participant}:{kind}")),
                                Vec::new(),
                            )
                        });
                    stream.add_track(track);
                    if !sids.contains(&sid) {
                        sids.push(sid);
                    }
                    stream.clone()
                };
                self.emit(TransportEvent::StreamAdded {
                    from: participant,
                    kind,
                    stream,
                });
            }
            RelayEvent::TrackUnsubscribed { participant, sid } => {
                let ended = {
                    let mut subscribed = self.subscribed.lock();
                    let key = subscribed
                        .streams
                        .iter()
                        .find(|((p, _), (_, sids))| *p == participant && sids.contains(&sid))
                        .map(|(key, _)| key.clone());
                    key.and_then(|key| {
                        let (_, sids) = subscribed.streams.get_mut(&key)?;
                        sids.retain(|s| *s != sid);
                        if sids.is_empty() {
                            subscribed.streams.remove(&key);
                            Some(key.1)
                        } else {
                            None
                        }
                    })
                };
                if let Some(kind) = ended {
                    self.emit(TransportEvent::StreamRemoved {
                        from: participant,
                        kind,
                    });
                }
            }
            RelayEvent::Disconnected(_) => {}
        }
    }

    fn on_data(&self, data: &[u8]) {
        match decode_packet(data) {
            Ok(Some((from, _))) if from == self.local_id => trace!("Ignoring own relay packet"),
            Ok(Some((from, message))) => {
                if self.admit(&from) {
                    self.emit(TransportEvent::Message { from, message });
                } else {
                    trace!(peer = %from, "Ignoring packet from absent participant");
                }
            }
            Ok(None) => trace!("Ignoring relay packet on unknown topic"),
            Err(e) => debug!(error = %e, "Dropping malformed relay packet"),
        }
    }

    fn participant_joined(&self, participant: ParticipantId) {
        let previous = self
            .members
            .lock()
            .insert(participant.clone(), Presence::Active);
        match previous {
            None => {
                info!(room_id = %self.room_id, peer = %participant, "Participant joined relay");
                self.emit(TransportEvent::PeerJoined(participant));
            }
            Some(Presence::Evicted) => self.revive(&participant),
            Some(Presence::Active) => debug!(peer = %participant, "Duplicate relay join"),
        }
    }

    fn participant_left(&self, participant: &ParticipantId) {
        let previous = self.members.lock().remove(participant);
        self.subscribed.lock().remove_participant(participant);
        match previous {
            Some(Presence::Active) => {
                info!(room_id = %self.room_id, peer = %participant, "Participant left relay");
                self.emit(TransportEvent::PeerLeft(participant.clone()));
            }
            Some(Presence::Evicted) => {
                debug!(peer = %participant, "Evicted participant left relay");
            }
            None => trace!(peer = %participant, "Leave for unknown participant"),
        }
    }

    /// Whether traffic from `participant` may reach the session
    ///
    /// Members evicted for silence are reported again on their next packet.
    fn admit(&self, participant: &ParticipantId) -> bool {
        let previous = {
            let mut members = self.members.lock();
            match members.get_mut(participant) {
                Some(presence) => std::mem::replace(presence, Presence::Active),
                None => return false,
            }
        };
        if previous == Presence::Evicted {
            self.revive(participant);
        }
        true
    }

    fn revive(&self, participant: &ParticipantId) {
        info!(room_id = %self.room_id, peer = %participant, "Evicted participant is active again");
        self.emit(TransportEvent::PeerJoined(participant.clone()));
        let streams = self.subscribed.lock().rebind(participant);
        for (kind, stream) in streams {
            self.emit(TransportEvent::StreamAdded {
                from: participant.clone(),
                kind,
                stream,
            });
        }
    }

    /// Hide a silent member from the session without forgetting its tracks
    fn evict(&self, participant: &ParticipantId) {
        let evicted = self
            .members
            .lock()
            .get_mut(participant)
            .map(|presence| std::mem::replace(presence, Presence::Evicted))
            == Some(Presence::Active);
        if evicted {
            info!(room_id = %self.room_id, peer = %participant, "Evicted silent relay participant");
            self.emit(TransportEvent::PeerLeft(participant.clone()));
        }
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Relay
    }

    fn local_id(&self) -> ParticipantId {
        self.inner.local_id.clone()
    }

    fn send(&self, message: &InboundMessage) -> Result<()> {
        self.ensure_open()?;
        let packet = Bytes::from(encode_packet(message));
        self.inner
            .link
            .publish_data(packet, message.topic().is_reliable())
    }

    async fn add_stream(&self, stream: &MediaStream, kind: MediaKind) -> Result<()> {
        self.ensure_open()?;
        let mut published = self.published.lock().await;
        if published.iter().any(|p| p.stream.same_as(stream)) {
            return Ok(());
        }

        let sids = self.inner.link.publish_track(stream, kind).await?;
        info!(room_id = %self.inner.room_id, stream = %stream.id(), kind = %kind, "Published stream to relay");
        published.push(Published {
            stream: stream.clone(),
            kind,
            sids,
        });
        Ok(())
    }

    async fn remove_stream(&self, stream: &MediaStream) -> Result<()> {
        let mut published = self.published.lock().await;
        let Some(index) = published.iter().position(|p| p.stream.same_as(stream)) else {
            return Ok(());
        };
        let entry = published.remove(index);
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.link.unpublish_track(&entry.sids).await?;
        self.send(&InboundMessage::StreamEnded { kind: entry.kind })?;
        info!(room_id = %self.inner.room_id, stream = %stream.id(), kind = %entry.kind, "Unpublished stream from relay");
        Ok(())
    }

    async fn evict(&self, peer: &ParticipantId) {
        self.inner.evict(peer);
    }

    async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.inner.link.close().await;
        self.published.lock().await.clear();
        info!(room_id = %self.inner.room_id, "Left relay room");
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::tests::audio_track;
    use crate::media::MediaTrack;
    use crate::state::PeerUpdate;
    use crate::testing::MemoryRelay;
    use crate::transport::{event_channel, EventReceiver};
    use std::time::Duration;

    fn join(relay: &MemoryRelay, identity: &str) -> (RelayTransport, EventReceiver) {
        let (link, relay_events) = relay.join(identity);
        let (tx, rx) = event_channel();
        let transport = RelayTransport::with_link(&RoomId::from("hall"), link, relay_events, tx);
        (transport, rx)
    }

    async fn next_event(rx: &mut EventReceiver) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_present_and_arriving_participants_reported() {
        let relay = MemoryRelay::new();
        let (_bob, mut bob_rx) = join(&relay, "bob");
        let (ada, mut ada_rx) = join(&relay, "ada");

        assert_eq!(ada.mode(), TransportMode::Relay);
        assert_eq!(ada.local_id(), ParticipantId::from("ada"));
        assert!(matches!(
            next_event(&mut ada_rx).await,
            TransportEvent::PeerJoined(p) if p == ParticipantId::from("bob")
        ));
        assert!(matches!(
            next_event(&mut bob_rx).await,
            TransportEvent::PeerJoined(p) if p == ParticipantId::from("ada")
        ));
    }

    #[tokio::test]
    async fn test_update_forwarded_with_sender_identity() {
        let relay = MemoryRelay::new();
        let (ada, _ada_rx) = join(&relay, "ada");
        let (_bob, mut bob_rx) = join(&relay, "bob");
        assert!(matches!(next_event(&mut bob_rx).await, TransportEvent::PeerJoined(_)));

        let update = PeerUpdate {
            position: Some([1.0, 2.0, 3.0]),
            ..Default::default()
        };
        ada.send_update(&update).unwrap();

        match next_event(&mut bob_rx).await {
            TransportEvent::Message {
                from,
                message: InboundMessage::Update(received),
            } => {
                assert_eq!(from, ParticipantId::from("ada"));
                assert_eq!(received.position, Some([1.0, 2.0, 3.0]));
                assert_eq!(received.color, None);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_published_stream_lifecycle() {
        let relay = MemoryRelay::new();
        let (ada, _ada_rx) = join(&relay, "ada");
        let (_bob, mut bob_rx) = join(&relay, "bob");
        assert!(matches!(next_event(&mut bob_rx).await, TransportEvent::PeerJoined(_)));

        let voice = MediaStream::local("voice", vec![audio_track("a1")]);
        ada.add_stream(&voice, MediaKind::Audio).await.unwrap();
        ada.add_stream(&voice, MediaKind::Audio).await.unwrap();
        assert!(matches!(
            next_event(&mut bob_rx).await,
            TransportEvent::StreamAdded { kind: MediaKind::Audio, .. }
        ));

        ada.remove_stream(&voice).await.unwrap();
        assert!(matches!(
            next_event(&mut bob_rx).await,
            TransportEvent::StreamRemoved { kind: MediaKind::Audio, .. }
        ));
        assert!(matches!(
            next_event(&mut bob_rx).await,
            TransportEvent::Message {
                message: InboundMessage::StreamEnded { kind: MediaKind::Audio },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_leaving_participant_reported() {
        let relay = MemoryRelay::new();
        let (ada, _ada_rx) = join(&relay, "ada");
        let (_bob, mut bob_rx) = join(&relay, "bob");
        assert!(matches!(next_event(&mut bob_rx).await, TransportEvent::PeerJoined(_)));

        ada.disconnect().await;
        ada.disconnect().await;
        assert!(matches!(
            next_event(&mut bob_rx).await,
            TransportEvent::PeerLeft(p) if p == ParticipantId::from("ada")
        ));
        assert!(matches!(ada.send_chat("hi"), Err(RtcError::Closed)));
    }

    fn update_from(participant: &str, position: [f32; 3]) -> Bytes {
        let packet = encode_packet(&InboundMessage::Update(PeerUpdate {
            position: Some(position),
            ..Default::default()
        }));
        Bytes::from(stamp_participant(&packet, &ParticipantId::from(participant)).unwrap())
    }

    #[tokio::test]
    async fn test_traffic_after_leave_is_dropped() {
        let relay = MemoryRelay::new();
        let (link, _relay_rx) = relay.join("ada");
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let (tx, mut rx) = event_channel();
        let _ada = RelayTransport::with_link(&RoomId::from("hall"), link, relay_rx, tx);
        let ghost = ParticipantId::from("ghost");

        relay_tx.send(RelayEvent::ParticipantJoined(ghost.clone())).unwrap();
        relay_tx.send(RelayEvent::ParticipantLeft(ghost.clone())).unwrap();
        relay_tx.send(RelayEvent::Data(update_from("ghost", [9.0, 9.0, 9.0]))).unwrap();
        relay_tx
            .send(RelayEvent::TrackSubscribed {
                participant: ghost.clone(),
                kind: MediaKind::Audio,
                sid: "TR_late".to_string(),
                track: MediaTrack::local(audio_track("late")),
            })
            .unwrap();
        relay_tx.send(RelayEvent::ParticipantLeft(ghost.clone())).unwrap();
        relay_tx.send(RelayEvent::Data(update_from("stranger", [1.0, 1.0, 1.0]))).unwrap();
        relay_tx.send(RelayEvent::ParticipantJoined(ParticipantId::from("bob"))).unwrap();
        relay_tx.send(RelayEvent::Data(update_from("bob", [2.0, 2.0, 2.0]))).unwrap();

        assert!(matches!(next_event(&mut rx).await, TransportEvent::PeerJoined(p) if p == ghost));
        assert!(matches!(next_event(&mut rx).await, TransportEvent::PeerLeft(p) if p == ghost));
        assert!(matches!(
            next_event(&mut rx).await,
            TransportEvent::PeerJoined(p) if p == ParticipantId::from("bob")
        ));
        match next_event(&mut rx).await {
            TransportEvent::Message { from, .. } => assert_eq!(from, ParticipantId::from("bob")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_evicted_participant_returns_with_streams() {
        let relay = MemoryRelay::new();
        let (ada, mut ada_rx) = join(&relay, "ada");
        let (bob, _bob_rx) = join(&relay, "bob");
        let bob_id = ParticipantId::from("bob");
        assert!(matches!(next_event(&mut ada_rx).await, TransportEvent::PeerJoined(_)));

        let voice = MediaStream::local("voice", vec![audio_track("b1")]);
        bob.add_stream(&voice, MediaKind::Audio).await.unwrap();
        let first = match next_event(&mut ada_rx).await {
            TransportEvent::StreamAdded { kind: MediaKind::Audio, stream, .. } => stream,
            other => panic!("unexpected event {other:?}"),
        };

        ada.evict(&bob_id).await;
        ada.evict(&bob_id).await;
        assert!(matches!(next_event(&mut ada_rx).await, TransportEvent::PeerLeft(p) if p == bob_id));
        // The session releases bindings of peers it forgets
        first.release();

        bob.send_update(&PeerUpdate {
            position: Some([4.0, 5.0, 6.0]),
            ..Default::default()
        })
        .unwrap();
        assert!(matches!(next_event(&mut ada_rx).await, TransportEvent::PeerJoined(p) if p == bob_id));
        match next_event(&mut ada_rx).await {
            TransportEvent::StreamAdded { from, kind, stream } => {
                assert_eq!(from, bob_id);
                assert_eq!(kind, MediaKind::Audio);
                assert!(!stream.is_released());
                assert_eq!(stream.tracks().len(), 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            next_event(&mut ada_rx).await,
            TransportEvent::Message { message: InboundMessage::Update(_), .. }
        ));
    }

    #[tokio::test]
    async fn test_relay_drop_is_fatal() {
        let relay = MemoryRelay::new();
        let (_ada, mut ada_rx) = join(&relay, "ada");

        relay.kick("ada");
        match next_event(&mut ada_rx).await {
            TransportEvent::Fatal(e) => assert!(e.is_fatal()),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
