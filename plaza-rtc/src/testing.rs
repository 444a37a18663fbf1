//! In-memory transports and rooms for tests

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use plaza_core::models::{MediaKind, ParticipantId};
use plaza_core::protocol::{PeerSignal, StreamTags};

use crate::error::{Result, RtcError};
use crate::media::{MediaStream, MediaTrack};
use crate::mesh::{
    LinkEvent, LinkEventSender, LinkFactory, PeerLink, Rendezvous, RendezvousEvent,
    RendezvousEventSender,
};
use crate::message::InboundMessage;
use crate::relay::{stamp_participant, RelayEvent, RelayEventReceiver, RelayEventSender, RelayLink};
use crate::state::PeerUpdate;
use crate::transport::{Transport, TransportMode};

/// Poll `condition` until it holds or two seconds pass
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Transport that records everything handed to it
pub struct RecordingTransport {
    mode: TransportMode,
    local_id: ParticipantId,
    sent: Mutex<Vec<InboundMessage>>,
    streams: Mutex<Vec<(MediaStream, MediaKind)>>,
    evicted: Mutex<Vec<ParticipantId>>,
    closed: AtomicBool,
    disconnects: AtomicUsize,
}

impl RecordingTransport {
    pub fn new(mode: TransportMode) -> Self {
        Self {
            mode,
            local_id: ParticipantId::from("me"),
            sent: Mutex::new(Vec::new()),
            streams: Mutex::new(Vec::new()),
            evicted: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            disconnects: AtomicUsize::new(0),
        }
    }

    pub fn messages(&self) -> Vec<InboundMessage> {
        self.sent.lock().clone()
    }

    pub fn updates(&self) -> Vec<PeerUpdate> {
        self.sent
            .lock()
            .iter()
            .filter_map(|m| match m {
                InboundMessage::Update(update) => Some(update.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn evicted(&self) -> Vec<ParticipantId> {
        self.evicted.lock().clone()
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Make every further send fail
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn mode(&self) -> TransportMode {
        self.mode
    }

    fn local_id(&self) -> ParticipantId {
        self.local_id.clone()
    }

    fn send(&self, message: &InboundMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RtcError::Closed);
        }
        self.sent.lock().push(message.clone());
        Ok(())
    }

    async fn add_stream(&self, stream: &MediaStream, kind: MediaKind) -> Result<()> {
        self.streams.lock().push((stream.clone(), kind));
        Ok(())
    }

    async fn remove_stream(&self, stream: &MediaStream) -> Result<()> {
        self.streams.lock().retain(|(s, _)| !s.same_as(stream));
        Ok(())
    }

    async fn evict(&self, peer: &ParticipantId) {
        self.evicted.lock().push(peer.clone());
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }
}

type SharedId = Arc<Mutex<Option<ParticipantId>>>;

struct Socket {
    topic: String,
    events: RendezvousEventSender,
    me: SharedId,
}

#[derive(Default)]
struct Hub {
    next_id: u64,
    topics: HashMap<String, Vec<ParticipantId>>,
    sockets: HashMap<ParticipantId, Socket>,
    links: HashMap<(ParticipantId, ParticipantId), Arc<MemoryLink>>,
}

impl Hub {
    fn assign_id(&mut self) -> ParticipantId {
        self.next_id += 1;
        ParticipantId::from(format!("peer-{}", self.next_id))
    }

    fn tell(&self, peer: &ParticipantId, event: RendezvousEvent) {
        if let Some(socket) = self.sockets.get(peer) {
            let _ = socket.events.send(event);
        }
    }

    /// Add `me` to `topic`, announce it, and return the members already there
    fn enter(&mut self, topic: &str, me: &ParticipantId) -> Vec<ParticipantId> {
        let members = self.topics.entry(topic.to_string()).or_default();
        let peers = members.clone();
        members.push(me.clone());
        for peer in &peers {
            self.tell(peer, RendezvousEvent::PeerJoined(me.clone()));
        }
        peers
    }

    /// Remove `me` from the topic and tell the remaining members
    fn exit(&mut self, me: &ParticipantId) -> Option<Socket> {
        let socket = self.sockets.remove(me)?;
        if let Some(members) = self.topics.get_mut(&socket.topic) {
            members.retain(|p| p != me);
            let remaining = members.clone();
            for peer in &remaining {
                self.tell(peer, RendezvousEvent::PeerLeft(me.clone()));
            }
        }
        Some(socket)
    }
}

/// Rendezvous server plus network for in-process mesh rooms
///
/// Links negotiate instantly: the answerer opens when it answers, the
/// initiator when it receives the answer.
#[derive(Clone, Default)]
pub struct MemoryMesh {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryMesh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rendezvous(&self) -> MemoryRendezvous {
        MemoryRendezvous {
            mesh: self.clone(),
            me: Arc::new(Mutex::new(None)),
        }
    }

    pub fn factory(&self) -> MemoryLinkFactory {
        MemoryLinkFactory { mesh: self.clone() }
    }

    /// Drop `who`'s rendezvous session and let it rejoin under a fresh id
    ///
    /// Mirrors the service after a reconnect: the others see the old id
    /// leave and the new one join, and `who` gets a new `Welcome`.
    pub fn reconnect(&self, who: &ParticipantId) -> Option<ParticipantId> {
        let mut hub = self.hub.lock();
        let socket = hub.exit(who)?;
        let fresh = hub.assign_id();
        let peers = hub.enter(&socket.topic, &fresh);
        *socket.me.lock() = Some(fresh.clone());
        let _ = socket.events.send(RendezvousEvent::Welcome {
            self_id: fresh.clone(),
            peers,
        });
        hub.sockets.insert(fresh.clone(), socket);
        Some(fresh)
    }

    /// Hand `to` a track from `from` as if it arrived on their link
    pub fn deliver_track(
        &self,
        from: &ParticipantId,
        to: &ParticipantId,
        stream_id: &str,
        tag: Option<MediaKind>,
        track: MediaTrack,
    ) -> bool {
        let Some(link) = self.link(to, from) else {
            return false;
        };
        link.emit(LinkEvent::Track {
            stream_id: stream_id.to_string(),
            tag,
            track,
        });
        true
    }

    /// Kill the direct connection between `a` and `b` on both ends
    pub fn sever(&self, a: &ParticipantId, b: &ParticipantId) {
        let links: Vec<Arc<MemoryLink>> = {
            let mut hub = self.hub.lock();
            [(a.clone(), b.clone()), (b.clone(), a.clone())]
                .iter()
                .filter_map(|key| hub.links.remove(key))
                .collect()
        };
        for link in links {
            link.fail("connection severed");
        }
    }

    fn link(&self, local: &ParticipantId, remote: &ParticipantId) -> Option<Arc<MemoryLink>> {
        self.hub
            .lock()
            .links
            .get(&(local.clone(), remote.clone()))
            .cloned()
    }
}

pub struct MemoryRendezvous {
    mesh: MemoryMesh,
    me: SharedId,
}

#[async_trait]
impl Rendezvous for MemoryRendezvous {
    async fn join(&self, topic: &str, events: RendezvousEventSender) -> Result<()> {
        let mut hub = self.mesh.hub.lock();
        let me = hub.assign_id();
        let peers = hub.enter(topic, &me);
        *self.me.lock() = Some(me.clone());
        hub.sockets.insert(
            me.clone(),
            Socket {
                topic: topic.to_string(),
                events: events.clone(),
                me: Arc::clone(&self.me),
            },
        );
        drop(hub);

        let _ = events.send(RendezvousEvent::Welcome { self_id: me, peers });
        Ok(())
    }

    fn signal(&self, to: &ParticipantId, signal: PeerSignal) -> Result<()> {
        let from = self.me.lock().clone().ok_or(RtcError::Closed)?;
        self.mesh
            .hub
            .lock()
            .tell(to, RendezvousEvent::Signal { from, signal });
        Ok(())
    }

    async fn leave(&self) {
        let Some(me) = self.me.lock().take() else {
            return;
        };
        self.mesh.hub.lock().exit(&me);
    }
}

pub struct MemoryLinkFactory {
    mesh: MemoryMesh,
}

#[async_trait]
impl LinkFactory for MemoryLinkFactory {
    async fn open(
        &self,
        local: &ParticipantId,
        remote: ParticipantId,
        generation: u64,
        _initiator: bool,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerLink>> {
        let link = Arc::new(MemoryLink {
            mesh: self.mesh.clone(),
            local: local.clone(),
            remote: remote.clone(),
            generation,
            events,
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            attached: Mutex::new(Vec::new()),
        });
        self.mesh
            .hub
            .lock()
            .links
            .insert((local.clone(), remote), Arc::clone(&link));
        Ok(link)
    }
}

pub struct MemoryLink {
    mesh: MemoryMesh,
    local: ParticipantId,
    remote: ParticipantId,
    generation: u64,
    events: LinkEventSender,
    open: AtomicBool,
    closed: AtomicBool,
    attached: Mutex<Vec<(MediaStream, MediaKind)>>,
}

impl MemoryLink {
    fn emit(&self, event: LinkEvent) {
        let _ = self
            .events
            .send((self.remote.clone(), self.generation, event));
    }

    fn peer(&self) -> Option<Arc<Self>> {
        self.mesh.link(&self.remote, &self.local)
    }

    fn tags(&self) -> StreamTags {
        self.attached
            .lock()
            .iter()
            .map(|(stream, kind)| (stream.id().to_string(), *kind))
            .collect()
    }

    fn fail(&self, reason: &str) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.emit(LinkEvent::Closed(reason.to_string()));
        }
    }

    fn mark_open(&self) {
        if self.open.swap(true, Ordering::SeqCst) {
            return;
        }
        self.emit(LinkEvent::Open);
        let attached = self.attached.lock().clone();
        for (stream, kind) in &attached {
            self.deliver_tracks(stream, *kind);
        }
    }

    fn deliver_tracks(&self, stream: &MediaStream, kind: MediaKind) {
        let Some(peer) = self.peer() else {
            return;
        };
        for track in stream.tracks() {
            peer.emit(LinkEvent::Track {
                stream_id: stream.id().to_string(),
                tag: Some(kind),
                track,
            });
        }
    }
}

#[async_trait]
impl PeerLink for MemoryLink {
    fn remote(&self) -> &ParticipantId {
        &self.remote
    }

    async fn start(&self) -> Result<()> {
        self.emit(LinkEvent::Signal(PeerSignal::Offer {
            sdp: "memory-offer".to_string(),
            streams: self.tags(),
        }));
        Ok(())
    }

    async fn handle_signal(&self, signal: PeerSignal) -> Result<()> {
        match signal {
            PeerSignal::Offer { .. } => {
                self.emit(LinkEvent::Signal(PeerSignal::Answer {
                    sdp: "memory-answer".to_string(),
                    streams: self.tags(),
                }));
                self.mark_open();
            }
            PeerSignal::Answer { .. } => self.mark_open(),
            PeerSignal::Candidate(_) => {}
        }
        Ok(())
    }

    fn send(&self, message: &InboundMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RtcError::Closed);
        }
        let wire = message.to_json()?;
        if let Some(peer) = self.peer() {
            peer.emit(LinkEvent::Message(InboundMessage::from_json(&wire)?));
        }
        Ok(())
    }

    async fn attach(&self, stream: &MediaStream, kind: MediaKind) -> Result<()> {
        self.attached.lock().push((stream.clone(), kind));
        if self.open.load(Ordering::SeqCst) {
            self.deliver_tracks(stream, kind);
        }
        Ok(())
    }

    async fn detach(&self, stream: &MediaStream) -> Result<()> {
        self.attached.lock().retain(|(s, _)| !s.same_as(stream));
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let peer = {
            let mut hub = self.mesh.hub.lock();
            let key = (self.local.clone(), self.remote.clone());
            if hub
                .links
                .get(&key)
                .is_some_and(|link| std::ptr::eq(Arc::as_ptr(link), self))
            {
                hub.links.remove(&key);
            }
            hub.links
                .get(&(self.remote.clone(), self.local.clone()))
                .cloned()
        };
        if let Some(peer) = peer {
            peer.fail("remote closed");
        }
    }
}

#[derive(Default)]
struct RelayRoom {
    members: HashMap<ParticipantId, RelayEventSender>,
}

impl RelayRoom {
    fn broadcast(&self, from: &ParticipantId, event: impl Fn() -> RelayEvent) {
        for (id, tx) in &self.members {
            if id != from {
                let _ = tx.send(event());
            }
        }
    }
}

/// Selective-forwarding relay living in memory
#[derive(Clone, Default)]
pub struct MemoryRelay {
    room: Arc<Mutex<RelayRoom>>,
    next_sid: Arc<AtomicU64>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, identity: &str) -> (Arc<dyn RelayLink>, RelayEventReceiver) {
        let identity = ParticipantId::from(identity);
        let (tx, rx) = mpsc::unbounded_channel();
        let participants = {
            let mut room = self.room.lock();
            let present = room.members.keys().cloned().collect();
            room.broadcast(&identity, || {
                RelayEvent::ParticipantJoined(identity.clone())
            });
            room.members.insert(identity.clone(), tx);
            present
        };
        let link = MemoryRelayLink {
            relay: self.clone(),
            identity,
            participants,
        };
        (Arc::new(link), rx)
    }

    /// Drop a participant server-side
    pub fn kick(&self, identity: &str) {
        let identity = ParticipantId::from(identity);
        let mut room = self.room.lock();
        if let Some(tx) = room.members.remove(&identity) {
            let _ = tx.send(RelayEvent::Disconnected("removed by relay".to_string()));
            room.broadcast(&identity, || RelayEvent::ParticipantLeft(identity.clone()));
        }
    }
}

pub struct MemoryRelayLink {
    relay: MemoryRelay,
    identity: ParticipantId,
    participants: Vec<ParticipantId>,
}

impl MemoryRelayLink {
    fn is_member(&self) -> bool {
        self.relay.room.lock().members.contains_key(&self.identity)
    }
}

#[async_trait]
impl RelayLink for MemoryRelayLink {
    fn identity(&self) -> ParticipantId {
        self.identity.clone()
    }

    fn participants(&self) -> Vec<ParticipantId> {
        self.participants.clone()
    }

    fn publish_data(&self, data: Bytes, _reliable: bool) -> Result<()> {
        if !self.is_member() {
            return Err(RtcError::Closed);
        }
        let stamped = Bytes::from(stamp_participant(&data, &self.identity)?);
        self.relay
            .room
            .lock()
            .broadcast(&self.identity, || RelayEvent::Data(stamped.clone()));
        Ok(())
    }

    async fn publish_track(&self, stream: &MediaStream, kind: MediaKind) -> Result<Vec<String>> {
        let room = self.relay.room.lock();
        let mut sids = Vec::new();
        for track in stream.tracks() {
            let sid = format!("TR_{}", self.relay.next_sid.fetch_add(1, Ordering::SeqCst));
            room.broadcast(&self.identity, || RelayEvent::TrackSubscribed {
                participant: self.identity.clone(),
                kind,
                sid: sid.clone(),
                track: track.clone(),
            });
            sids.push(sid);
        }
        Ok(sids)
    }

    async fn unpublish_track(&self, sids: &[String]) -> Result<()> {
        let room = self.relay.room.lock();
        for sid in sids {
            room.broadcast(&self.identity, || RelayEvent::TrackUnsubscribed {
                participant: self.identity.clone(),
                sid: sid.clone(),
            });
        }
        Ok(())
    }

    async fn close(&self) {
        let mut room = self.relay.room.lock();
        if room.members.remove(&self.identity).is_some() {
            room.broadcast(&self.identity, || {
                RelayEvent::ParticipantLeft(self.identity.clone())
            });
        }
    }
}
