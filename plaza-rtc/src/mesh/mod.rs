//! Mesh strategy: one direct peer connection per remote participant
//!
//! Peers find each other through a rendezvous topic derived from the room id.
//! A participant that joins initiates links to everyone already present;
//! everyone else waits for its offer. Link failures only ever remove the
//! affected peer.

mod link;
mod rendezvous;
mod rtc_link;

pub use link::{LinkEvent, LinkEventReceiver, LinkEventSender, LinkFactory, PeerLink};
pub use rendezvous::{Rendezvous, RendezvousEvent, RendezvousEventSender, WsRendezvous};
pub use rtc_link::{RtcLinkFactory, RtcPeerLink};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use plaza_core::models::{MediaKind, ParticipantId, RoomId};
use plaza_core::protocol::{rendezvous_topic, PeerSignal};

use crate::error::{Result, RtcError};
use crate::media::{classify, MediaStream, MediaTrack};
use crate::message::InboundMessage;
use crate::transport::{EventSender, Transport, TransportEvent, TransportMode};

const WELCOME_TIMEOUT: Duration = Duration::from_secs(10);

struct RemoteGroup {
    stream: MediaStream,
    kind: MediaKind,
}

struct PeerEntry {
    link: Arc<dyn PeerLink>,
    generation: u64,
    open: bool,
    streams: HashMap<String, RemoteGroup>,
}

struct MeshInner {
    room_id: RoomId,
    rendezvous: Arc<dyn Rendezvous>,
    factory: Arc<dyn LinkFactory>,
    events: EventSender,
    link_events: LinkEventSender,
    local_id: RwLock<ParticipantId>,
    peers: DashMap<ParticipantId, PeerEntry>,
    local_streams: Mutex<Vec<(MediaStream, MediaKind)>>,
    next_generation: AtomicU64,
}

/// Connected mesh transport
pub struct MeshTransport {
    inner: Arc<MeshInner>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MeshTransport {
    /// Join the room's rendezvous topic
    ///
    /// Returns once the rendezvous has welcomed us. Links to the peers already
    /// present are opened in the background.
    pub async fn connect(
        room_id: &RoomId,
        app_id: &str,
        rendezvous: Arc<dyn Rendezvous>,
        factory: Arc<dyn LinkFactory>,
        events: EventSender,
    ) -> Result<Self> {
        let topic = rendezvous_topic(app_id, room_id.as_str());
        let (rendezvous_tx, mut rendezvous_rx) = mpsc::unbounded_channel();
        rendezvous.join(&topic, rendezvous_tx).await?;

        let welcome = tokio::time::timeout(WELCOME_TIMEOUT, async {
            while let Some(event) = rendezvous_rx.recv().await {
                match event {
                    RendezvousEvent::Welcome { self_id, peers } => return Ok((self_id, peers)),
                    RendezvousEvent::Lost(reason) => return Err(RtcError::Signaling(reason)),
                    other => debug!(event = ?other, "Rendezvous event before welcome"),
                }
            }
            Err(RtcError::Signaling("rendezvous closed before welcome".to_string()))
        })
        .await
        .unwrap_or_else(|_| Err(RtcError::Signaling("timed out waiting for rendezvous welcome".to_string())));

        let (self_id, peers) = match welcome {
            Ok(welcome) => welcome,
            Err(e) => {
                rendezvous.leave().await;
                return Err(e);
            }
        };

        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(MeshInner {
            room_id: room_id.clone(),
            rendezvous,
            factory,
            events,
            link_events: link_tx,
            local_id: RwLock::new(self_id.clone()),
            peers: DashMap::new(),
            local_streams: Mutex::new(Vec::new()),
            next_generation: AtomicU64::new(1),
        });

        info!(room_id = %room_id, self_id = %self_id, peers = peers.len(), "Joined mesh rendezvous");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            Arc::clone(&inner),
            peers,
            rendezvous_rx,
            link_rx,
            cancel.clone(),
        ));

        Ok(Self {
            inner,
            cancel,
            task: Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
        })
    }
}

async fn run(
    inner: Arc<MeshInner>,
    initial_peers: Vec<ParticipantId>,
    mut rendezvous_rx: mpsc::UnboundedReceiver<RendezvousEvent>,
    mut link_rx: LinkEventReceiver,
    cancel: CancellationToken,
) {
    for peer in initial_peers {
        inner.open_link(peer, true).await;
    }

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = rendezvous_rx.recv() => match event {
                Some(RendezvousEvent::Lost(reason)) => {
                    error!(room_id = %inner.room_id, reason = %reason, "Mesh rendezvous lost");
                    let _ = inner.events.send(TransportEvent::Fatal(RtcError::Signaling(reason)));
                    break;
                }
                Some(event) => inner.on_rendezvous(event).await,
                None => break,
            },
            event = link_rx.recv() => match event {
                Some((peer, generation, event)) => inner.on_link(peer, generation, event).await,
                None => break,
            },
        }
    }
    debug!(room_id = %inner.room_id, "Mesh event loop stopped");
}

impl MeshInner {
    fn link(&self, peer: &ParticipantId) -> Option<Arc<dyn PeerLink>> {
        self.peers.get(peer).map(|entry| Arc::clone(&entry.link))
    }

    async fn on_rendezvous(&self, event: RendezvousEvent) {
        match event {
            RendezvousEvent::Welcome { self_id, peers } => {
                info!(room_id = %self.room_id, self_id = %self_id, peers = peers.len(), "Rejoined mesh rendezvous");
                let known: Vec<ParticipantId> =
                    self.peers.iter().map(|entry| entry.key().clone()).collect();
                for peer in known {
                    self.drop_peer(&peer, "rendezvous identity changed").await;
                }
                *self.local_id.write() = self_id;
                for peer in peers {
                    self.open_link(peer, true).await;
                }
            }
            RendezvousEvent::PeerJoined(peer) => {
                if !self.peers.contains_key(&peer) {
                    self.open_link(peer, false).await;
                }
            }
            RendezvousEvent::PeerLeft(peer) => self.drop_peer(&peer, "left the room").await,
            RendezvousEvent::Signal { from, signal } => self.on_signal(from, signal).await,
            RendezvousEvent::Lost(_) => {}
        }
    }

    async fn on_signal(&self, from: ParticipantId, signal: PeerSignal) {
        let link = match self.link(&from) {
            Some(link) => link,
            None if matches!(signal, PeerSignal::Offer { .. }) => {
                match self.open_link(from.clone(), false).await {
                    Some(link) => link,
                    None => return,
                }
            }
            None => {
                debug!(peer = %from, "Signal for unknown peer");
                return;
            }
        };

        if let Err(e) = link.handle_signal(signal).await {
            warn!(peer = %from, error = %e, "Negotiation with peer failed");
            self.drop_peer(&from, "negotiation failed").await;
        }
    }

    async fn open_link(&self, peer: ParticipantId, initiator: bool) -> Option<Arc<dyn PeerLink>> {
        let local = self.local_id.read().clone();
        if peer == local {
            return None;
        }
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);

        let link = match self
            .factory
            .open(&local, peer.clone(), generation, initiator, self.link_events.clone())
            .await
        {
            Ok(link) => link,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to create peer link");
                return None;
            }
        };

        if let Some(previous) = self.peers.insert(
            peer.clone(),
            PeerEntry {
                link: Arc::clone(&link),
                generation,
                open: false,
                streams: HashMap::new(),
            },
        ) {
            previous.link.close().await;
        }

        let streams = self.local_streams.lock().clone();
        for (stream, kind) in &streams {
            if let Err(e) = link.attach(stream, *kind).await {
                warn!(peer = %peer, stream = %stream.id(), error = %e, "Failed to attach local stream");
            }
        }

        if initiator {
            if let Err(e) = link.start().await {
                warn!(peer = %peer, error = %e, "Failed to start negotiation");
                self.drop_peer(&peer, "negotiation failed").await;
                return None;
            }
        }

        debug!(peer = %peer, generation, initiator, "Opened peer link");
        Some(link)
    }

    /// Forget a peer and close its link; reports `PeerLeft` if the session knew about it
    async fn drop_peer(&self, peer: &ParticipantId, reason: &str) {
        let Some((_, entry)) = self.peers.remove(peer) else {
            return;
        };
        entry.link.close().await;
        if entry.open || !entry.streams.is_empty() {
            info!(room_id = %self.room_id, peer = %peer, reason = %reason, "Peer left");
            let _ = self.events.send(TransportEvent::PeerLeft(peer.clone()));
        } else {
            debug!(peer = %peer, reason = %reason, "Dropped peer before its link opened");
        }
    }

    fn is_current(&self, peer: &ParticipantId, generation: u64) -> bool {
        self.peers
            .get(peer)
            .is_some_and(|entry| entry.generation == generation)
    }

    async fn on_link(&self, peer: ParticipantId, generation: u64, event: LinkEvent) {
        if !self.is_current(&peer, generation) {
            debug!(peer = %peer, generation, "Ignoring event from replaced link");
            return;
        }

        match event {
            LinkEvent::Signal(signal) => {
                if let Err(e) = self.rendezvous.signal(&peer, signal) {
                    debug!(peer = %peer, error = %e, "Could not relay signal");
                }
            }
            LinkEvent::Open => {
                if let Some(mut entry) = self.peers.get_mut(&peer) {
                    entry.open = true;
                }
                info!(room_id = %self.room_id, peer = %peer, "Peer connected");
                let _ = self.events.send(TransportEvent::PeerJoined(peer));
            }
            LinkEvent::Message(message) => {
                if let InboundMessage::StreamEnded { kind } = &message {
                    if let Some(mut entry) = self.peers.get_mut(&peer) {
                        entry.streams.retain(|_, group| group.kind != *kind);
                    }
                }
                let _ = self.events.send(TransportEvent::Message {
                    from: peer,
                    message,
                });
            }
            LinkEvent::Track {
                stream_id,
                tag,
                track,
            } => self.on_track(peer, stream_id, tag, track),
            LinkEvent::Closed(reason) => self.drop_peer(&peer, &reason).await,
        }
    }

    fn on_track(
        &self,
        peer: ParticipantId,
        stream_id: String,
        tag: Option<MediaKind>,
        track: MediaTrack,
    ) {
        let Some(mut entry) = self.peers.get_mut(&peer) else {
            return;
        };

        let group = entry
            .streams
            .entry(stream_id.clone())
            .or_insert_with(|| RemoteGroup {
                stream: MediaStream::new(stream_id),
                kind: tag.unwrap_or(MediaKind::Audio),
            });
        let previous = (!group.stream.tracks().is_empty()).then_some(group.kind);
        group.stream.add_track(track);
        let kind = classify(&group.stream, tag);
        let reclassified = previous.filter(|previous| *previous != kind);
        if reclassified.is_some() {
            // The old binding gets released, so the new one needs its own handle
            group.stream = MediaStream::with_tracks(group.stream.id(), group.stream.tracks());
        }
        group.kind = kind;
        let stream = group.stream.clone();
        drop(entry);

        if let Some(previous) = reclassified {
            let _ = self.events.send(TransportEvent::StreamRemoved {
                from: peer.clone(),
                kind: previous,
            });
        }
        let _ = self.events.send(TransportEvent::StreamAdded {
            from: peer,
            kind,
            stream,
        });
    }
}

#[async_trait]
impl Transport for MeshTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Mesh
    }

    fn local_id(&self) -> ParticipantId {
        self.inner.local_id.read().clone()
    }

    fn send(&self, message: &InboundMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RtcError::Closed);
        }
        let links: Vec<Arc<dyn PeerLink>> = self
            .inner
            .peers
            .iter()
            .filter(|entry| entry.open)
            .map(|entry| Arc::clone(&entry.link))
            .collect();

        for link in links {
            if let Err(e) = link.send(message) {
                debug!(peer = %link.remote(), error = %e, "Send to peer failed");
            }
        }
        Ok(())
    }

    async fn add_stream(&self, stream: &MediaStream, kind: MediaKind) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RtcError::Closed);
        }
        {
            let mut local = self.inner.local_streams.lock();
            local.retain(|(s, _)| !s.same_as(stream));
            local.push((stream.clone(), kind));
        }

        let links: Vec<Arc<dyn PeerLink>> = self
            .inner
            .peers
            .iter()
            .map(|entry| Arc::clone(&entry.link))
            .collect();
        for link in links {
            if let Err(e) = link.attach(stream, kind).await {
                warn!(peer = %link.remote(), stream = %stream.id(), error = %e, "Failed to attach stream");
            }
        }
        info!(room_id = %self.inner.room_id, stream = %stream.id(), kind = %kind, "Publishing stream to mesh");
        Ok(())
    }

    async fn remove_stream(&self, stream: &MediaStream) -> Result<()> {
        let kind = {
            let mut local = self.inner.local_streams.lock();
            let kind = local
                .iter()
                .find(|(s, _)| s.same_as(stream))
                .map(|(_, kind)| *kind);
            local.retain(|(s, _)| !s.same_as(stream));
            kind
        };
        let Some(kind) = kind else {
            return Ok(());
        };

        let links: Vec<Arc<dyn PeerLink>> = self
            .inner
            .peers
            .iter()
            .map(|entry| Arc::clone(&entry.link))
            .collect();
        for link in links {
            if let Err(e) = link.detach(stream).await {
                warn!(peer = %link.remote(), stream = %stream.id(), error = %e, "Failed to detach stream");
            }
        }
        if !self.closed.load(Ordering::SeqCst) {
            self.send(&InboundMessage::StreamEnded { kind })?;
        }
        info!(room_id = %self.inner.room_id, stream = %stream.id(), kind = %kind, "Stopped publishing stream");
        Ok(())
    }

    async fn evict(&self, peer: &ParticipantId) {
        self.inner.drop_peer(peer, "stopped responding").await;
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

        let peers: Vec<(ParticipantId, PeerEntry)> = {
            let keys: Vec<ParticipantId> =
                self.inner.peers.iter().map(|e| e.key().clone()).collect();
            keys.into_iter()
                .filter_map(|k| self.inner.peers.remove(&k))
                .collect()
        };
        for (_, entry) in peers {
            entry.link.close().await;
        }
        self.inner.local_streams.lock().clear();
        self.inner.rendezvous.leave().await;
        info!(room_id = %self.inner.room_id, "Left mesh room");
    }
}

impl Drop for MeshTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::tests::{audio_track, video_track};
    use crate::testing::MemoryMesh;
    use crate::transport::{event_channel, EventReceiver};

    async fn join(mesh: &MemoryMesh) -> (MeshTransport, EventReceiver) {
        let (tx, rx) = event_channel();
        let transport = MeshTransport::connect(
            &RoomId::from("lobby"),
            "plaza",
            Arc::new(mesh.rendezvous()),
            Arc::new(mesh.factory()),
            tx,
        )
        .await
        .unwrap();
        (transport, rx)
    }

    async fn next_event(rx: &mut EventReceiver) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("event channel closed")
    }

    /// Two connected participants with their `PeerJoined` events consumed
    async fn pair(mesh: &MemoryMesh) -> ((MeshTransport, EventReceiver), (MeshTransport, EventReceiver)) {
        let (a, mut a_rx) = join(mesh).await;
        let (b, mut b_rx) = join(mesh).await;

        match next_event(&mut a_rx).await {
            TransportEvent::PeerJoined(peer) => assert_eq!(peer, b.local_id()),
            other => panic!("unexpected event {other:?}"),
        }
        match next_event(&mut b_rx).await {
            TransportEvent::PeerJoined(peer) => assert_eq!(peer, a.local_id()),
            other => panic!("unexpected event {other:?}"),
        }
        ((a, a_rx), (b, b_rx))
    }

    #[tokio::test]
    async fn test_connect_assigns_identity() {
        let mesh = MemoryMesh::new();
        let (a, _a_rx) = join(&mesh).await;
        let (b, _b_rx) = join(&mesh).await;

        assert_eq!(a.mode(), TransportMode::Mesh);
        assert_ne!(a.local_id(), b.local_id());
    }

    #[tokio::test]
    async fn test_reaction_reaches_peer() {
        let mesh = MemoryMesh::new();
        let ((a, _a_rx), (_b, mut b_rx)) = pair(&mesh).await;

        a.send_reaction(&crate::state::Reaction::now("🎉")).unwrap();
        match next_event(&mut b_rx).await {
            TransportEvent::Message {
                from,
                message: InboundMessage::Reaction(reaction),
            } => {
                assert_eq!(from, a.local_id());
                assert_eq!(reaction.emoji, "🎉");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_published_after_connect() {
        let mesh = MemoryMesh::new();
        let ((a, _a_rx), (_b, mut b_rx)) = pair(&mesh).await;

        let screen = MediaStream::local("screen", vec![video_track("v1")]);
        a.add_stream(&screen, MediaKind::Screen).await.unwrap();
        match next_event(&mut b_rx).await {
            TransportEvent::StreamAdded { from, kind, .. } => {
                assert_eq!(from, a.local_id());
                assert_eq!(kind, MediaKind::Screen);
            }
            other => panic!("unexpected event {other:?}"),
        }

        a.remove_stream(&screen).await.unwrap();
        match next_event(&mut b_rx).await {
            TransportEvent::Message {
                message: InboundMessage::StreamEnded { kind },
                ..
            } => assert_eq!(kind, MediaKind::Screen),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_departure_reported_once() {
        let mesh = MemoryMesh::new();
        let ((_a, mut a_rx), (b, _b_rx)) = pair(&mesh).await;
        let b_id = b.local_id();

        b.disconnect().await;
        match next_event(&mut a_rx).await {
            TransportEvent::PeerLeft(peer) => assert_eq!(peer, b_id),
            other => panic!("unexpected event {other:?}"),
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_severed_link_is_not_fatal() {
        let mesh = MemoryMesh::new();
        let ((a, mut a_rx), (b, _b_rx)) = pair(&mesh).await;

        mesh.sever(&a.local_id(), &b.local_id());
        match next_event(&mut a_rx).await {
            TransportEvent::PeerLeft(peer) => assert_eq!(peer, b.local_id()),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(a.send_chat("still here").is_ok());
    }

    #[tokio::test]
    async fn test_evict_drops_peer() {
        let mesh = MemoryMesh::new();
        let ((a, mut a_rx), (b, _b_rx)) = pair(&mesh).await;

        a.evict(&b.local_id()).await;
        match next_event(&mut a_rx).await {
            TransportEvent::PeerLeft(peer) => assert_eq!(peer, b.local_id()),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_untagged_stream_reclassified_by_later_video() {
        let mesh = MemoryMesh::new();
        let ((a, _a_rx), (b, mut b_rx)) = pair(&mesh).await;
        let (a_id, b_id) = (a.local_id(), b.local_id());

        let mic = MediaTrack::local(audio_track("mic"));
        assert!(mesh.deliver_track(&a_id, &b_id, "cam", None, mic));
        let voice = match next_event(&mut b_rx).await {
            TransportEvent::StreamAdded { kind: MediaKind::Audio, stream, .. } => stream,
            other => panic!("unexpected event {other:?}"),
        };

        let video = MediaTrack::local(video_track("video"));
        assert!(mesh.deliver_track(&a_id, &b_id, "cam", None, video));
        assert!(matches!(
            next_event(&mut b_rx).await,
            TransportEvent::StreamRemoved { kind: MediaKind::Audio, .. }
        ));
        match next_event(&mut b_rx).await {
            TransportEvent::StreamAdded { from, kind, stream } => {
                assert_eq!(from, a_id);
                assert_eq!(kind, MediaKind::Screen);
                assert!(!stream.same_as(&voice));
                assert_eq!(stream.tracks().len(), 2);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_explicit_tag_beats_inference() {
        let mesh = MemoryMesh::new();
        let ((a, _a_rx), (b, mut b_rx)) = pair(&mesh).await;

        let camera = MediaTrack::local(video_track("camera"));
        assert!(mesh.deliver_track(&a.local_id(), &b.local_id(), "cam", Some(MediaKind::Video), camera));
        assert!(matches!(
            next_event(&mut b_rx).await,
            TransportEvent::StreamAdded { kind: MediaKind::Video, .. }
        ));
    }

    #[tokio::test]
    async fn test_rendezvous_reconnect_rebuilds_links() {
        let mesh = MemoryMesh::new();
        let ((a, mut a_rx), (b, mut b_rx)) = pair(&mesh).await;
        let (old_a, b_id) = (a.local_id(), b.local_id());

        let new_a = mesh.reconnect(&old_a).unwrap();

        assert!(matches!(next_event(&mut a_rx).await, TransportEvent::PeerLeft(p) if p == b_id));
        assert!(matches!(next_event(&mut a_rx).await, TransportEvent::PeerJoined(p) if p == b_id));
        assert_eq!(a.local_id(), new_a);

        assert!(matches!(next_event(&mut b_rx).await, TransportEvent::PeerLeft(p) if p == old_a));
        assert!(matches!(next_event(&mut b_rx).await, TransportEvent::PeerJoined(p) if p == new_a));

        a.send_chat("back").unwrap();
        match next_event(&mut b_rx).await {
            TransportEvent::Message { from, .. } => assert_eq!(from, new_a),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disconnect_twice() {
        let mesh = MemoryMesh::new();
        let (a, _a_rx) = join(&mesh).await;

        a.disconnect().await;
        a.disconnect().await;
        assert!(matches!(a.send_chat("hello"), Err(RtcError::Closed)));
    }
}
