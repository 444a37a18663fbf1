//! Room session: the context object tying one joined room together
//!
//! A session owns the connected transport, the peer state store, the local
//! broadcaster and the single task that applies network events to the store.
//! Its lifetime is "in a room"; dropping or leaving it tears everything down.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use plaza_core::config::ClientConfig;
use plaza_core::models::{MediaKind, ParticipantId, RoomId};

use crate::broadcaster::LocalStateBroadcaster;
use crate::error::{Result, RtcError};
use crate::media::MediaStream;
use crate::message::InboundMessage;
use crate::selector::{CapacityClient, ConnectedStrategy, StrategySelector};
use crate::state::{ChatMessage, LocalState, PeerStateStore, PeerUpdate, Reaction};
use crate::transport::{
    EventReceiver, RtcConnector, Transport, TransportEvent, TransportMode,
};

const UI_EVENT_CAPACITY: usize = 256;

/// Notifications for the UI layer
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PeerJoined(ParticipantId),
    PeerLeft(ParticipantId),
    Chat {
        from: ParticipantId,
        message: ChatMessage,
    },
    /// The session is over; `message` is meant for the user
    Fatal { message: String },
}

/// Timing knobs of a running session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub broadcast_interval: Duration,
    pub keepalive: Duration,
    pub sweep_interval: Duration,
    /// `None` disables staleness expiry
    pub peer_timeout: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for SessionOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            broadcast_interval: config.broadcast_interval(),
            keepalive: config.keepalive(),
            sweep_interval: config.sweep_interval(),
            peer_timeout: config.peer_timeout(),
        }
    }
}

/// A joined room
pub struct RoomSession {
    room_id: RoomId,
    transport: Arc<dyn Transport>,
    store: PeerStateStore,
    broadcaster: Arc<Mutex<LocalStateBroadcaster>>,
    ui: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    left: AtomicBool,
}

impl RoomSession {
    /// Resolve the room's strategy, connect it and start processing events
    pub async fn join(config: &ClientConfig, room_id: &RoomId, participant: &str) -> Result<Self> {
        let capacity = CapacityClient::new(&config.capacity_url, config.resolve_retries)?;
        let selector = StrategySelector::new(
            capacity,
            Arc::new(RtcConnector::new(config)),
            config.ice_servers.clone(),
        );
        let connected = selector.resolve(room_id, participant).await?;
        Ok(Self::start(room_id, connected, SessionOptions::from(config)))
    }

    /// Start a session over an already connected strategy
    #[must_use]
    pub fn start(room_id: &RoomId, connected: ConnectedStrategy, options: SessionOptions) -> Self {
        let ConnectedStrategy {
            transport, events, ..
        } = connected;

        let store = PeerStateStore::new();
        let broadcaster = Arc::new(Mutex::new(LocalStateBroadcaster::new(
            Arc::clone(&transport),
            options.broadcast_interval,
        )));
        let (ui, _) = broadcast::channel(UI_EVENT_CAPACITY);
        let cancel = CancellationToken::new();

        let processor = EventProcessor {
            room_id: room_id.clone(),
            transport: Arc::clone(&transport),
            store: store.clone(),
            broadcaster: Arc::clone(&broadcaster),
            ui: ui.clone(),
        };
        let task = tokio::spawn(processor.run(events, options, cancel.clone()));

        info!(room_id = %room_id, mode = %transport.mode(), local_id = %transport.local_id(), "Room session started");
        Self {
            room_id: room_id.clone(),
            transport,
            store,
            broadcaster,
            ui,
            cancel,
            task: Mutex::new(Some(task)),
            left: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    #[must_use]
    pub fn mode(&self) -> TransportMode {
        self.transport.mode()
    }

    #[must_use]
    pub fn local_id(&self) -> ParticipantId {
        self.transport.local_id()
    }

    /// Handle for the render loop
    #[must_use]
    pub const fn store(&self) -> &PeerStateStore {
        &self.store
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.ui.subscribe()
    }

    /// Offer the current local state to the broadcaster
    pub fn publish_local(&self, state: &LocalState, force: bool) -> bool {
        self.broadcaster.lock().sample(state, force)
    }

    /// Send a partial update outside the broadcast cadence
    pub fn send_update(&self, update: &PeerUpdate) -> Result<()> {
        self.transport.send_update(update)
    }

    pub fn react(&self, emoji: &str) -> Result<Reaction> {
        let reaction = Reaction::now(emoji);
        self.transport.send_reaction(&reaction)?;
        Ok(reaction)
    }

    pub fn chat(&self, text: &str) -> Result<()> {
        self.transport.send_chat(text)
    }

    pub async fn add_stream(&self, stream: &MediaStream, kind: MediaKind) -> Result<()> {
        self.transport.add_stream(stream, kind).await
    }

    pub async fn remove_stream(&self, stream: &MediaStream) -> Result<()> {
        self.transport.remove_stream(stream).await
    }

    pub fn set_muted_by_me(&self, peer: &ParticipantId, muted: bool) -> bool {
        self.store.set_muted_by_me(peer, muted)
    }

    /// Leave the room; safe to call more than once
    pub async fn leave(&self) {
        if self.left.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.transport.disconnect().await;
        self.store.clear();
        info!(room_id = %self.room_id, "Left room");
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct EventProcessor {
    room_id: RoomId,
    transport: Arc<dyn Transport>,
    store: PeerStateStore,
    broadcaster: Arc<Mutex<LocalStateBroadcaster>>,
    ui: broadcast::Sender<SessionEvent>,
}

impl EventProcessor {
    async fn run(self, mut events: EventReceiver, options: SessionOptions, cancel: CancellationToken) {
        let mut keepalive = tokio::time::interval(options.keepalive);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweep = tokio::time::interval(options.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(TransportEvent::Fatal(err)) => {
                        self.fatal(err).await;
                        break;
                    }
                    Some(event) => self.apply(event),
                    None => break,
                },
                _ = keepalive.tick() => {
                    self.broadcaster.lock().keepalive(options.keepalive);
                }
                _ = sweep.tick(), if options.peer_timeout.is_some() => {
                    if let Some(timeout) = options.peer_timeout {
                        self.sweep(timeout).await;
                    }
                }
            }
        }
        debug!(room_id = %self.room_id, "Session event task stopped");
    }

    fn notify(&self, event: SessionEvent) {
        let _ = self.ui.send(event);
    }

    fn apply(&self, event: TransportEvent) {
        match event {
            TransportEvent::PeerJoined(peer) => {
                self.store.ensure(&peer);
                self.broadcaster.lock().force_resend();
                self.notify(SessionEvent::PeerJoined(peer));
            }
            TransportEvent::PeerLeft(peer) => {
                if self.store.remove(&peer).is_some() {
                    self.notify(SessionEvent::PeerLeft(peer));
                }
            }
            TransportEvent::Message { from, message } => self.on_message(from, message),
            TransportEvent::StreamAdded { from, kind, stream } => {
                debug!(peer = %from, kind = %kind, stream = %stream.id(), "Binding remote stream");
                self.store.bind_stream(&from, kind, stream);
            }
            TransportEvent::StreamRemoved { from, kind } => {
                self.store.unbind_stream(&from, kind);
            }
            TransportEvent::Fatal(_) => {}
        }
    }

    fn on_message(&self, from: ParticipantId, message: InboundMessage) {
        match message {
            InboundMessage::Update(update) => {
                self.store.upsert(&from, &update);
                if update.screen_sharing == Some(false) {
                    self.store.unbind_stream(&from, MediaKind::Screen);
                }
            }
            InboundMessage::Reaction(reaction) => self.store.set_reaction(&from, reaction),
            InboundMessage::Chat(message) => {
                self.store.touch(&from);
                self.notify(SessionEvent::Chat { from, message });
            }
            InboundMessage::StreamEnded { kind } => {
                self.store.touch(&from);
                self.store.unbind_stream(&from, kind);
            }
        }
    }

    async fn sweep(&self, timeout: Duration) {
        for peer in self.store.stale_peers(Instant::now(), timeout) {
            warn!(room_id = %self.room_id, peer = %peer, timeout = ?timeout, "Evicting silent peer");
            self.transport.evict(&peer).await;
            if self.store.remove(&peer).is_some() {
                self.notify(SessionEvent::PeerLeft(peer));
            }
        }
    }

    async fn fatal(&self, err: RtcError) {
        error!(room_id = %self.room_id, error = %err, "Room session failed");
        self.store.clear();
        self.notify(SessionEvent::Fatal {
            message: err.user_message(),
        });
        self.transport.disconnect().await;
    }
}
