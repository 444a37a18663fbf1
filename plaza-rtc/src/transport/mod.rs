//! Transport contract shared by the mesh and relay strategies

mod connector;

pub use connector::{MeshParams, RelayParams, RtcConnector, TransportConnector};

#[cfg(test)]
pub use connector::MockTransportConnector;

use async_trait::async_trait;
use tokio::sync::mpsc;

use plaza_core::models::{MediaKind, ParticipantId};

use crate::error::{Result, RtcError};
use crate::media::MediaStream;
use crate::message::InboundMessage;
use crate::state::{ChatMessage, PeerUpdate, Reaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// One direct connection per remote participant
    Mesh,
    /// One connection to a selective-forwarding relay
    Relay,
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mesh => write!(f, "mesh"),
            Self::Relay => write!(f, "relay"),
        }
    }
}

/// Everything a transport reports to the session
#[derive(Debug)]
pub enum TransportEvent {
    /// A remote participant is reachable and can receive data
    PeerJoined(ParticipantId),
    /// A remote participant is gone, gracefully or not
    PeerLeft(ParticipantId),
    Message {
        from: ParticipantId,
        message: InboundMessage,
    },
    StreamAdded {
        from: ParticipantId,
        kind: MediaKind,
        stream: MediaStream,
    },
    StreamRemoved {
        from: ParticipantId,
        kind: MediaKind,
    },
    /// The session cannot continue
    Fatal(RtcError),
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

#[must_use]
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// A connected room transport
///
/// Instances are produced already connected (`MeshTransport::connect`,
/// `RelayTransport::connect`) and report through the `EventSender` they were
/// built with. Sends never suspend: they enqueue and return.
#[async_trait]
pub trait Transport: Send + Sync {
    fn mode(&self) -> TransportMode;

    /// Identity the rest of the room knows us by
    fn local_id(&self) -> ParticipantId;

    /// Fan a message out to every connected participant
    fn send(&self, message: &InboundMessage) -> Result<()>;

    fn send_update(&self, update: &PeerUpdate) -> Result<()> {
        self.send(&InboundMessage::Update(update.clone()))
    }

    fn send_reaction(&self, reaction: &Reaction) -> Result<()> {
        self.send(&InboundMessage::Reaction(reaction.clone()))
    }

    fn send_chat(&self, text: &str) -> Result<()> {
        self.send(&InboundMessage::Chat(ChatMessage::now(text)))
    }

    /// Publish a local stream to everyone, including peers that join later
    async fn add_stream(&self, stream: &MediaStream, kind: MediaKind) -> Result<()>;

    /// Stop publishing a local stream; the tracks themselves stay untouched
    async fn remove_stream(&self, stream: &MediaStream) -> Result<()>;

    /// Drop a participant that stopped responding
    async fn evict(&self, peer: &ParticipantId);

    /// Leave the room. Safe to call repeatedly and mid-handshake.
    async fn disconnect(&self);
}
