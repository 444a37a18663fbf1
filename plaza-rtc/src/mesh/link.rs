use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use plaza_core::models::{MediaKind, ParticipantId};
use plaza_core::protocol::PeerSignal;

use crate::error::Result;
use crate::media::{MediaStream, MediaTrack};
use crate::message::InboundMessage;

/// Something that happened on one per-peer link
#[derive(Debug)]
pub enum LinkEvent {
    /// Setup payload to relay to the remote peer through the rendezvous
    Signal(PeerSignal),
    /// Data channels are up
    Open,
    Message(InboundMessage),
    Track {
        stream_id: String,
        /// Kind the sender attached to this stream, if any
        tag: Option<MediaKind>,
        track: MediaTrack,
    },
    Closed(String),
}

/// Link events tagged with the remote peer and the link generation
///
/// The generation lets the mesh ignore late events from a link it already
/// replaced.
pub type LinkEventSender = mpsc::UnboundedSender<(ParticipantId, u64, LinkEvent)>;
pub type LinkEventReceiver = mpsc::UnboundedReceiver<(ParticipantId, u64, LinkEvent)>;

/// One direct connection to one remote participant
#[async_trait]
pub trait PeerLink: Send + Sync {
    fn remote(&self) -> &ParticipantId;

    /// Begin negotiation; only called on the initiating side
    async fn start(&self) -> Result<()>;

    async fn handle_signal(&self, signal: PeerSignal) -> Result<()>;

    /// Queue a message on the channel matching its topic; never suspends
    fn send(&self, message: &InboundMessage) -> Result<()>;

    async fn attach(&self, stream: &MediaStream, kind: MediaKind) -> Result<()>;

    async fn detach(&self, stream: &MediaStream) -> Result<()>;

    async fn close(&self);
}

/// Creates per-peer links
#[async_trait]
pub trait LinkFactory: Send + Sync {
    async fn open(
        &self,
        local: &ParticipantId,
        remote: ParticipantId,
        generation: u64,
        initiator: bool,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerLink>>;
}
