use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use plaza_core::models::{MediaKind, ParticipantId};

use crate::error::Result;
use crate::media::{MediaStream, MediaTrack};

/// What the relay connection reports
#[derive(Debug)]
pub enum RelayEvent {
    ParticipantJoined(ParticipantId),
    ParticipantLeft(ParticipantId),
    /// Encoded data packet forwarded by the relay
    Data(Bytes),
    TrackSubscribed {
        participant: ParticipantId,
        kind: MediaKind,
        sid: String,
        track: MediaTrack,
    },
    TrackUnsubscribed {
        participant: ParticipantId,
        sid: String,
    },
    /// The relay connection is gone; there is no recovering in place
    Disconnected(String),
}

pub type RelayEventSender = mpsc::UnboundedSender<RelayEvent>;
pub type RelayEventReceiver = mpsc::UnboundedReceiver<RelayEvent>;

/// A joined connection to the media relay
#[async_trait]
pub trait RelayLink: Send + Sync {
    /// Identity the relay assigned to us
    fn identity(&self) -> ParticipantId;

    /// Participants already in the room when we joined
    fn participants(&self) -> Vec<ParticipantId>;

    /// Queue an encoded packet on the lossy or the reliable channel
    fn publish_data(&self, data: Bytes, reliable: bool) -> Result<()>;

    /// Publish every local track of `stream`, returning the relay track ids
    ///
    /// Resolves once the relay acknowledged each track.
    async fn publish_track(&self, stream: &MediaStream, kind: MediaKind) -> Result<Vec<String>>;

    /// Withdraw previously published tracks and wait for the relay to confirm
    async fn unpublish_track(&self, sids: &[String]) -> Result<()>;

    async fn close(&self);
}
