use bytes::Bytes;
use serde::{Deserialize, Serialize};

use plaza_core::models::MediaKind;

use crate::error::Result;
use crate::state::{ChatMessage, PeerUpdate, Reaction};

/// Logical data topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Update,
    Reaction,
    Chat,
    /// Stream lifecycle notices
    Control,
}

impl Topic {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Reaction => "reaction",
            Self::Chat => "chat",
            Self::Control => "control",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "update" => Some(Self::Update),
            "reaction" => Some(Self::Reaction),
            "chat" => Some(Self::Chat),
            "control" => Some(Self::Control),
            _ => None,
        }
    }

    /// Continuous state is loss tolerant; discrete events must arrive
    #[must_use]
    pub const fn is_reliable(self) -> bool {
        !matches!(self, Self::Update)
    }
}

/// Data message as carried between participants
///
/// Inbound frames are decoded into this exactly once, at the transport edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum InboundMessage {
    Update(PeerUpdate),
    Reaction(Reaction),
    Chat(ChatMessage),
    /// The sender stopped publishing a stream of this kind
    StreamEnded { kind: MediaKind },
}

impl InboundMessage {
    #[must_use]
    pub const fn topic(&self) -> Topic {
        match self {
            Self::Update(_) => Topic::Update,
            Self::Reaction(_) => Topic::Reaction,
            Self::Chat(_) => Topic::Chat,
            Self::StreamEnded { .. } => Topic::Control,
        }
    }

    /// JSON text frame used on mesh data channels
    pub fn to_json(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}
