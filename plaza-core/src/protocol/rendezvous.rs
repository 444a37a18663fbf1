//! Mesh rendezvous protocol
//!
//! JSON text frames over a WebSocket. The server groups connections by topic,
//! assigns each one a participant id and forwards `Signal` frames between
//! members of the same topic. It never inspects the signal payload.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::models::{MediaKind, ParticipantId};

/// Stream id to kind tags sent alongside session descriptions
pub type StreamTags = HashMap<String, MediaKind>;

/// Client -> server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join { topic: String },
    Signal { to: ParticipantId, signal: PeerSignal },
    Leave,
}

/// Server -> client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once after `Join`; `peers` are the members already present
    Welcome {
        self_id: ParticipantId,
        peers: Vec<ParticipantId>,
    },
    PeerJoined { peer_id: ParticipantId },
    PeerLeft { peer_id: ParticipantId },
    Signal { from: ParticipantId, signal: PeerSignal },
    Error { message: String },
}

/// Connection setup payload exchanged between two mesh peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PeerSignal {
    Offer {
        sdp: String,
        #[serde(default)]
        streams: StreamTags,
    },
    Answer {
        sdp: String,
        #[serde(default)]
        streams: StreamTags,
    },
    Candidate(IceCandidate),
}

/// Trickled ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}
