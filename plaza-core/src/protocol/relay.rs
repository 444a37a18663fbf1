//! Relay signaling protocol (client side of the SFU contract)
//!
//! One WebSocket per session carries JSON frames; media and data share a
//! single peer connection negotiated over it. Published tracks are
//! acknowledged with a relay-assigned `sid`, and the relay uses that sid as
//! the track id of the forwarded track so subscribers can match
//! `TrackAnnounced` to incoming media.

use serde::{Deserialize, Serialize};

use super::rendezvous::IceCandidate;
use crate::models::{MediaKind, ParticipantId};

/// Client -> relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayClientMessage {
    Join { token: String },
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: IceCandidate },
    /// Announce a local track (`cid` = local track id) before renegotiating
    Publish { cid: String, kind: MediaKind },
    Unpublish { sid: String },
    Leave,
}

/// Relay -> client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayServerMessage {
    Joined {
        identity: ParticipantId,
        #[serde(default)]
        participants: Vec<ParticipantId>,
    },
    ParticipantJoined { identity: ParticipantId },
    ParticipantLeft { identity: ParticipantId },
    TrackPublished { cid: String, sid: String },
    TrackUnpublished { sid: String },
    TrackAnnounced {
        participant: ParticipantId,
        sid: String,
        kind: MediaKind,
    },
    TrackEnded { participant: ParticipantId, sid: String },
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: IceCandidate },
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_frame() {
        let msg = RelayClientMessage::Publish {
            cid: "mic-1".to_string(),
            kind: MediaKind::Audio,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"publish","cid":"mic-1","kind":"audio"}"#);
    }

    #[test]
    fn test_track_announced_parse() {
        let msg: RelayServerMessage = serde_json::from_str(
            r#"{"type":"track_announced","participant":"p1","sid":"TR_1","kind":"screen"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            RelayServerMessage::TrackAnnounced {
                participant: ParticipantId::from("p1"),
                sid: "TR_1".to_string(),
                kind: MediaKind::Screen,
            }
        );
    }

    #[test]
    fn test_joined_defaults_participants() {
        let msg: RelayServerMessage =
            serde_json::from_str(r#"{"type":"joined","identity":"me"}"#).unwrap();
        assert!(matches!(msg, RelayServerMessage::Joined { participants, .. } if participants.is_empty()));
    }
}
