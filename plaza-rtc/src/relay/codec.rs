//! Binary data packets exchanged through the relay
//!
//! Every packet names its topic and the sending participant; the relay
//! fills in `participant` when it forwards, so outbound packets leave it
//! empty. Bodies are topic specific.

use prost::Message;

use plaza_core::models::{MediaKind, ParticipantId};

use crate::error::{Result, RtcError};
use crate::message::{InboundMessage, Topic};
use crate::state::{ChatMessage, PeerUpdate, Reaction, Shape, Vec3};

#[derive(Clone, PartialEq, Message)]
pub struct DataPacket {
    #[prost(string, tag = "1")]
    pub topic: String,
    #[prost(string, tag = "2")]
    pub participant: String,
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct UpdateBody {
    #[prost(float, repeated, tag = "1")]
    pub position: Vec<f32>,
    #[prost(float, repeated, tag = "2")]
    pub rotation: Vec<f32>,
    #[prost(string, optional, tag = "3")]
    pub color: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub shape: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "6")]
    pub face: Option<String>,
    #[prost(float, optional, tag = "7")]
    pub face_split: Option<f32>,
    #[prost(bool, optional, tag = "8")]
    pub is_moving: Option<bool>,
    #[prost(bool, optional, tag = "9")]
    pub is_speaking: Option<bool>,
    #[prost(bool, optional, tag = "10")]
    pub mic_on: Option<bool>,
    #[prost(bool, optional, tag = "11")]
    pub screen_sharing: Option<bool>,
    #[prost(bool, optional, tag = "12")]
    pub loudspeaker: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReactionBody {
    #[prost(string, tag = "1")]
    pub emoji: String,
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct ChatBody {
    #[prost(string, tag = "1")]
    pub text: String,
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct StreamEndedBody {
    #[prost(string, tag = "1")]
    pub kind: String,
}

fn vec3(values: &[f32]) -> Option<Vec3> {
    <Vec3>::try_from(values).ok()
}

impl From<&PeerUpdate> for UpdateBody {
    fn from(update: &PeerUpdate) -> Self {
        Self {
            position: update.position.map(Vec::from).unwrap_or_default(),
            rotation: update.rotation.map(Vec::from).unwrap_or_default(),
            color: update.color.clone(),
            shape: update.shape.map(|s| s.as_str().to_string()),
            name: update.name.clone(),
            face: update.face.clone(),
            face_split: update.face_split,
            is_moving: update.is_moving,
            is_speaking: update.is_speaking,
            mic_on: update.mic_on,
            screen_sharing: update.screen_sharing,
            loudspeaker: update.loudspeaker,
        }
    }
}

impl From<UpdateBody> for PeerUpdate {
    fn from(body: UpdateBody) -> Self {
        Self {
            position: vec3(&body.position),
            rotation: vec3(&body.rotation),
            color: body.color,
            shape: body.shape.as_deref().map(Shape::parse),
            name: body.name,
            face: body.face,
            face_split: body.face_split,
            is_moving: body.is_moving,
            is_speaking: body.is_speaking,
            mic_on: body.mic_on,
            screen_sharing: body.screen_sharing,
            loudspeaker: body.loudspeaker,
        }
    }
}

#[must_use]
pub fn encode_packet(message: &InboundMessage) -> Vec<u8> {
    let payload = match message {
        InboundMessage::Update(update) => UpdateBody::from(update).encode_to_vec(),
        InboundMessage::Reaction(reaction) => ReactionBody {
            emoji: reaction.emoji.clone(),
            timestamp: reaction.timestamp,
        }
        .encode_to_vec(),
        InboundMessage::Chat(chat) => ChatBody {
            text: chat.text.clone(),
            timestamp: chat.timestamp,
        }
        .encode_to_vec(),
        InboundMessage::StreamEnded { kind } => StreamEndedBody {
            kind: kind.as_str().to_string(),
        }
        .encode_to_vec(),
    };

    DataPacket {
        topic: message.topic().as_str().to_string(),
        participant: String::new(),
        payload,
    }
    .encode_to_vec()
}

/// Decode a forwarded packet
///
/// Packets on topics this build does not know decode to `None`.
pub fn decode_packet(data: &[u8]) -> Result<Option<(ParticipantId, InboundMessage)>> {
    let packet = DataPacket::decode(data)?;
    let Some(topic) = Topic::parse(&packet.topic) else {
        return Ok(None);
    };
    if packet.participant.is_empty() {
        return Err(RtcError::Codec("relay packet without sender".to_string()));
    }

    let payload = packet.payload.as_slice();
    let message = match topic {
        Topic::Update => InboundMessage::Update(UpdateBody::decode(payload)?.into()),
        Topic::Reaction => {
            let body = ReactionBody::decode(payload)?;
            InboundMessage::Reaction(Reaction {
                emoji: body.emoji,
                timestamp: body.timestamp,
            })
        }
        Topic::Chat => {
            let body = ChatBody::decode(payload)?;
            InboundMessage::Chat(ChatMessage {
                text: body.text,
                timestamp: body.timestamp,
            })
        }
        Topic::Control => {
            let body = StreamEndedBody::decode(payload)?;
            let kind = body
                .kind
                .parse::<MediaKind>()
                .map_err(|e| RtcError::Codec(e.to_string()))?;
            InboundMessage::StreamEnded { kind }
        }
    };

    Ok(Some((ParticipantId::from(packet.participant), message)))
}

/// Set the sender on an encoded packet, as the relay does when forwarding
pub fn stamp_participant(data: &[u8], participant: &ParticipantId) -> Result<Vec<u8>> {
    let mut packet = DataPacket::decode(data)?;
    packet.participant = participant.as_str().to_string();
    Ok(packet.encode_to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_keeps_absent_fields_absent() {
        let update = PeerUpdate {
            position: Some([1.0, 2.0, 3.0]),
            mic_on: Some(false),
            shape: Some(Shape::Torus),
            ..PeerUpdate::default()
        };
        let wire = encode_packet(&InboundMessage::Update(update.clone()));
        let stamped = stamp_participant(&wire, &ParticipantId::from("ada")).unwrap();

        let (from, message) = decode_packet(&stamped).unwrap().unwrap();
        assert_eq!(from.as_str(), "ada");
        assert_eq!(message, InboundMessage::Update(update));
    }

    #[test]
    fn test_unstamped_packet_is_rejected() {
        let wire = encode_packet(&InboundMessage::Reaction(Reaction {
            emoji: "🎉".to_string(),
            timestamp: 7,
        }));
        assert!(matches!(decode_packet(&wire), Err(RtcError::Codec(_))));
    }

    #[test]
    fn test_unknown_topic_is_ignored() {
        let packet = DataPacket {
            topic: "telemetry".to_string(),
            participant: "ada".to_string(),
            payload: vec![1, 2, 3],
        };
        assert!(decode_packet(&packet.encode_to_vec()).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_bytes_are_codec_errors() {
        assert!(matches!(
            decode_packet(&[0xff, 0xff, 0xff]),
            Err(RtcError::Codec(_))
        ));
    }

    #[test]
    fn test_short_vector_decodes_as_absent() {
        let body = UpdateBody {
            position: vec![1.0],
            ..UpdateBody::default()
        };
        let update = PeerUpdate::from(body);
        assert!(update.position.is_none());
    }

    #[test]
    fn test_stream_ended_with_unknown_kind_fails() {
        let packet = DataPacket {
            topic: Topic::Control.as_str().to_string(),
            participant: "ada".to_string(),
            payload: StreamEndedBody {
                kind: "hologram".to_string(),
            }
            .encode_to_vec(),
        };
        assert!(decode_packet(&packet.encode_to_vec()).is_err());
    }
}
