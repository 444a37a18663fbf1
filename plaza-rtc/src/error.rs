use thiserror::Error;

use plaza_core::models::ParticipantId;

/// Network layer errors
///
/// Transport-level failures are translated at the strategy boundary into
/// either a peer removal (localized) or one of the fatal variants.
#[derive(Error, Debug)]
pub enum RtcError {
    /// Capacity endpoint unreachable, failing or returning garbage
    #[error("Cannot resolve room connection: {0}")]
    Resolution(String),

    #[error("Relay connection lost: {0}")]
    RelayFatal(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Connection to peer {peer} failed: {reason}")]
    PeerConnection { peer: ParticipantId, reason: String },

    #[error("Media negotiation failed: {0}")]
    Negotiation(String),

    #[error("Malformed payload: {0}")]
    Codec(String),

    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Transport is closed")]
    Closed,
}

impl RtcError {
    /// Whether the error ends the room session
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Resolution(_) | Self::RelayFatal(_))
    }

    /// Message suitable for showing to the user
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Resolution(_) | Self::Http(_) => {
                "Could not reach the room service. Check your connection and try joining again."
                    .to_string()
            }
            Self::RelayFatal(_) => {
                "Lost connection to the media relay. Rejoin the room to reconnect.".to_string()
            }
            Self::Signaling(_) => {
                "Lost connection to the room coordination server. Rejoin the room to reconnect."
                    .to_string()
            }
            other => format!("Connection problem: {other}"),
        }
    }
}

impl From<serde_json::Error> for RtcError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<prost::DecodeError> for RtcError {
    fn from(err: prost::DecodeError) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RtcError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Signaling(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RtcError>;
