use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// ICE Server configuration (STUN/TURN)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// URLs for the ICE server (e.g., ["stun:stun.example.com:3478"])
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Response of `GET /api/rooms/{room_id}/connection`
///
/// ```json
/// { "mode": "relay", "url": "wss://relay", "token": "..." }
/// { "mode": "mesh", "signalingUrl": "wss://rendezvous" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ConnectionConfig {
    Relay {
        url: String,
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        occupancy: Option<usize>,
    },
    Mesh {
        signaling_url: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        ice_servers: Vec<IceServer>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        occupancy: Option<usize>,
    },
}

impl ConnectionConfig {
    #[must_use]
    pub const fn mode(&self) -> &'static str {
        match self {
            Self::Relay { .. } => "relay",
            Self::Mesh { .. } => "mesh",
        }
    }
}

/// Rendezvous topic for a room
///
/// Hex SHA-256 of `"{app_id}:{room_id}"`, so only clients that know the room
/// id can meet and the rendezvous server never sees the id itself.
#[must_use]
pub fn rendezvous_topic(app_id: &str, room_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(app_id.as_bytes());
    hasher.update(b":");
    hasher.update(room_id.as_bytes());
    hex::encode(hasher.finalize())
}
