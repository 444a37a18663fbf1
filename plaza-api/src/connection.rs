//! Capacity endpoint: tells a client whether a room runs as mesh or relay

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use tracing::info;

use plaza_core::models::{ParticipantId, RoomId};
use plaza_core::protocol::{rendezvous_topic, ConnectionConfig};

use crate::error::{AppError, AppResult};
use crate::state::AppState;

const MAX_HINT_LEN: usize = 32;
const SUFFIX_ALPHABET: [char; 36] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
    'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

#[derive(Debug, Deserialize)]
pub struct ConnectionQuery {
    /// Display-name hint folded into the relay identity
    pub participant: Option<String>,
}

/// `GET /api/rooms/{room_id}/connection`
///
/// Occupancy is the rendezvous membership of the room's topic plus live relay
/// grants. Above the threshold, and only if a relay is configured, the caller
/// gets relay credentials; otherwise mesh signaling details.
pub async fn room_connection(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(query): Query<ConnectionQuery>,
) -> AppResult<Json<ConnectionConfig>> {
    if room_id.trim().is_empty() {
        return Err(AppError::bad_request("room id must not be empty"));
    }
    let room = RoomId::from(room_id);
    let config = &state.config;

    let topic = rendezvous_topic(&config.rendezvous.app_id, room.as_str());
    let occupancy = state.hub.occupancy(&topic) + state.grants.count(&room);

    if occupancy > config.capacity.relay_threshold {
        if let Some(issuer) = &state.issuer {
            let identity = relay_identity(query.participant.as_deref());
            let (token, expires_at) = issuer.issue(&room, &identity)?;
            state.grants.record(&room, &identity);

            info!(room_id = %room, identity = %identity, occupancy, expires_at = %expires_at, "Routing join to relay");
            return Ok(Json(ConnectionConfig::Relay {
                url: config.relay.url.clone(),
                token,
                occupancy: Some(occupancy),
            }));
        }
    }

    info!(room_id = %room, occupancy, "Routing join to mesh");
    Ok(Json(ConnectionConfig::Mesh {
        signaling_url: config.rendezvous.public_url.clone(),
        ice_servers: config.ice.servers(),
        occupancy: Some(occupancy),
    }))
}

/// Server-assigned relay identity: the sanitized hint plus a random suffix
fn relay_identity(hint: Option<&str>) -> ParticipantId {
    let base: String = hint
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(MAX_HINT_LEN)
        .collect();
    let base = if base.is_empty() { "guest".to_string() } else { base };
    ParticipantId::from(format!("{base}-{}", nanoid::nanoid!(6, &SUFFIX_ALPHABET)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_identity_is_sanitized_and_suffixed() {
        let id = relay_identity(Some("Ada Lovelace!"));
        let (base, suffix) = id.as_str().rsplit_once('-').unwrap();
        assert_eq!(base, "AdaLovelace");
        assert_eq!(suffix.len(), 6);

        assert!(relay_identity(None).as_str().starts_with("guest-"));
        assert!(relay_identity(Some("  ")).as_str().starts_with("guest-"));
    }

    #[test]
    fn test_relay_identities_are_unique() {
        assert_ne!(relay_identity(Some("ada")), relay_identity(Some("ada")));
    }
}
