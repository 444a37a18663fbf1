use moka::sync::Cache;
use std::sync::Arc;
use std::time::Duration;

use plaza_core::models::{ParticipantId, RoomId};
use plaza_core::protocol::RelayTokenIssuer;
use plaza_core::Config;

use crate::rendezvous::RendezvousHub;

const MAX_RELAY_GRANTS: u64 = 100_000;

/// Relay credentials handed out and not yet expired
///
/// Each grant counts towards its room's occupancy until the token would have
/// expired; the relay itself is never asked.
#[derive(Clone)]
pub struct RelayGrants {
    grants: Cache<(RoomId, ParticipantId), ()>,
}

impl RelayGrants {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            grants: Cache::builder()
                .max_capacity(MAX_RELAY_GRANTS)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn record(&self, room: &RoomId, identity: &ParticipantId) {
        self.grants.insert((room.clone(), identity.clone()), ());
    }

    #[must_use]
    pub fn count(&self, room: &RoomId) -> usize {
        self.grants.iter().filter(|(key, ())| key.0 == *room).count()
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub hub: Arc<RendezvousHub>,
    pub grants: RelayGrants,
    /// Present only when a relay is configured
    pub issuer: Option<RelayTokenIssuer>,
}

impl AppState {
    pub fn new(config: Config) -> plaza_core::Result<Self> {
        let issuer = if config.relay.is_enabled() {
            Some(RelayTokenIssuer::new(
                config.relay.token_secret.as_bytes(),
                config.relay.issuer.clone(),
                config.relay.token_ttl(),
            )?)
        } else {
            None
        };

        Ok(Self {
            grants: RelayGrants::new(config.relay.token_ttl()),
            hub: Arc::new(RendezvousHub::new()),
            config: Arc::new(config),
            issuer,
        })
    }
}
