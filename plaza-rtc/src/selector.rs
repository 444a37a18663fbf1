use backon::{BackoffBuilder, ExponentialBuilder};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

use plaza_core::models::RoomId;
use plaza_core::protocol::{ConnectionConfig, IceServer};

use crate::error::{Result, RtcError};
use crate::transport::{
    event_channel, EventReceiver, MeshParams, RelayParams, Transport, TransportConnector,
};

const CAPACITY_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for the capacity/config resolution endpoint
#[derive(Debug, Clone)]
pub struct CapacityClient {
    http: reqwest::Client,
    base_url: Url,
    retries: usize,
}

impl CapacityClient {
    pub fn new(base_url: &str, retries: usize) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| RtcError::Resolution(format!("invalid capacity url {base_url}: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(CAPACITY_REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url,
            retries,
        })
    }

    fn endpoint(&self, room_id: &RoomId) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| RtcError::Resolution(format!("capacity url {} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(["api", "rooms", room_id.as_str(), "connection"]);
        Ok(url)
    }

    /// Look up how to join `room_id`
    ///
    /// Connection-level failures are retried with exponential backoff; an
    /// error status or an unparseable body fails immediately.
    pub async fn lookup(&self, room_id: &RoomId, participant: &str) -> Result<ConnectionConfig> {
        let url = self.endpoint(room_id)?;
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(2))
            .with_max_times(self.retries)
            .with_jitter()
            .build();

        let mut last_err = None;
        for delay in std::iter::once(Duration::ZERO).chain(backoff) {
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }

            match self
                .http
                .get(url.clone())
                .query(&[("participant", participant)])
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        return Err(RtcError::Resolution(format!(
                            "capacity endpoint returned {status}"
                        )));
                    }
                    return response.json::<ConnectionConfig>().await.map_err(|e| {
                        RtcError::Resolution(format!("malformed capacity response: {e}"))
                    });
                }
                Err(e) if e.is_connect() || e.is_timeout() => {
                    warn!(room_id = %room_id, error = %e, "Capacity lookup failed, retrying");
                    last_err = Some(e);
                }
                Err(e) => return Err(RtcError::Resolution(e.to_string())),
            }
        }

        Err(RtcError::Resolution(last_err.map_or_else(
            || "capacity lookup retries exhausted".to_string(),
            |e| e.to_string(),
        )))
    }
}

/// A transport that reported connected, with its event stream
pub struct ConnectedStrategy {
    pub transport: Arc<dyn Transport>,
    pub events: EventReceiver,
    pub config: ConnectionConfig,
}

impl std::fmt::Debug for ConnectedStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectedStrategy")
            .field("mode", &self.transport.mode())
            .field("local_id", &self.transport.local_id())
            .finish_non_exhaustive()
    }
}

/// Picks mesh or relay for a room and connects it
///
/// There is no fallback: if the capacity lookup fails the join
/// fails.
pub struct StrategySelector {
    capacity: CapacityClient,
    connector: Arc<dyn TransportConnector>,
    default_ice_servers: Vec<IceServer>,
}

impl StrategySelector {
    #[must_use]
    pub fn new(
        capacity: CapacityClient,
        connector: Arc<dyn TransportConnector>,
        default_ice_servers: Vec<IceServer>,
    ) -> Self {
        Self {
            capacity,
            connector,
            default_ice_servers,
        }
    }

    pub async fn resolve(&self, room_id: &RoomId, participant: &str) -> Result<ConnectedStrategy> {
        let config = self.capacity.lookup(room_id, participant).await?;
        let (events_tx, events) = event_channel();

        let transport = match &config {
            ConnectionConfig::Relay {
                url,
                token,
                occupancy,
            } => {
                info!(room_id = %room_id, occupancy = ?occupancy, "Room uses relay transport");
                self.connector
                    .connect_relay(
                        RelayParams {
                            room_id: room_id.clone(),
                            url: url.clone(),
                            token: token.clone(),
                            ice_servers: self.default_ice_servers.clone(),
                        },
                        events_tx,
                    )
                    .await?
            }
            ConnectionConfig::Mesh {
                signaling_url,
                ice_servers,
                occupancy,
            } => {
                info!(room_id = %room_id, occupancy = ?occupancy, "Room uses mesh transport");
                let ice_servers = if ice_servers.is_empty() {
                    self.default_ice_servers.clone()
                } else {
                    ice_servers.clone()
                };
                self.connector
                    .connect_mesh(
                        MeshParams {
                            room_id: room_id.clone(),
                            signaling_url: signaling_url.clone(),
                            ice_servers,
                        },
                        events_tx,
                    )
                    .await?
            }
        };

        Ok(ConnectedStrategy {
            transport,
            events,
            config,
        })
    }
}
