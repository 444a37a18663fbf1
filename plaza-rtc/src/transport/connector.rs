use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use plaza_core::config::ClientConfig;
use plaza_core::models::RoomId;
use plaza_core::protocol::IceServer;

use super::{EventSender, Transport};
use crate::error::Result;
use crate::mesh::{MeshTransport, RtcLinkFactory, WsRendezvous};
use crate::relay::RelayTransport;

/// Everything the mesh strategy needs to join a room
#[derive(Debug, Clone, PartialEq)]
pub struct MeshParams {
    pub room_id: RoomId,
    pub signaling_url: String,
    pub ice_servers: Vec<IceServer>,
}

/// Everything the relay strategy needs to join a room
#[derive(Debug, Clone, PartialEq)]
pub struct RelayParams {
    pub room_id: RoomId,
    pub url: String,
    pub token: String,
    pub ice_servers: Vec<IceServer>,
}

/// Builds connected transports once the room's mode is known
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect_mesh(
        &self,
        params: MeshParams,
        events: EventSender,
    ) -> Result<Arc<dyn Transport>>;

    async fn connect_relay(
        &self,
        params: RelayParams,
        events: EventSender,
    ) -> Result<Arc<dyn Transport>>;
}

/// Production connector: WebSocket signaling plus webrtc peer connections
#[derive(Debug, Clone)]
pub struct RtcConnector {
    app_id: String,
    max_reconnects: usize,
}

impl RtcConnector {
    #[must_use]
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            app_id: config.app_id.clone(),
            max_reconnects: config.rendezvous_max_reconnects,
        }
    }
}

#[async_trait]
impl TransportConnector for RtcConnector {
    async fn connect_mesh(
        &self,
        params: MeshParams,
        events: EventSender,
    ) -> Result<Arc<dyn Transport>> {
        let rendezvous = Arc::new(WsRendezvous::new(
            params.signaling_url.clone(),
            self.max_reconnects,
        ));
        let factory = Arc::new(RtcLinkFactory::new(&params.ice_servers)?);
        let transport =
            MeshTransport::connect(&params.room_id, &self.app_id, rendezvous, factory, events)
                .await?;

        info!(room_id = %params.room_id, url = %params.signaling_url, "Mesh transport connected");
        Ok(Arc::new(transport))
    }

    async fn connect_relay(
        &self,
        params: RelayParams,
        events: EventSender,
    ) -> Result<Arc<dyn Transport>> {
        let transport = RelayTransport::connect(
            &params.room_id,
            &params.url,
            &params.token,
            &params.ice_servers,
            events,
        )
        .await?;

        info!(room_id = %params.room_id, url = %params.url, "Relay transport connected");
        Ok(Arc::new(transport))
    }
}
