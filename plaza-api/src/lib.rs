//! Reference signaling and token service for Plaza rooms
//!
//! Serves the capacity endpoint that picks mesh or relay per room, the mesh
//! rendezvous WebSocket, and health probes.

pub mod connection;
pub mod error;
pub mod health;
pub mod rendezvous;
pub mod state;

use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use error::{AppError, AppResult};
pub use rendezvous::RendezvousHub;
pub use state::{AppState, RelayGrants};

/// Build the service router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/api/rooms/{room_id}/connection",
            get(connection::room_connection),
        )
        .route("/ws/rendezvous", get(rendezvous::rendezvous_handler))
        .merge(health::create_health_router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
