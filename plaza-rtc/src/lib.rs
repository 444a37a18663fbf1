//! Plaza real-time network layer
//!
//! Keeps every participant of a shared 3D room in sync: avatar state,
//! reactions, chat and audio/screen streams.
//!
//! ## Architecture
//!
//! - **`StrategySelector`**: asks the capacity endpoint whether a room runs
//!   as a mesh or through a relay, then connects the matching transport
//! - **`MeshTransport`**: one direct peer connection per participant,
//!   discovered through a rendezvous topic
//! - **`RelayTransport`**: one connection to a selective-forwarding relay
//! - **`PeerStateStore`**: replicated view of every remote participant
//! - **`LocalStateBroadcaster`**: throttles local state to the send rate
//! - **`RoomSession`**: owns all of the above for the lifetime of a join
//!
//! ## Usage
//!
//! ```rust,ignore
//! use plaza_rtc::RoomSession;
//!
//! let session = RoomSession::join(&config.client, &RoomId::from("lobby"), "ada").await?;
//! session.publish_local(&local_state, false);
//! for peer in session.store().snapshot().peers() {
//!     render(peer);
//! }
//! session.leave().await;
//! ```

pub mod broadcaster;
pub mod error;
pub mod media;
pub mod mesh;
pub mod message;
pub mod relay;
mod rtc;
pub mod selector;
pub mod session;
pub mod state;
pub mod transport;

#[cfg(test)]
mod testing;

pub use broadcaster::LocalStateBroadcaster;
pub use error::{Result, RtcError};
pub use media::{classify, MediaStream, MediaTrack, TrackKind};
pub use mesh::MeshTransport;
pub use message::{InboundMessage, Topic};
pub use relay::RelayTransport;
pub use selector::{CapacityClient, ConnectedStrategy, StrategySelector};
pub use session::{RoomSession, SessionEvent, SessionOptions};
pub use state::{LocalState, PeerState, PeerStateStore, PeerUpdate};
pub use transport::{Transport, TransportEvent, TransportMode};
