//! Wire types shared by the network layer and the reference service

pub mod capacity;
pub mod relay;
pub mod rendezvous;
pub mod token;

pub use capacity::{rendezvous_topic, ConnectionConfig, IceServer};
pub use relay::{RelayClientMessage, RelayServerMessage};
pub use rendezvous::{ClientMessage, IceCandidate, PeerSignal, ServerMessage, StreamTags};
pub use token::{RelayClaims, RelayTokenIssuer};
