mod peer;
mod reaction;
mod store;

pub use peer::{
    Appearance, ChatMessage, LiveFlags, LocalState, PeerState, PeerUpdate, Pose, Reaction, Shape,
    Vec3, DEFAULT_COLOR, DEFAULT_NAME,
};
pub use reaction::ReactionTracker;
pub use store::{PeerStateStore, StoreSnapshot};
