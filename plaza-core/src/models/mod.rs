pub mod id;
pub mod media;

pub use id::{generate_id, ParticipantId, RoomId};
pub use media::MediaKind;
