use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use plaza_core::models::ParticipantId;

pub type Vec3 = [f32; 3];

pub const DEFAULT_NAME: &str = "Unknown";
pub const DEFAULT_COLOR: &str = "#9ca3af";

/// Avatar body shape
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    #[default]
    Cube,
    Sphere,
    Cone,
    Cylinder,
    Torus,
    /// Shape names this build does not know about
    #[serde(other)]
    Unknown,
}

impl Shape {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cube => "cube",
            Self::Sphere => "sphere",
            Self::Cone => "cone",
            Self::Cylinder => "cylinder",
            Self::Torus => "torus",
            Self::Unknown => "unknown",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Self {
        match name {
            "cube" => Self::Cube,
            "sphere" => Self::Sphere,
            "cone" => Self::Cone,
            "cylinder" => Self::Cylinder,
            "torus" => Self::Torus,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vec3,
    /// Euler angles; only yaw matters for avatars
    pub rotation: Vec3,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appearance {
    pub color: String,
    pub shape: Shape,
    pub name: String,
    /// Face texture, usually a data URI
    pub face: Option<String>,
    pub face_split: Option<f32>,
}

impl Default for Appearance {
    fn default() -> Self {
        Self {
            color: DEFAULT_COLOR.to_string(),
            shape: Shape::default(),
            name: DEFAULT_NAME.to_string(),
            face: None,
            face_split: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveFlags {
    pub moving: bool,
    pub speaking: bool,
    pub mic_on: bool,
    pub screen_sharing: bool,
    /// Broadcast mode: heard room-wide regardless of distance
    pub loudspeaker: bool,
}

/// Emoji reaction; consumers treat it as new only when `timestamp` changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    /// Sender wall clock, milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl Reaction {
    #[must_use]
    pub fn now(emoji: impl Into<String>) -> Self {
        Self {
            emoji: emoji.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub text: String,
    pub timestamp: i64,
}

impl ChatMessage {
    #[must_use]
    pub fn now(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Partial peer state as carried by the `update` topic
///
/// Every field is optional. Absent fields leave the receiver's copy untouched,
/// unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PeerUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Vec3>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation: Option<Vec3>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shape: Option<Shape>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face_split: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_moving: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_speaking: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mic_on: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen_sharing: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loudspeaker: Option<bool>,
}

impl PeerUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Replicated view of one remote participant
#[derive(Debug, Clone, PartialEq)]
pub struct PeerState {
    pub id: ParticipantId,
    pub pose: Pose,
    pub appearance: Appearance,
    pub flags: LiveFlags,
    pub reaction: Option<Reaction>,
    /// Wall clock of the last mutation
    pub last_update: DateTime<Utc>,
    /// Local playback override, never sent anywhere
    pub muted_by_me: bool,
    /// Monotonic time of the last inbound activity, drives staleness expiry
    pub last_seen: Instant,
}

impl PeerState {
    /// Entry for a peer we have not heard from yet
    #[must_use]
    pub fn placeholder(id: ParticipantId) -> Self {
        Self {
            id,
            pose: Pose::default(),
            appearance: Appearance::default(),
            flags: LiveFlags::default(),
            reaction: None,
            last_update: Utc::now(),
            muted_by_me: false,
            last_seen: Instant::now(),
        }
    }

    /// Field-wise last-writer-wins merge
    pub fn apply(&mut self, update: &PeerUpdate) {
        if let Some(position) = update.position {
            self.pose.position = position;
        }
        if let Some(rotation) = update.rotation {
            self.pose.rotation = rotation;
        }
        if let Some(color) = &update.color {
            self.appearance.color.clone_from(color);
        }
        if let Some(shape) = update.shape {
            self.appearance.shape = shape;
        }
        if let Some(name) = &update.name {
            self.appearance.name.clone_from(name);
        }
        if let Some(face) = &update.face {
            self.appearance.face = Some(face.clone());
        }
        if let Some(split) = update.face_split {
            self.appearance.face_split = Some(split);
        }
        if let Some(moving) = update.is_moving {
            self.flags.moving = moving;
        }
        if let Some(speaking) = update.is_speaking {
            self.flags.speaking = speaking;
        }
        if let Some(mic_on) = update.mic_on {
            self.flags.mic_on = mic_on;
        }
        if let Some(sharing) = update.screen_sharing {
            self.flags.screen_sharing = sharing;
        }
        if let Some(loudspeaker) = update.loudspeaker {
            self.flags.loudspeaker = loudspeaker;
        }
        self.touch();
    }

    pub fn set_reaction(&mut self, reaction: Reaction) {
        self.reaction = Some(reaction);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_update = Utc::now();
        self.last_seen = Instant::now();
    }
}

/// Local participant state as sampled from the render/physics loop
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalState {
    pub pose: Pose,
    pub appearance: Appearance,
    pub flags: LiveFlags,
}

impl LocalState {
    /// Full Local Broadcast Packet for this state
    #[must_use]
    pub fn packet(&self) -> PeerUpdate {
        PeerUpdate {
            position: Some(self.pose.position),
            rotation: Some(self.pose.rotation),
            color: Some(self.appearance.color.clone()),
            shape: Some(self.appearance.shape),
            name: Some(self.appearance.name.clone()),
            face: self.appearance.face.clone(),
            face_split: self.appearance.face_split,
            is_moving: Some(self.flags.moving),
            is_speaking: Some(self.flags.speaking),
            mic_on: Some(self.flags.mic_on),
            screen_sharing: Some(self.flags.screen_sharing),
            loudspeaker: Some(self.flags.loudspeaker),
        }
    }
}
