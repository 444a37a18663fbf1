use serde::{Deserialize, Serialize};

/// What a media stream carries, as far as playback is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Microphone voice
    Audio,
    /// Screen capture, possibly with system audio
    Screen,
    /// Camera video
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Screen => "screen",
            Self::Video => "video",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MediaKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(Self::Audio),
            "screen" => Ok(Self::Screen),
            "video" => Ok(Self::Video),
            other => Err(crate::Error::InvalidInput(format!("unknown media kind: {other}"))),
        }
    }
}
