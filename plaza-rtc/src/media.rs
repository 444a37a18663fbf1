//! Media stream handles shared between the network layer and its consumers

use parking_lot::RwLock;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use plaza_core::models::MediaKind;

/// Track media type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    #[must_use]
    pub const fn from_codec_type(codec: RTPCodecType) -> Self {
        match codec {
            RTPCodecType::Video => Self::Video,
            _ => Self::Audio,
        }
    }
}

/// Where the samples of a track come from
#[derive(Clone)]
pub enum TrackSource {
    /// Captured locally; owned by the device layer, never stopped here
    Local(Arc<TrackLocalStaticSample>),
    /// Received from a remote participant
    Remote(Arc<TrackRemote>),
}

#[derive(Clone)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    source: TrackSource,
}

impl MediaTrack {
    #[must_use]
    pub fn local(track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            id: track.id().to_string(),
            kind: TrackKind::from_codec_type(track.kind()),
            source: TrackSource::Local(track),
        }
    }

    #[must_use]
    pub fn remote(track: Arc<TrackRemote>) -> Self {
        Self {
            id: track.id(),
            kind: TrackKind::from_codec_type(track.kind()),
            source: TrackSource::Remote(track),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn kind(&self) -> TrackKind {
        self.kind
    }

    #[must_use]
    pub const fn source(&self) -> &TrackSource {
        &self.source
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let source = match self.source {
            TrackSource::Local(_) => "local",
            TrackSource::Remote(_) => "remote",
        };
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("source", &source)
            .finish()
    }
}

struct StreamInner {
    id: String,
    tracks: RwLock<Vec<MediaTrack>>,
    released: CancellationToken,
}

/// Cloneable handle to a group of tracks
///
/// Clones share the same tracks and release state. Releasing a binding only
/// signals playback consumers to stop; the underlying tracks are left alone.
#[derive(Clone)]
pub struct MediaStream {
    inner: Arc<StreamInner>,
}

impl MediaStream {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_tracks(id, Vec::new())
    }

    #[must_use]
    pub fn with_tracks(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id: id.into(),
                tracks: RwLock::new(tracks),
                released: CancellationToken::new(),
            }),
        }
    }

    /// Stream of locally captured tracks handed over by the device layer
    #[must_use]
    pub fn local(id: impl Into<String>, tracks: Vec<Arc<TrackLocalStaticSample>>) -> Self {
        Self::with_tracks(id, tracks.into_iter().map(MediaTrack::local).collect())
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    #[must_use]
    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.inner.tracks.read().clone()
    }

    /// Add a track, replacing any track with the same id
    pub fn add_track(&self, track: MediaTrack) {
        let mut tracks = self.inner.tracks.write();
        tracks.retain(|t| t.id != track.id);
        tracks.push(track);
    }

    #[must_use]
    pub fn has_video(&self) -> bool {
        self.inner.tracks.read().iter().any(|t| t.kind == TrackKind::Video)
    }

    /// Tell playback consumers this binding is gone
    pub fn release(&self) {
        self.inner.released.cancel();
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.inner.released.is_cancelled()
    }

    /// Resolves once the stream has been released
    pub async fn released(&self) {
        self.inner.released.cancelled().await;
    }

    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.inner.id)
            .field("tracks", &self.inner.tracks.read().len())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Decide which binding a received stream belongs to
///
/// An explicit tag from the sender wins. Without one the kind is inferred
/// from the tracks: any video means a screen share, audio only means voice.
/// Camera video sent without a tag is therefore indistinguishable from a
/// screen share.
#[must_use]
pub fn classify(stream: &MediaStream, tag: Option<MediaKind>) -> MediaKind {
    tag.unwrap_or_else(|| {
        if stream.has_video() {
            MediaKind::Screen
        } else {
            MediaKind::Audio
        }
    })
}
