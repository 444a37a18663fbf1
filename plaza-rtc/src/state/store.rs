use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use plaza_core::models::{MediaKind, ParticipantId};

use super::peer::{PeerState, PeerUpdate, Reaction};
use crate::media::MediaStream;

/// Immutable view of the store at one point in time
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    peers: HashMap<ParticipantId, PeerState>,
    bindings: HashMap<(ParticipantId, MediaKind), MediaStream>,
}

impl StoreSnapshot {
    #[must_use]
    pub fn get(&self, id: &ParticipantId) -> Option<&PeerState> {
        self.peers.get(id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerState> {
        self.peers.values()
    }

    #[must_use]
    pub fn stream(&self, id: &ParticipantId, kind: MediaKind) -> Option<&MediaStream> {
        self.bindings.get(&(id.clone(), kind))
    }

    #[must_use]
    pub fn has_any_binding(&self, id: &ParticipantId) -> bool {
        self.bindings.keys().any(|(peer, _)| peer == id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn unbind(&mut self, id: &ParticipantId, kind: MediaKind) -> bool {
        match self.bindings.remove(&(id.clone(), kind)) {
            Some(stream) => {
                stream.release();
                true
            }
            None => false,
        }
    }

    fn unbind_all(&mut self, id: &ParticipantId) -> usize {
        let kinds: Vec<MediaKind> = self
            .bindings
            .keys()
            .filter(|(peer, _)| peer == id)
            .map(|(_, kind)| *kind)
            .collect();
        for kind in &kinds {
            self.unbind(id, *kind);
        }
        kinds.len()
    }

    fn entry(&mut self, id: &ParticipantId) -> &mut PeerState {
        self.peers
            .entry(id.clone())
            .or_insert_with(|| PeerState::placeholder(id.clone()))
    }
}

/// Single source of truth for remote participant state and stream bindings
///
/// Writes come from the network event context only. Readers take cheap
/// snapshots; a write while a snapshot is alive copies the maps instead of
/// mutating what the reader sees.
#[derive(Debug, Clone, Default)]
pub struct PeerStateStore {
    inner: Arc<RwLock<Arc<StoreSnapshot>>>,
}

impl PeerStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state for rendering
    #[must_use]
    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        Arc::clone(&self.inner.read())
    }

    fn write<R>(&self, f: impl FnOnce(&mut StoreSnapshot) -> R) -> R {
        let mut guard = self.inner.write();
        f(Arc::make_mut(&mut guard))
    }

    /// Create a placeholder entry if none exists; returns whether one was created
    pub fn ensure(&self, id: &ParticipantId) -> bool {
        self.write(|s| {
            if s.peers.contains_key(id) {
                false
            } else {
                s.peers.insert(id.clone(), PeerState::placeholder(id.clone()));
                true
            }
        })
    }

    /// Merge a partial update into the peer's entry, creating it if needed
    pub fn upsert(&self, id: &ParticipantId, update: &PeerUpdate) {
        self.write(|s| s.entry(id).apply(update));
    }

    pub fn set_reaction(&self, id: &ParticipantId, reaction: Reaction) {
        self.write(|s| s.entry(id).set_reaction(reaction));
    }

    /// Record inbound activity without changing any field
    pub fn touch(&self, id: &ParticipantId) {
        self.write(|s| {
            if let Some(peer) = s.peers.get_mut(id) {
                peer.touch();
            }
        });
    }

    /// Delete the entry together with every stream bound to it
    pub fn remove(&self, id: &ParticipantId) -> Option<PeerState> {
        self.write(|s| {
            let released = s.unbind_all(id);
            let removed = s.peers.remove(id);
            if removed.is_some() || released > 0 {
                debug!(peer = %id, released, "Removed peer state");
            }
            removed
        })
    }

    #[must_use]
    pub fn get(&self, id: &ParticipantId) -> Option<PeerState> {
        self.inner.read().peers.get(id).cloned()
    }

    #[must_use]
    pub fn all(&self) -> Vec<PeerState> {
        self.inner.read().peers.values().cloned().collect()
    }

    #[must_use]
    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.inner.read().peers.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Bind a received stream, releasing whatever held the slot before
    ///
    /// A binding for an unknown peer creates its placeholder entry so the
    /// stream never exists without an owner.
    pub fn bind_stream(&self, id: &ParticipantId, kind: MediaKind, stream: MediaStream) {
        self.write(|s| {
            s.entry(id);
            if let Some(previous) = s.bindings.insert((id.clone(), kind), stream.clone()) {
                if !previous.same_as(&stream) {
                    previous.release();
                }
            }
        });
    }

    pub fn unbind_stream(&self, id: &ParticipantId, kind: MediaKind) -> bool {
        self.write(|s| s.unbind(id, kind))
    }

    pub fn unbind_all(&self, id: &ParticipantId) -> usize {
        self.write(|s| s.unbind_all(id))
    }

    #[must_use]
    pub fn stream(&self, id: &ParticipantId, kind: MediaKind) -> Option<MediaStream> {
        self.inner.read().stream(id, kind).cloned()
    }

    #[must_use]
    pub fn has_any_binding(&self, id: &ParticipantId) -> bool {
        self.inner.read().has_any_binding(id)
    }

    /// Local-only playback override; returns false when the peer is unknown
    pub fn set_muted_by_me(&self, id: &ParticipantId, muted: bool) -> bool {
        self.write(|s| match s.peers.get_mut(id) {
            Some(peer) => {
                peer.muted_by_me = muted;
                true
            }
            None => false,
        })
    }

    /// Peers with no inbound activity for longer than `timeout`
    #[must_use]
    pub fn stale_peers(&self, now: Instant, timeout: Duration) -> Vec<ParticipantId> {
        self.inner
            .read()
            .peers
            .values()
            .filter(|p| now.saturating_duration_since(p.last_seen) > timeout)
            .map(|p| p.id.clone())
            .collect()
    }

    /// Drop every entry and release every binding
    pub fn clear(&self) {
        self.write(|s| {
            for stream in s.bindings.values() {
                stream.release();
            }
            s.bindings.clear();
            s.peers.clear();
        });
    }
}
