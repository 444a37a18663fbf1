use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use plaza_core::models::ParticipantId;

use super::peer::Reaction;

#[derive(Debug, Clone)]
struct Shown {
    timestamp: i64,
    emoji: String,
    since: Instant,
}

/// Consumer-side reaction display state
///
/// The store keeps the last reaction forever; this decides whether it is new
/// (timestamp changed since last seen) and whether it is still on screen.
#[derive(Debug, Clone)]
pub struct ReactionTracker {
    window: Duration,
    shown: HashMap<ParticipantId, Shown>,
}

impl ReactionTracker {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            shown: HashMap::new(),
        }
    }

    /// Returns true if `reaction` has not been observed for this peer before
    pub fn observe(&mut self, id: &ParticipantId, reaction: &Reaction, now: Instant) -> bool {
        if self
            .shown
            .get(id)
            .is_some_and(|s| s.timestamp == reaction.timestamp)
        {
            return false;
        }
        self.shown.insert(
            id.clone(),
            Shown {
                timestamp: reaction.timestamp,
                emoji: reaction.emoji.clone(),
                since: now,
            },
        );
        true
    }

    /// Emoji to draw above the peer, if its display window is still open
    #[must_use]
    pub fn visible(&self, id: &ParticipantId, now: Instant) -> Option<&str> {
        self.shown
            .get(id)
            .filter(|s| now.saturating_duration_since(s.since) < self.window)
            .map(|s| s.emoji.as_str())
    }

    pub fn forget(&mut self, id: &ParticipantId) {
        self.shown.remove(id);
    }
}
