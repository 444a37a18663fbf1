use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::state::LocalState;
use crate::transport::Transport;

/// Throttles local state samples down to the network send rate
///
/// Samples arriving before the interval has elapsed are dropped, not queued:
/// the next accepted sample carries the newest state anyway. The broadcaster
/// does not know how many peers exist; fan-out is the transport's job.
pub struct LocalStateBroadcaster {
    transport: Arc<dyn Transport>,
    interval: Duration,
    last_sent: Option<Instant>,
    latest: Option<LocalState>,
    sent: u64,
}

impl LocalStateBroadcaster {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, interval: Duration) -> Self {
        Self {
            transport,
            interval,
            last_sent: None,
            latest: None,
            sent: 0,
        }
    }

    /// Offer a sample; returns whether it went out
    ///
    /// `force` skips the interval check for this one call and restarts the
    /// interval as a normal send would.
    pub fn sample(&mut self, state: &LocalState, force: bool) -> bool {
        self.latest = Some(state.clone());

        let now = Instant::now();
        if !force && !self.is_due(now) {
            trace!("Dropping local state sample inside broadcast interval");
            return false;
        }
        self.send_latest(now)
    }

    /// Re-send the most recent sample immediately, e.g. when a peer joins
    pub fn force_resend(&mut self) -> bool {
        if self.latest.is_none() {
            return false;
        }
        self.send_latest(Instant::now())
    }

    /// Re-send the most recent sample if nothing went out for `idle`
    pub fn keepalive(&mut self, idle: Duration) -> bool {
        let now = Instant::now();
        let quiet = self
            .last_sent
            .is_none_or(|last| now.saturating_duration_since(last) >= idle);
        if quiet && self.latest.is_some() {
            self.send_latest(now)
        } else {
            false
        }
    }

    #[must_use]
    pub const fn sent(&self) -> u64 {
        self.sent
    }

    fn is_due(&self, now: Instant) -> bool {
        self.last_sent
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval)
    }

    fn send_latest(&mut self, now: Instant) -> bool {
        let Some(state) = &self.latest else {
            return false;
        };
        match self.transport.send_update(&state.packet()) {
            Ok(()) => {
                self.last_sent = Some(now);
                self.sent += 1;
                true
            }
            Err(e) => {
                debug!(error = %e, "Local state broadcast failed");
                false
            }
        }
    }
}
