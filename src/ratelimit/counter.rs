//! Fixed-window request counter.

use std::time::Duration;
use tokio::time::Instant;

/// Tracks requests from one origin within a fixed time window.
///
/// The window starts on the first request and restarts on the first request
/// seen after it has elapsed. A burst of up to twice the limit is possible
/// across a window boundary.
#[derive(Debug, Clone)]
pub struct WindowCounter {
    /// Requests admitted in the current window
    count: u64,
    /// When the current window ends
    reset_at: Instant,
}

impl WindowCounter {
    /// Open a fresh window at `now`.
    pub fn new(now: Instant, window: Duration) -> Self {
        Self {
            count: 0,
            reset_at: now + window,
        }
    }

    /// Count one request against `limit`.
    ///
    /// Returns `true` if the request is admitted, `false` if the window is full.
    /// A rejected request does not change the count.
    pub fn admit(&mut self, now: Instant, limit: u64, window: Duration) -> bool {
        self.maybe_reset_window(now, window);

        if self.count >= limit {
            return false;
        }

        self.count += 1;
        true
    }

    /// Get the current count.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// When the current window ends.
    pub fn reset_at(&self) -> Instant {
        self.reset_at
    }

    /// Get the duration until the current window resets.
    pub fn duration_until_reset(&self, now: Instant) -> Duration {
        self.reset_at.saturating_duration_since(now)
    }

    /// Whether the window ended more than `grace` ago.
    pub fn is_idle(&self, now: Instant, grace: Duration) -> bool {
        now > self.reset_at + grace
    }

    fn maybe_reset_window(&mut self, now: Instant, window: Duration) {
        if now > self.reset_at {
            self.count = 0;
            self.reset_at = now + window;
        }
    }
}
