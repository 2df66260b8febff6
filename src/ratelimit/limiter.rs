//! Per-origin fixed-window rate limiter.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::action::ActionClass;
use super::counter::WindowCounter;
use crate::config::LimitConfig;

/// Default number of windows an idle origin record is kept after its reset time.
pub const DEFAULT_RECLAIM_AFTER_WINDOWS: u32 = 5;

/// A rate limiter for one action class, keyed by client origin.
///
/// Counters live in a sharded map: the check-and-increment for one origin runs
/// under that entry's exclusive guard, so requests from unrelated origins do
/// not serialize on a single lock.
pub struct RateLimiter {
    /// The action class this instance bounds
    action: ActionClass,
    /// Requests admitted per window
    limit: u64,
    /// Window length
    window: Duration,
    /// How long past its reset time an origin record survives reclamation
    grace: Duration,
    /// Window counters indexed by origin
    records: DashMap<String, WindowCounter>,
}

impl RateLimiter {
    /// Create a limiter admitting `config.limit` requests per origin per window.
    pub fn new(action: ActionClass, config: LimitConfig) -> Self {
        let window = config.window();
        Self {
            action,
            limit: config.limit,
            window,
            grace: window * DEFAULT_RECLAIM_AFTER_WINDOWS,
            records: DashMap::new(),
        }
    }

    /// Keep idle origin records for `windows` window lengths past their reset time.
    pub fn with_reclaim_after(mut self, windows: u32) -> Self {
        self.grace = self.window * windows;
        self
    }

    /// Check-and-count one request from `origin`.
    ///
    /// Returns `true` if the request is admitted, `false` if the origin has
    /// used up its window.
    pub fn allow(&self, origin: &str) -> bool {
        let now = Instant::now();

        let admitted = match self.records.get_mut(origin) {
            Some(mut counter) => counter.admit(now, self.limit, self.window),
            None => {
                let mut counter = self
                    .records
                    .entry(origin.to_string())
                    .or_insert_with(|| WindowCounter::new(now, self.window));
                counter.admit(now, self.limit, self.window)
            }
        };

        trace!(
            action = %self.action,
            origin = %origin,
            admitted = admitted,
            "Checked rate limit"
        );

        if !admitted {
            debug!(
                action = %self.action,
                origin = %origin,
                limit = self.limit,
                "Rate limit exceeded"
            );
        }

        admitted
    }

    /// Time until `origin`'s current window resets, if it has one.
    pub fn retry_after(&self, origin: &str) -> Option<Duration> {
        let now = Instant::now();
        self.records
            .get(origin)
            .map(|counter| counter.duration_until_reset(now))
    }

    /// Requests counted for `origin` in its current window.
    pub fn current_count(&self, origin: &str) -> Option<u64> {
        self.records.get(origin).map(|counter| counter.count())
    }

    /// Remove origin records whose window ended more than the grace period ago.
    ///
    /// Returns the number of records removed.
    pub fn reclaim(&self) -> usize {
        let now = Instant::now();
        let before = self.records.len();
        self.records
            .retain(|_, counter| !counter.is_idle(now, self.grace));
        let removed = before.saturating_sub(self.records.len());

        if removed > 0 {
            debug!(action = %self.action, removed = removed, "Reclaimed idle origins");
        }

        removed
    }

    /// Run [`reclaim`](Self::reclaim) once per window until `cancel` fires.
    pub fn spawn_reclaimer(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                action = %limiter.action,
                every = ?limiter.window,
                grace = ?limiter.grace,
                "Starting origin reclaimer"
            );

            let mut tick = tokio::time::interval_at(Instant::now() + limiter.window, limiter.window);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        limiter.reclaim();
                    }
                    _ = cancel.cancelled() => {
                        break;
                    }
                }
            }

            info!(action = %limiter.action, "Origin reclaimer stopped");
        })
    }

    /// The action class this instance bounds.
    pub fn action(&self) -> ActionClass {
        self.action
    }

    /// Get the limit for this limiter.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Get the window length for this limiter.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Get the number of tracked origins.
    pub fn origin_count(&self) -> usize {
        self.records.len()
    }

    /// Clear all counters.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.records.clear();
    }
}
