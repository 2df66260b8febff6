//! Lifecycle sweeper: ages out ingested commands and wipes the pool daily.

mod clock;
mod schedule;

pub use clock::{Clock, SystemClock, TokioClock};
pub use schedule::ResetBoundary;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::SweeperConfig;
use crate::error::{PoolError, Result};
use crate::store::{Source, TokenStore};

/// Counters describing what the sweeper has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Completed age sweeps
    pub age_sweeps: u64,
    /// Completed full resets
    pub resets: u64,
    /// Rows deleted by either schedule
    pub rows_deleted: u64,
    /// Sweeps that reported an error
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    age_sweeps: AtomicU64,
    resets: AtomicU64,
    rows_deleted: AtomicU64,
    failures: AtomicU64,
}

/// Deletes stale crawler commands on an interval and every command at a
/// daily wall-clock boundary.
pub struct Sweeper<S: TokenStore> {
    store: Arc<S>,
    config: SweeperConfig,
    boundary: ResetBoundary,
    clock: Arc<dyn Clock>,
    counters: Counters,
}

impl<S: TokenStore> Sweeper<S> {
    pub fn new(store: Arc<S>, config: SweeperConfig) -> Result<Self> {
        let boundary = ResetBoundary::new(config.reset_hour, config.reset_utc_offset_minutes)?;
        Ok(Self {
            store,
            config,
            boundary,
            clock: Arc::new(SystemClock),
            counters: Counters::default(),
        })
    }

    /// Read wall-clock time from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Delete crawler commands older than the retention window.
    pub async fn sweep_aged(&self) -> Result<u64> {
        let retention = chrono::Duration::from_std(self.config.crawler_retention())
            .map_err(|e| PoolError::Config(e.to_string()))?;
        let cutoff = self.clock.now() - retention;

        match self.store.delete_created_before(Source::Crawler, cutoff).await {
            Ok(deleted) => {
                self.counters.age_sweeps.fetch_add(1, Ordering::Relaxed);
                self.counters.rows_deleted.fetch_add(deleted, Ordering::Relaxed);
                info!(deleted = deleted, cutoff = %cutoff, "Swept aged crawler commands");
                Ok(deleted)
            }
            Err(err) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                let err = PoolError::from(err);
                error!(error = %err, "Age sweep failed");
                Err(err)
            }
        }
    }

    /// Delete every command.
    pub async fn reset_pool(&self) -> Result<u64> {
        match self.store.delete_all().await {
            Ok(deleted) => {
                self.counters.resets.fetch_add(1, Ordering::Relaxed);
                self.counters.rows_deleted.fetch_add(deleted, Ordering::Relaxed);
                info!(deleted = deleted, "Reset command pool");
                Ok(deleted)
            }
            Err(err) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                let err = PoolError::from(err);
                error!(error = %err, "Pool reset failed");
                Err(err)
            }
        }
    }

    /// The next daily reset after the current time.
    pub fn next_reset(&self) -> DateTime<Utc> {
        self.boundary.next_after(self.clock.now())
    }

    pub fn stats(&self) -> SweepStats {
        SweepStats {
            age_sweeps: self.counters.age_sweeps.load(Ordering::Relaxed),
            resets: self.counters.resets.load(Ordering::Relaxed),
            rows_deleted: self.counters.rows_deleted.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Start the age sweep and, if enabled, the daily reset until `cancel` fires.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(2);

        let sweeper = Arc::clone(self);
        let token = cancel.clone();
        handles.push(tokio::spawn(async move {
            sweeper.run_age_sweeps(token).await;
        }));

        if self.config.daily_reset {
            let sweeper = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                sweeper.run_daily_resets(cancel).await;
            }));
        }

        handles
    }

    /// Sweep after the startup delay, then once per interval.
    pub async fn run_age_sweeps(&self, cancel: CancellationToken) {
        info!(
            every = ?self.config.age_sweep_interval(),
            retention = ?self.config.crawler_retention(),
            "Starting age sweep"
        );

        let delay = self.config.startup_delay();
        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => { return; }
            }
        }

        let mut tick = tokio::time::interval(self.config.age_sweep_interval());
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    // Failures are counted and logged; the next tick retries what is left
                    let _ = self.sweep_aged().await;
                }
                _ = cancel.cancelled() => {
                    break;
                }
            }
        }

        info!("Age sweep stopped");
    }

    /// Sleep until each boundary, reset, and recompute the next boundary.
    pub async fn run_daily_resets(&self, cancel: CancellationToken) {
        let mut after = self.clock.now();

        loop {
            let now = self.clock.now();
            let next = self.boundary.next_after(after.max(now));
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

            info!(
                next = %next,
                hours = wait.as_secs_f64() / 3600.0,
                "Scheduled next pool reset"
            );

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => { break; }
            }

            debug!(boundary = %next, "Running pool reset");
            let _ = self.reset_pool().await;

            // Never fire twice for one boundary, even if the timer woke early
            after = next;
        }

        info!("Daily reset stopped");
    }
}
