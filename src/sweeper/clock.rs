//! Wall-clock sources for the sweeper.

use chrono::{DateTime, Utc};

/// Supplies the current wall-clock time.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A wall clock that advances with tokio's timer.
///
/// Reads `start` at creation and then moves forward exactly as far as
/// `tokio::time::Instant` does, so a paused runtime (`start_paused`,
/// `tokio::time::advance`) drives wall-clock schedules deterministically.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    start: DateTime<Utc>,
    anchor: tokio::time::Instant,
}

impl TokioClock {
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            start,
            anchor: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = self.anchor.elapsed();
        match chrono::Duration::from_std(elapsed) {
            Ok(elapsed) => self.start + elapsed,
            Err(_) => self.start,
        }
    }
}
