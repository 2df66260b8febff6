//! Per-origin admission control.

mod action;
mod counter;
mod limiter;

pub use action::{ActionClass, RateLimits};
pub use counter::WindowCounter;
pub use limiter::{RateLimiter, DEFAULT_RECLAIM_AFTER_WINDOWS};
