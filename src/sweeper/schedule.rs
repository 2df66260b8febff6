//! Wall-clock boundary for the daily reset.

use chrono::{DateTime, Days, FixedOffset, Local, NaiveTime, TimeZone, Utc};

use crate::error::{PoolError, Result};

/// A time of day, in local time or at a fixed UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetBoundary {
    time: NaiveTime,
    offset: Option<FixedOffset>,
}

impl ResetBoundary {
    /// `hour`:00 at `offset_minutes` east of UTC, or local time when `None`.
    pub fn new(hour: u32, offset_minutes: Option<i32>) -> Result<Self> {
        let time = NaiveTime::from_hms_opt(hour, 0, 0)
            .ok_or_else(|| PoolError::Config(format!("invalid reset hour {}", hour)))?;

        let offset = match offset_minutes {
            Some(minutes) => Some(FixedOffset::east_opt(minutes * 60).ok_or_else(|| {
                PoolError::Config(format!("invalid UTC offset {} minutes", minutes))
            })?),
            None => None,
        };

        Ok(Self { time, offset })
    }

    /// Local midnight.
    pub fn local_midnight() -> Self {
        Self {
            time: NaiveTime::MIN,
            offset: None,
        }
    }

    /// The first boundary strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.offset {
            Some(offset) => next_in(&now.with_timezone(&offset), self.time),
            None => next_in(&now.with_timezone(&Local), self.time),
        }
    }
}

fn next_in<Tz: TimeZone>(now: &DateTime<Tz>, time: NaiveTime) -> DateTime<Utc> {
    let now_utc = now.with_timezone(&Utc);
    let zone = now.timezone();
    let mut date = now.date_naive();

    // Today, tomorrow, or the day after when a DST gap swallows tomorrow's boundary
    for _ in 0..3 {
        if let Some(candidate) = zone.from_local_datetime(&date.and_time(time)).earliest() {
            let candidate = candidate.with_timezone(&Utc);
            if candidate > now_utc {
                return candidate;
            }
        }
        match date.checked_add_days(Days::new(1)) {
            Some(next) => date = next,
            None => break,
        }
    }

    now_utc + chrono::Duration::days(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    #[test]
    fn test_next_midnight_utc() {
        let boundary = ResetBoundary::new(0, Some(0)).unwrap();

        assert_eq!(
            boundary.next_after(utc(2026, 10, 16, 23, 59, 0)),
            utc(2026, 10, 17, 0, 0, 0)
        );
        assert_eq!(
            boundary.next_after(utc(2026, 10, 16, 0, 0, 1)),
            utc(2026, 10, 17, 0, 0, 0)
        );
    }

    #[test]
    fn test_boundary_is_strictly_after_now() {
        let boundary = ResetBoundary::new(0, Some(0)).unwrap();
        let midnight = utc(2026, 10, 17, 0, 0, 0);

        assert_eq!(boundary.next_after(midnight), utc(2026, 10, 18, 0, 0, 0));
    }

    #[test]
    fn test_boundary_at_fixed_offset() {
        // 04:00 at UTC+8 is 20:00 UTC the previous day
        let boundary = ResetBoundary::new(4, Some(8 * 60)).unwrap();

        assert_eq!(
            boundary.next_after(utc(2026, 10, 16, 12, 0, 0)),
            utc(2026, 10, 16, 20, 0, 0)
        );
        assert_eq!(
            boundary.next_after(utc(2026, 10, 16, 21, 0, 0)),
            utc(2026, 10, 17, 20, 0, 0)
        );
    }

    #[test]
    fn test_local_midnight_is_within_a_day() {
        let now = Utc::now();
        let next = ResetBoundary::local_midnight().next_after(now);

        assert!(next > now);
        assert!(next - now <= chrono::Duration::hours(25));
    }

    #[test]
    fn test_invalid_settings_rejected() {
        assert!(ResetBoundary::new(24, None).is_err());
        assert!(ResetBoundary::new(0, Some(24 * 60)).is_err());
    }
}
