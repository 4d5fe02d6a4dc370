//! Wall-clock alignment for the crawl cadence and the post-midnight grace window.

use chrono::{DateTime, NaiveDate, TimeZone, Timelike};
use std::time::Duration;

/// Longest the scheduler sleeps between ticks.
pub const IDLE_POLL: Duration = Duration::from_secs(30);

/// Seconds until the next instant whose minute is a multiple of
/// `interval_minutes` and whose second is zero; zero when already on one.
pub fn seconds_until_next_boundary<T: Timelike>(now: &T, interval_minutes: u32) -> Duration {
    let interval = interval_minutes.max(1);
    let past_boundary = now.minute() % interval;
    if past_boundary == 0 && now.second() == 0 && now.nanosecond() == 0 {
        return Duration::ZERO;
    }

    let into_interval = Duration::from_secs(u64::from(past_boundary * 60 + now.second()))
        + Duration::from_nanos(u64::from(now.nanosecond().min(999_999_999)));
    Duration::from_secs(u64::from(interval * 60)).saturating_sub(into_interval)
}

/// How long the loop naps before the next tick: never longer than
/// [`IDLE_POLL`], never shorter than a second.
pub fn nap_duration<T: Timelike>(now: &T, interval_minutes: u32) -> Duration {
    seconds_until_next_boundary(now, interval_minutes).clamp(Duration::from_secs(1), IDLE_POLL)
}

/// Identity of one crawl interval. The date keeps a restart-free process
/// from confusing slot 0 of today with slot 0 of yesterday.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CrawlSlot {
    pub date: NaiveDate,
    pub index: u32,
}

impl CrawlSlot {
    pub fn containing<Tz: TimeZone>(now: &DateTime<Tz>, interval_minutes: u32) -> Self {
        CrawlSlot {
            date: now.date_naive(),
            index: (now.hour() * 60 + now.minute()) / interval_minutes.max(1),
        }
    }
}

/// True during the first `grace_minutes` after local midnight.
pub fn in_grace_window<T: Timelike>(now: &T, grace_minutes: u32) -> bool {
    now.hour() == 0 && now.minute() < grace_minutes
}
