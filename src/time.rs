//! Epoch-seconds decomposition and local-standard-time arithmetic.
//!
//! The scheduler stores everything in UTC epoch seconds. DAILY events are
//! expressed as an offset from local midnight, so a small amount of
//! local-time bookkeeping is needed to turn "07:30 local" into the next
//! absolute `next_trigger`. The awkward part is daylight saving time: the
//! configuration can ask for either the true local clock (DST observed) or
//! local *standard* time (DST ignored, as if the building's timeswitch never
//! moved), matching what the mechanical power controller this daemon talks
//! to actually does.

use chrono::{Datelike, Local, TimeZone};

use crate::clock::Clock;

pub const SECONDS_PER_MINUTE: i64 = 60;
pub const SECONDS_PER_HOUR: i64 = 60 * SECONDS_PER_MINUTE;
pub const SECONDS_PER_DAY: i64 = 24 * SECONDS_PER_HOUR;

/// Decompose a duration expressed in seconds into whole days.
pub fn days(total_secs: i64) -> i64 {
    total_secs.div_euclid(SECONDS_PER_DAY)
}

/// Hour-of-day component (0..24) of a duration expressed in seconds.
pub fn hours(total_secs: i64) -> i64 {
    total_secs.rem_euclid(SECONDS_PER_DAY) / SECONDS_PER_HOUR
}

/// Minute-of-hour component (0..60).
pub fn minutes(total_secs: i64) -> i64 {
    total_secs.rem_euclid(SECONDS_PER_HOUR) / SECONDS_PER_MINUTE
}

/// Second-of-minute component (0..60).
pub fn seconds(total_secs: i64) -> i64 {
    total_secs.rem_euclid(SECONDS_PER_MINUTE)
}

/// Format a duration the way the shutdown summary reports uptime:
/// `"3d 02:14:07"`.
pub fn format_duration(total_secs: i64) -> String {
    format!(
        "{}d {:02}:{:02}:{:02}",
        days(total_secs),
        hours(total_secs),
        minutes(total_secs),
        seconds(total_secs)
    )
}

/// A snapshot of "now", decomposed for schedule arithmetic.
#[derive(Debug, Clone, Copy)]
pub struct Today {
    /// Current time, UTC epoch seconds.
    pub utc_now: i64,
    /// UTC midnight on or before `utc_now`.
    pub utc_midnight: i64,
    /// Seconds elapsed since `utc_midnight`.
    pub utc_offset: i64,
    /// Offset, in seconds east of UTC, of the zone this host is configured
    /// in, taking `apply_dst` into account: if DST is in effect right now
    /// but `apply_dst` is false, this is the *standard* offset rather than
    /// the currently-active one.
    pub local_utc_offset: i64,
    /// Whether daylight saving time is in effect for the real local clock,
    /// independent of `apply_dst`.
    pub dst_in_effect: bool,
}

impl Today {
    pub fn new(clock: &dyn Clock, apply_dst: bool) -> Self {
        let now = clock.now();
        let utc_now = now.timestamp();
        let utc_midnight = utc_now - utc_now.rem_euclid(SECONDS_PER_DAY);
        let utc_offset = utc_now - utc_midnight;

        let year = now.year();
        let jan_offset = Local
            .with_ymd_and_hms(year, 1, 15, 12, 0, 0)
            .single()
            .map(|d| d.offset().local_minus_utc() as i64)
            .unwrap_or(0);
        let jul_offset = Local
            .with_ymd_and_hms(year, 7, 15, 12, 0, 0)
            .single()
            .map(|d| d.offset().local_minus_utc() as i64)
            .unwrap_or(0);
        let standard_offset = jan_offset.min(jul_offset);
        let dst_offset = jan_offset.max(jul_offset);

        let current_offset = Local.from_utc_datetime(&now.naive_utc()).offset().local_minus_utc() as i64;
        let dst_in_effect = dst_offset != standard_offset && current_offset == dst_offset;

        let local_utc_offset = if dst_in_effect && !apply_dst {
            standard_offset
        } else {
            current_offset
        };

        Self {
            utc_now,
            utc_midnight,
            utc_offset,
            local_utc_offset,
            dst_in_effect,
        }
    }

    /// Seconds since local midnight, honoring the requested DST policy.
    pub fn local_offset(&self) -> i64 {
        (self.utc_offset + self.local_utc_offset).rem_euclid(SECONDS_PER_DAY)
    }

    /// Absolute UTC instant of local midnight, honoring the requested DST
    /// policy.
    pub fn local_midnight_utc(&self) -> i64 {
        self.utc_now - self.local_offset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decomposes_seconds() {
        let t = 2 * SECONDS_PER_DAY + 3 * SECONDS_PER_HOUR + 14 * SECONDS_PER_MINUTE + 7;
        assert_eq!(days(t), 2);
        assert_eq!(hours(t), 3);
        assert_eq!(minutes(t), 14);
        assert_eq!(seconds(t), 7);
    }

    #[test]
    fn format_matches_uptime_style() {
        let t = SECONDS_PER_DAY + SECONDS_PER_HOUR * 2 + SECONDS_PER_MINUTE * 3 + 4;
        assert_eq!(format_duration(t), "1d 02:03:04");
    }

    #[test]
    fn negative_inputs_wrap_rather_than_panic() {
        assert_eq!(hours(-1), 23);
        assert_eq!(minutes(-1), 59);
        assert_eq!(seconds(-1), 59);
    }
}
