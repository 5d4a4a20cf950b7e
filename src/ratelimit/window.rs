//! Quota accounting windows and their calendar boundaries.

use std::fmt;
use std::time::Duration;

use chrono::{Datelike, Days, Months, NaiveDateTime, NaiveTime, TimeDelta, Timelike};
use serde::{Deserialize, Serialize};

/// Time window for quota accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Window {
    /// Per-minute quota
    Minute,
    /// Per-hour quota
    Hour,
    /// Per-day quota
    Day,
    /// Per-month quota
    Month,
}

impl Window {
    /// All windows, shortest first.
    pub const ALL: [Window; 4] = [Window::Minute, Window::Hour, Window::Day, Window::Month];

    /// Lowercase name used in counter keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Window::Minute => "minute",
            Window::Hour => "hour",
            Window::Day => "day",
            Window::Month => "month",
        }
    }

    /// TTL applied to this window's counter key.
    ///
    /// A month is accounted as 30 days.
    pub fn ttl(&self) -> Duration {
        match self {
            Window::Minute => Duration::from_secs(60),
            Window::Hour => Duration::from_secs(3_600),
            Window::Day => Duration::from_secs(86_400),
            Window::Month => Duration::from_secs(2_592_000),
        }
    }

    /// The first boundary of this window strictly after `from`.
    ///
    /// Minutes roll over at second zero, hours at minute zero, days at UTC
    /// midnight and months at midnight on the 1st of the next month.
    pub fn next_reset(&self, from: NaiveDateTime) -> NaiveDateTime {
        let midnight = from.date().and_time(NaiveTime::MIN);
        match self {
            Window::Minute => {
                let minutes = i64::from(from.hour()) * 60 + i64::from(from.minute()) + 1;
                midnight + TimeDelta::minutes(minutes)
            }
            Window::Hour => midnight + TimeDelta::hours(i64::from(from.hour()) + 1),
            Window::Day => midnight + TimeDelta::days(1),
            Window::Month => {
                let first_of_month = from.date() - Days::new(u64::from(from.day0()));
                (first_of_month + Months::new(1)).and_time(NaiveTime::MIN)
            }
        }
    }

    /// Time left from `now` until the next boundary of this window.
    pub fn duration_until_reset(&self, now: NaiveDateTime) -> Duration {
        (self.next_reset(now) - now).to_std().unwrap_or(Duration::ZERO)
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
