//! Records exchanged with the durable configuration store.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::ratelimit::Window;

/// A provider row as persisted by the configuration store.
///
/// Limits of zero or below are not enforced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Unique provider name
    pub name: String,

    /// Overrides the provider's configured base URL
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Per-request HTTP timeout override, in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Inactive providers refuse to start
    #[serde(default = "default_is_active")]
    pub is_active: bool,

    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: i64,
    #[serde(default = "default_requests_per_hour")]
    pub requests_per_hour: i64,
    #[serde(default = "default_requests_per_day")]
    pub requests_per_day: i64,
    #[serde(default = "default_requests_per_month")]
    pub requests_per_month: i64,

    #[serde(default)]
    pub last_minute_reset: Option<NaiveDateTime>,
    #[serde(default)]
    pub last_hour_reset: Option<NaiveDateTime>,
    #[serde(default)]
    pub last_day_reset: Option<NaiveDateTime>,
    #[serde(default)]
    pub last_month_reset: Option<NaiveDateTime>,

    #[serde(default)]
    pub minute_counter: i64,
    #[serde(default)]
    pub hour_counter: i64,
    #[serde(default)]
    pub day_counter: i64,
    #[serde(default)]
    pub month_counter: i64,
    #[serde(default)]
    pub total_requests: i64,
}

fn default_is_active() -> bool {
    true
}

fn default_requests_per_minute() -> i64 {
    30
}

fn default_requests_per_hour() -> i64 {
    1000
}

fn default_requests_per_day() -> i64 {
    10000
}

fn default_requests_per_month() -> i64 {
    30000
}

impl ServiceRecord {
    /// Create a record with the given limits and no history.
    pub fn new(name: impl Into<String>, minute: i64, hour: i64, day: i64, month: i64) -> Self {
        Self {
            name: name.into(),
            base_url: None,
            api_key: None,
            timeout_secs: None,
            is_active: true,
            requests_per_minute: minute,
            requests_per_hour: hour,
            requests_per_day: day,
            requests_per_month: month,
            last_minute_reset: None,
            last_hour_reset: None,
            last_day_reset: None,
            last_month_reset: None,
            minute_counter: 0,
            hour_counter: 0,
            day_counter: 0,
            month_counter: 0,
            total_requests: 0,
        }
    }

    /// The configured limit for a window.
    pub fn limit(&self, window: Window) -> i64 {
        match window {
            Window::Minute => self.requests_per_minute,
            Window::Hour => self.requests_per_hour,
            Window::Day => self.requests_per_day,
            Window::Month => self.requests_per_month,
        }
    }

    /// When the window's counter was last zeroed.
    pub fn last_reset(&self, window: Window) -> Option<NaiveDateTime> {
        match window {
            Window::Minute => self.last_minute_reset,
            Window::Hour => self.last_hour_reset,
            Window::Day => self.last_day_reset,
            Window::Month => self.last_month_reset,
        }
    }

    /// Copy a counter snapshot onto this record.
    pub fn apply_snapshot(&mut self, snapshot: &CounterSnapshot) {
        let count = |window: Window| snapshot.counts.get(&window).copied().unwrap_or(0);
        self.minute_counter = count(Window::Minute);
        self.hour_counter = count(Window::Hour);
        self.day_counter = count(Window::Day);
        self.month_counter = count(Window::Month);
        self.total_requests = snapshot.total;

        for (window, reset) in &snapshot.reset_times {
            let Some(reset) = *reset else { continue };
            let slot = match window {
                Window::Minute => &mut self.last_minute_reset,
                Window::Hour => &mut self.last_hour_reset,
                Window::Day => &mut self.last_day_reset,
                Window::Month => &mut self.last_month_reset,
            };
            *slot = Some(reset);
        }
    }
}

/// Live counters copied out of the shared store for durability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    /// Per-window counts
    pub counts: BTreeMap<Window, i64>,
    /// Lifetime request total
    pub total: i64,
    /// Last reset per window at the time of the snapshot
    pub reset_times: BTreeMap<Window, Option<NaiveDateTime>>,
    /// When the snapshot was taken
    pub taken_at: NaiveDateTime,
}

/// One outbound provider request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestLog {
    pub service_name: String,
    pub endpoint: String,
    pub method: String,
    /// Absent when the request never produced a response
    pub status_code: Option<u16>,
    pub response_time_secs: f64,
    pub was_successful: bool,
    pub error_message: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    pub created_at: NaiveDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_service_record_defaults_from_yaml() {
        let yaml = "name: coingecko\n";
        let record: ServiceRecord = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(record.limit(Window::Minute), 30);
        assert_eq!(record.limit(Window::Hour), 1000);
        assert_eq!(record.limit(Window::Day), 10000);
        assert_eq!(record.limit(Window::Month), 30000);
        assert_eq!(record.last_reset(Window::Day), None);
        assert!(record.is_active);
        assert_eq!(record.base_url, None);
    }

    #[test]
    fn test_apply_snapshot_keeps_missing_reset_times() {
        let earlier = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let later = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();

        let mut record = ServiceRecord::new("svc", 1, 2, 3, 4);
        record.last_month_reset = Some(earlier);

        let snapshot = CounterSnapshot {
            counts: BTreeMap::from([(Window::Minute, 1), (Window::Day, 7)]),
            total: 42,
            reset_times: BTreeMap::from([(Window::Day, Some(later)), (Window::Month, None)]),
            taken_at: later,
        };
        record.apply_snapshot(&snapshot);

        assert_eq!(record.minute_counter, 1);
        assert_eq!(record.hour_counter, 0);
        assert_eq!(record.day_counter, 7);
        assert_eq!(record.total_requests, 42);
        assert_eq!(record.last_day_reset, Some(later));
        assert_eq!(record.last_month_reset, Some(earlier));
    }
}
