//! Quota configuration for a rate-limited resource.
//!
//! The configuration is loaded once from the durable store, cached as JSON
//! in the shared counter store, and mutated in place as windows roll over.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::window::Window;
use crate::error::Result;
use crate::persistence::ServiceRecord;

/// Limits and last-reset instants for every window of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// The resource (provider) name
    pub resource_name: String,
    /// Maximum requests per window; zero or below means unbounded
    #[serde(default)]
    pub limits: BTreeMap<Window, i64>,
    /// The last instant each window's counter was zeroed
    #[serde(default)]
    pub reset_times: BTreeMap<Window, Option<NaiveDateTime>>,
}

impl QuotaConfig {
    /// Create a configuration with the given limits and no reset history.
    pub fn new(resource_name: impl Into<String>, limits: BTreeMap<Window, i64>) -> Self {
        Self {
            resource_name: resource_name.into(),
            limits,
            reset_times: Window::ALL.iter().map(|w| (*w, None)).collect(),
        }
    }

    /// Build the configuration from a persisted service record.
    pub fn from_record(record: &ServiceRecord) -> Self {
        Self {
            resource_name: record.name.clone(),
            limits: Window::ALL.iter().map(|w| (*w, record.limit(*w))).collect(),
            reset_times: Window::ALL
                .iter()
                .map(|w| (*w, record.last_reset(*w)))
                .collect(),
        }
    }

    /// Parse a cached JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize for caching in the counter store.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The limit for a window; missing windows are unbounded.
    pub fn limit(&self, window: Window) -> i64 {
        self.limits.get(&window).copied().unwrap_or(0)
    }

    /// Whether the window has a positive limit.
    pub fn is_enforced(&self, window: Window) -> bool {
        self.limit(window) > 0
    }

    /// Windows with a positive limit, shortest first.
    pub fn enforced_windows(&self) -> impl Iterator<Item = Window> + '_ {
        Window::ALL.into_iter().filter(|w| self.is_enforced(*w))
    }

    pub fn reset_time(&self, window: Window) -> Option<NaiveDateTime> {
        self.reset_times.get(&window).copied().flatten()
    }

    pub fn set_reset_time(&mut self, window: Window, instant: NaiveDateTime) {
        self.reset_times.insert(window, Some(instant));
    }
}
