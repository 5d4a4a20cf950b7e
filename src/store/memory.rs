//! In-process counter store.
//!
//! Mirrors the Redis semantics the quota engine relies on (INCR keeps an
//! existing TTL, EXPIRE refreshes it, SET NX EX creates with a lease) behind
//! a single mutex, so every operation is atomic within the process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDateTime, TimeDelta};
use parking_lot::Mutex;

use super::{CounterStore, Increment};
use crate::clock::{Clock, SystemClock};
use crate::error::{RatekeeperError, Result};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<NaiveDateTime>,
}

impl StoredValue {
    fn is_live(&self, now: NaiveDateTime) -> bool {
        self.expires_at.map_or(true, |expires_at| now < expires_at)
    }
}

/// Counter store held in process memory.
pub struct MemoryCounterStore {
    entries: Mutex<HashMap<String, StoredValue>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCounterStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store whose expiries follow `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining TTL of a live key, if it has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        let entries = self.entries.lock();
        let entry = entries.get(key).filter(|entry| entry.is_live(now))?;
        entry
            .expires_at
            .and_then(|expires_at| (expires_at - now).to_std().ok())
    }

    fn expiry(now: NaiveDateTime, ttl: Duration) -> NaiveDateTime {
        TimeDelta::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(NaiveDateTime::MAX)
    }

    fn purge_expired(entries: &mut HashMap<String, StoredValue>, now: NaiveDateTime) {
        entries.retain(|_, entry| entry.is_live(now));
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        let entries = self.entries.lock();
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.lock().insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        Ok(entries
            .remove(key)
            .is_some_and(|entry| entry.is_live(now)))
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        Self::purge_expired(&mut entries, now);

        if entries.contains_key(key) {
            return Ok(false);
        }

        entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: Some(Self::expiry(now, ttl)),
            },
        );
        Ok(true)
    }

    async fn increment_all(&self, increments: &[Increment]) -> Result<()> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        Self::purge_expired(&mut entries, now);

        // Validate the whole batch before touching anything.
        for increment in increments {
            if let Some(entry) = entries.get(&increment.key) {
                entry.value.parse::<i64>().map_err(|error| {
                    RatekeeperError::BackingStore(format!(
                        "counter {} holds a non-integer value: {error}",
                        increment.key
                    ))
                })?;
            }
        }

        for increment in increments {
            let entry = entries
                .entry(increment.key.clone())
                .or_insert_with(|| StoredValue {
                    value: "0".to_string(),
                    expires_at: None,
                });
            let current = entry.value.parse::<i64>().unwrap_or(0);
            entry.value = (current + 1).to_string();
            if let Some(ttl) = increment.ttl {
                entry.expires_at = Some(Self::expiry(now, ttl));
            }
        }

        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        Self::purge_expired(&mut entries, now);

        match entries.get(key) {
            Some(entry) if entry.value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn store_type(&self) -> &'static str {
        "memory"
    }
}
