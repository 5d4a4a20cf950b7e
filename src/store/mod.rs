//! Shared counter store backends.
//!
//! This module provides the cross-process key/value store that holds
//! short-term quota counters and lock records:
//!
//! - **Redis**: authoritative store shared by every worker process
//! - **Memory**: single-process store for tests and local runs

mod memory;
mod redis_store;

pub use memory::MemoryCounterStore;
pub use redis_store::RedisCounterStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{RatekeeperError, Result};

/// One increment inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Increment {
    /// Counter key
    pub key: String,
    /// TTL refreshed after the increment; `None` leaves the key's expiry alone
    pub ttl: Option<Duration>,
}

impl Increment {
    /// An increment that refreshes the key's TTL.
    pub fn expiring(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            ttl: Some(ttl),
        }
    }

    /// An increment on a key that never expires.
    pub fn persistent(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ttl: None,
        }
    }
}

/// Primitive operations the quota engine needs from the shared store.
///
/// Cross-process correctness rests on two of them: `increment_all` must
/// apply every increment in one indivisible step, and `delete_if_equals`
/// must compare and delete atomically.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read a raw value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value without expiry.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a key, returning whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Create the key with a TTL only if it does not exist.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Apply every increment (and TTL refresh) as one atomic batch.
    async fn increment_all(&self, increments: &[Increment]) -> Result<()>;

    /// Delete the key only if it currently holds `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool>;

    /// Read an integer counter; missing keys count as zero.
    async fn get_count(&self, key: &str) -> Result<i64> {
        match self.get(key).await? {
            Some(raw) => raw.trim().parse::<i64>().map_err(|error| {
                RatekeeperError::BackingStore(format!(
                    "counter {key} holds a non-integer value: {error}"
                ))
            }),
            None => Ok(0),
        }
    }

    /// Store type name for logging.
    fn store_type(&self) -> &'static str;
}
