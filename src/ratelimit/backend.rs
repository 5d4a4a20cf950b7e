//! Quota gate trait for abstracting over admission sources.

use std::time::Duration;

use async_trait::async_trait;

use super::limiter::RateLimiter;

/// Anything that can admit or refuse one unit of work against a quota.
///
/// Batch orchestration only depends on this trait, so it can run against a
/// real `RateLimiter` or a scripted gate in tests.
#[async_trait]
pub trait QuotaGate: Send + Sync {
    /// Name of the guarded resource.
    fn resource(&self) -> &str;

    /// Wait up to `timeout` for admission. `None` means try once.
    async fn acquire(&self, timeout: Option<Duration>) -> bool;
}

#[async_trait]
impl QuotaGate for RateLimiter {
    fn resource(&self) -> &str {
        RateLimiter::resource(self)
    }

    async fn acquire(&self, timeout: Option<Duration>) -> bool {
        RateLimiter::acquire(self, timeout).await
    }
}
