//! Core rate limiter implementation.
//!
//! A `RateLimiter` guards one resource (provider) with up to four windows
//! (minute, hour, day, month). Counters live in the shared counter store so
//! every worker process sees the same budget. Each admission first repairs
//! rolled-over windows, then checks every enforced window, and only when none
//! is saturated applies a single atomic batch of increments.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use chrono::NaiveDateTime;
use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::keys::QuotaKeys;
use super::quota::QuotaConfig;
use super::sync::{SyncJob, UsageSyncer};
use super::window::Window;
use crate::backends::Backends;
use crate::error::{RatekeeperError, Result};
use crate::persistence::CounterSnapshot;
use crate::store::Increment;

/// Default denominator of the durability sync probability.
pub const DEFAULT_SYNC_INTERVAL: u32 = 100;
/// Longest single sleep while waiting for admission.
const MAX_BACKOFF: Duration = Duration::from_secs(1);
/// Retry hint reported when the counter store fails.
const STORE_ERROR_RETRY: Duration = Duration::from_secs(1);

/// Tuning for a [`RateLimiter`].
#[derive(Debug, Clone)]
pub struct RateLimiterOptions {
    /// Sync counters on one admission in `sync_interval`; zero disables
    pub sync_interval: u32,
    /// Capacity of the background sync queue
    pub sync_queue_capacity: usize,
}

impl Default for RateLimiterOptions {
    fn default() -> Self {
        Self {
            sync_interval: DEFAULT_SYNC_INTERVAL,
            sync_queue_capacity: 16,
        }
    }
}

/// Outcome of a single admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// One unit of quota was consumed
    Granted,
    /// Some window is saturated; retry after `wait`
    Denied { wait: Duration },
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted)
    }
}

/// Observed usage of one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowUsage {
    pub used: i64,
    pub limit: i64,
    pub remaining: i64,
    /// Share of the limit consumed, 0 for unbounded windows
    pub utilization_percent: f64,
}

/// Distributed multi-window rate limiter for one resource.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter {
    resource: String,
    keys: QuotaKeys,
    backends: Backends,
    /// Local view of the quota configuration
    config: RwLock<QuotaConfig>,
    /// Serializes check-then-increment within this process
    admission: tokio::sync::Mutex<()>,
    syncer: UsageSyncer,
    sync_interval: u32,
}

impl RateLimiter {
    /// Create a limiter, resolving its configuration from the counter store
    /// cache or, on a miss, from the config store.
    ///
    /// Fails with `ConfigNotFound` when the resource is not configured and
    /// with `BackingStore` when configuration cannot be read.
    pub async fn new(
        resource: impl Into<String>,
        backends: Backends,
        options: RateLimiterOptions,
    ) -> Result<Self> {
        let resource = resource.into();
        let keys = QuotaKeys::new(&resource);
        let config = Self::load_config(&resource, &keys, &backends).await?;
        let syncer = UsageSyncer::spawn(&backends, options.sync_queue_capacity);

        info!(
            resource = %resource,
            limits = ?config.limits,
            counter_store = backends.counters.store_type(),
            "Rate limiter initialized"
        );

        Ok(Self {
            resource,
            keys,
            backends,
            config: RwLock::new(config),
            admission: tokio::sync::Mutex::new(()),
            syncer,
            sync_interval: options.sync_interval,
        })
    }

    async fn load_config(
        resource: &str,
        keys: &QuotaKeys,
        backends: &Backends,
    ) -> Result<QuotaConfig> {
        let cache_key = keys.config();

        if let Some(raw) = backends.counters.get(&cache_key).await? {
            match QuotaConfig::from_json(&raw) {
                Ok(config) => {
                    debug!(resource = %resource, "Loaded quota configuration from cache");
                    return Ok(config);
                }
                Err(e) => {
                    warn!(
                        resource = %resource,
                        error = %e,
                        "Ignoring malformed cached quota configuration"
                    );
                }
            }
        }

        let record = backends
            .config
            .load_service(resource)
            .await?
            .ok_or_else(|| RatekeeperError::ConfigNotFound(resource.to_string()))?;
        let config = QuotaConfig::from_record(&record);

        backends.counters.set(&cache_key, &config.to_json()?).await?;
        info!(resource = %resource, "Loaded quota configuration from config store");

        Ok(config)
    }

    /// The resource this limiter guards.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// A copy of the current quota configuration.
    pub fn config(&self) -> QuotaConfig {
        self.config.read().clone()
    }

    /// Wait for one unit of quota.
    ///
    /// Without a timeout a saturated window denies immediately. With one, the
    /// limiter sleeps in steps of at most one second and gives up as soon as
    /// the binding window cannot reopen before the deadline.
    pub async fn acquire(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        loop {
            let wait = match self.try_acquire().await {
                Admission::Granted => return true,
                Admission::Denied { wait } => wait,
            };

            let Some(deadline) = deadline else {
                info!(resource = %self.resource, "Request denied (no timeout)");
                return false;
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || wait > remaining {
                info!(
                    resource = %self.resource,
                    wait_secs = wait.as_secs_f64(),
                    "Timed out waiting for rate limit"
                );
                return false;
            }

            let sleep_for = wait.min(MAX_BACKOFF).min(remaining);
            trace!(resource = %self.resource, sleep_ms = sleep_for.as_millis() as u64, "Backing off");
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// One admission attempt. Store failures deny.
    pub async fn try_acquire(&self) -> Admission {
        let _guard = self.admission.lock().await;
        let now = self.backends.clock.now();

        match self.atomic_check_and_increment(now).await {
            Ok(admission) => admission,
            Err(e) => {
                error!(
                    resource = %self.resource,
                    error = %e,
                    "Counter store failure during admission, denying"
                );
                Admission::Denied {
                    wait: STORE_ERROR_RETRY,
                }
            }
        }
    }

    /// Run `work` after acquiring quota, or fail with `QuotaTimeout`.
    pub async fn limit_scope<F, T>(&self, timeout: Duration, work: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        if !self.acquire(Some(timeout)).await {
            return Err(RatekeeperError::QuotaTimeout {
                resource: self.resource.clone(),
                timeout,
            });
        }
        Ok(work.await)
    }

    async fn atomic_check_and_increment(&self, now: NaiveDateTime) -> Result<Admission> {
        self.check_and_reset_counters(now).await?;
        let config = self.config();

        // Check every window before mutating any of them.
        let mut binding_wait: Option<Duration> = None;
        for window in config.enforced_windows() {
            let limit = config.limit(window);
            let current = self
                .backends
                .counters
                .get_count(&self.keys.window(window))
                .await?;

            if current >= limit {
                let wait = window.duration_until_reset(now);
                warn!(
                    resource = %self.resource,
                    window = %window,
                    current = current,
                    limit = limit,
                    wait_secs = wait.as_secs_f64(),
                    "Quota window exhausted"
                );
                binding_wait = Some(binding_wait.map_or(wait, |longest| longest.max(wait)));
            }
        }

        if let Some(wait) = binding_wait {
            return Ok(Admission::Denied { wait });
        }

        let mut increments: Vec<_> = config
            .enforced_windows()
            .map(|window| Increment::expiring(self.keys.window(window), window.ttl()))
            .collect();
        increments.push(Increment::persistent(self.keys.total()));
        self.backends.counters.increment_all(&increments).await?;

        if self.should_sync() {
            self.syncer.request(self.sync_job());
        }

        debug!(resource = %self.resource, "Request admitted");
        Ok(Admission::Granted)
    }

    /// Zero every window whose boundary has passed since its last reset.
    ///
    /// Windows without a recorded reset are stamped with `now`. Calling this
    /// twice at the same instant resets each window at most once, and the
    /// lifetime total is never touched.
    pub async fn check_and_reset_counters(&self, now: NaiveDateTime) -> Result<()> {
        let mut config = self.refreshed_config().await;
        let mut updated = false;
        let mut outcome = Ok(());

        for window in Window::ALL {
            let Some(last_reset) = config.reset_time(window) else {
                config.set_reset_time(window, now);
                updated = true;
                continue;
            };

            let next_reset = window.next_reset(last_reset);
            if now < next_reset {
                continue;
            }

            if let Err(e) = self.backends.counters.delete(&self.keys.window(window)).await {
                outcome = Err(e);
                break;
            }
            config.set_reset_time(window, now);
            updated = true;

            info!(
                resource = %self.resource,
                window = %window,
                last_reset = %last_reset,
                next_reset = %next_reset,
                "Reset window counter"
            );
        }

        if updated {
            *self.config.write() = config.clone();
            self.backends
                .counters
                .set(&self.keys.config(), &config.to_json()?)
                .await?;
        }

        outcome
    }

    /// The shared cached configuration when readable, else the local copy.
    ///
    /// Picking up resets stamped by other processes keeps them from zeroing
    /// the same window twice.
    async fn refreshed_config(&self) -> QuotaConfig {
        match self.backends.counters.get(&self.keys.config()).await {
            Ok(Some(raw)) => match QuotaConfig::from_json(&raw) {
                Ok(config) => return config,
                Err(e) => {
                    warn!(resource = %self.resource, error = %e, "Cached quota configuration is malformed");
                }
            },
            Ok(None) => {}
            Err(e) => {
                debug!(resource = %self.resource, error = %e, "Using local quota configuration");
            }
        }
        self.config()
    }

    fn should_sync(&self) -> bool {
        match self.sync_interval {
            0 => false,
            1 => true,
            n => rand::thread_rng().gen_ratio(1, n),
        }
    }

    fn sync_job(&self) -> SyncJob {
        SyncJob {
            resource: self.resource.clone(),
            keys: self.keys.clone(),
            reset_times: self.config.read().reset_times.clone(),
        }
    }

    /// Copy the live counters into the config store and wait for it.
    pub async fn save_state(&self) -> Option<CounterSnapshot> {
        match self.syncer.sync_now(&self.sync_job()).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                error!(resource = %self.resource, error = %e, "Failed to save rate limiter state");
                None
            }
        }
    }

    /// Per-window usage read from the live counters. Never mutates state.
    pub async fn get_usage(&self) -> Result<BTreeMap<Window, WindowUsage>> {
        let config = self.config();
        let mut usage = BTreeMap::new();

        for window in Window::ALL {
            let used = self
                .backends
                .counters
                .get_count(&self.keys.window(window))
                .await?;
            let limit = config.limit(window);
            let utilization_percent = if limit > 0 {
                ((used as f64 / limit as f64) * 10_000.0).round() / 100.0
            } else {
                0.0
            };

            usage.insert(
                window,
                WindowUsage {
                    used,
                    limit,
                    remaining: (limit - used).max(0),
                    utilization_percent,
                },
            );
        }

        Ok(usage)
    }

    /// Lifetime number of admitted requests.
    pub async fn total_requests(&self) -> Result<i64> {
        self.backends.counters.get_count(&self.keys.total()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::testing::{at, memory_backends, service, TestBackends};
    use crate::clock::Clock;
    use crate::store::CounterStore;
    use chrono::TimeDelta;
    use std::sync::Arc;

    fn no_sync() -> RateLimiterOptions {
        RateLimiterOptions {
            sync_interval: 0,
            ..Default::default()
        }
    }

    async fn limiter_with(test: &TestBackends, limits: [i64; 4]) -> RateLimiter {
        let reset = test.clock.now();
        test.config.insert(service("svc", limits, Some(reset)));
        RateLimiter::new("svc", test.backends.clone(), no_sync())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_unknown_resource_is_config_not_found() {
        let test = memory_backends(at(2024, 6, 1, 12, 0, 10));
        let result = RateLimiter::new("missing", test.backends.clone(), no_sync()).await;
        assert!(matches!(result, Err(RatekeeperError::ConfigNotFound(name)) if name == "missing"));
    }

    #[tokio::test]
    async fn test_config_is_cached_in_counter_store() {
        let test = memory_backends(at(2024, 6, 1, 12, 0, 10));
        let limiter = limiter_with(&test, [2, 100, 0, 0]).await;

        let cached = test.counters.get("ratelimit:svc:config").await.unwrap().unwrap();
        let parsed = QuotaConfig::from_json(&cached).unwrap();
        assert_eq!(parsed.limit(Window::Minute), 2);
        assert_eq!(limiter.config().limit(Window::Hour), 100);
    }

    #[tokio::test]
    async fn test_cached_config_wins_over_config_store() {
        let test = memory_backends(at(2024, 6, 1, 12, 0, 10));
        test.config.insert(service("svc", [50, 0, 0, 0], None));
        let cached = QuotaConfig::new("svc", BTreeMap::from([(Window::Minute, 3)]));
        test.counters
            .set("ratelimit:svc:config", &cached.to_json().unwrap())
            .await
            .unwrap();

        let limiter = RateLimiter::new("svc", test.backends.clone(), no_sync())
            .await
            .unwrap();
        assert_eq!(limiter.config().limit(Window::Minute), 3);
    }

    #[tokio::test]
    async fn test_malformed_cache_falls_back_to_config_store() {
        let test = memory_backends(at(2024, 6, 1, 12, 0, 10));
        test.config.insert(service("svc", [7, 0, 0, 0], None));
        test.counters
            .set("ratelimit:svc:config", "{broken")
            .await
            .unwrap();

        let limiter = RateLimiter::new("svc", test.backends.clone(), no_sync())
            .await
            .unwrap();
        assert_eq!(limiter.config().limit(Window::Minute), 7);

        let repaired = test.counters.get("ratelimit:svc:config").await.unwrap().unwrap();
        assert!(QuotaConfig::from_json(&repaired).is_ok());
    }

    #[tokio::test]
    async fn test_minute_limit_scenario() {
        let test = memory_backends(at(2024, 6, 1, 12, 0, 10));
        let limiter = limiter_with(&test, [2, 100, 0, 0]).await;

        assert!(limiter.acquire(Some(Duration::ZERO)).await);
        assert!(limiter.acquire(Some(Duration::ZERO)).await);
        assert!(!limiter.acquire(Some(Duration::ZERO)).await);

        test.clock.advance(TimeDelta::seconds(60));
        assert!(limiter.acquire(Some(Duration::ZERO)).await);

        let usage = limiter.get_usage().await.unwrap();
        assert_eq!(usage[&Window::Minute].used, 1);
        assert_eq!(usage[&Window::Hour].used, 3);
        assert_eq!(limiter.total_requests().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_denial_reports_time_to_window_boundary() {
        let test = memory_backends(at(2024, 6, 1, 12, 0, 10));
        let limiter = limiter_with(&test, [1, 0, 0, 0]).await;

        assert_eq!(limiter.try_acquire().await, Admission::Granted);
        test.clock.set(at(2024, 6, 1, 12, 0, 45));
        assert_eq!(
            limiter.try_acquire().await,
            Admission::Denied {
                wait: Duration::from_secs(15)
            }
        );
    }

    #[tokio::test]
    async fn test_denial_reports_longest_blocking_window() {
        let test = memory_backends(at(2024, 6, 1, 12, 0, 10));
        let limiter = limiter_with(&test, [1, 1, 0, 0]).await;

        assert!(limiter.try_acquire().await.is_granted());
        test.clock.set(at(2024, 6, 1, 12, 30, 0));
        assert_eq!(
            limiter.try_acquire().await,
            Admission::Denied {
                wait: Duration::from_secs(30 * 60)
            }
        );
    }

    #[tokio::test]
    async fn test_denial_does_not_increment_any_window() {
        let test = memory_backends(at(2024, 6, 1, 12, 0, 10));
        let limiter = limiter_with(&test, [1, 100, 1000, 0]).await;

        assert!(limiter.try_acquire().await.is_granted());
        for _ in 0..3 {
            assert!(!limiter.try_acquire().await.is_granted());
        }

        let usage = limiter.get_usage().await.unwrap();
        assert_eq!(usage[&Window::Minute].used, 1);
        assert_eq!(usage[&Window::Hour].used, 1);
        assert_eq!(usage[&Window::Day].used, 1);
        assert_eq!(limiter.total_requests().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unbounded_windows_are_not_counted() {
        let test = memory_backends(at(2024, 6, 1, 12, 0, 10));
        let limiter = limiter_with(&test, [0, -1, 5, 0]).await;

        for _ in 0..5 {
            assert!(limiter.try_acquire().await.is_granted());
        }
        assert!(!limiter.try_acquire().await.is_granted());

        assert_eq!(test.counters.get("ratelimit:svc:minute:count").await.unwrap(), None);
        assert_eq!(test.counters.get("ratelimit:svc:hour:count").await.unwrap(), None);
        assert_eq!(test.counters.get_count("ratelimit:svc:day:count").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_counter_ttl_matches_window() {
        let test = memory_backends(at(2024, 6, 1, 12, 0, 10));
        let limiter = limiter_with(&test, [5, 5, 5, 5]).await;
        assert!(limiter.try_acquire().await.is_granted());

        assert_eq!(test.counters.ttl("ratelimit:svc:minute:count"), Some(Duration::from_secs(60)));
        assert_eq!(test.counters.ttl("ratelimit:svc:hour:count"), Some(Duration::from_secs(3600)));
        assert_eq!(test.counters.ttl("ratelimit:svc:day:count"), Some(Duration::from_secs(86400)));
        assert_eq!(
            test.counters.ttl("ratelimit:svc:month:count"),
            Some(Duration::from_secs(2592000))
        );
        assert_eq!(test.counters.ttl("ratelimit:svc:total:count"), None);
    }

    #[tokio::test]
    async fn test_rollover_is_idempotent_and_keeps_total() {
        let test = memory_backends(at(2024, 6, 1, 12, 0, 10));
        let limiter = limiter_with(&test, [10, 10, 10, 10]).await;
        for _ in 0..3 {
            assert!(limiter.try_acquire().await.is_granted());
        }

        let now = at(2024, 6, 1, 12, 1, 5);
        test.clock.set(now);
        limiter.check_and_reset_counters(now).await.unwrap();
        assert_eq!(limiter.config().reset_time(Window::Minute), Some(now));
        assert_eq!(test.counters.get_count("ratelimit:svc:minute:count").await.unwrap(), 0);

        // Traffic after the reset must survive a second check at the same instant.
        assert!(limiter.try_acquire().await.is_granted());
        limiter.check_and_reset_counters(now).await.unwrap();

        assert_eq!(test.counters.get_count("ratelimit:svc:minute:count").await.unwrap(), 1);
        assert_eq!(test.counters.get_count("ratelimit:svc:hour:count").await.unwrap(), 4);
        assert_eq!(limiter.total_requests().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_month_rollover_across_year_end() {
        let test = memory_backends(at(2023, 12, 31, 23, 59, 0));
        let limiter = limiter_with(&test, [0, 0, 0, 1]).await;

        assert!(limiter.try_acquire().await.is_granted());
        assert!(!limiter.try_acquire().await.is_granted());

        test.clock.set(at(2024, 1, 1, 0, 0, 0));
        assert!(limiter.try_acquire().await.is_granted());
        assert_eq!(
            limiter.config().reset_time(Window::Month),
            Some(at(2024, 1, 1, 0, 0, 0))
        );
    }

    #[tokio::test]
    async fn test_missing_reset_time_is_seeded() {
        let test = memory_backends(at(2024, 6, 1, 12, 0, 10));
        test.config.insert(service("svc", [1, 0, 0, 0], None));
        let limiter = RateLimiter::new("svc", test.backends.clone(), no_sync())
            .await
            .unwrap();

        assert!(limiter.try_acquire().await.is_granted());
        assert_eq!(
            limiter.config().reset_time(Window::Minute),
            Some(at(2024, 6, 1, 12, 0, 10))
        );

        test.clock.set(at(2024, 6, 1, 12, 1, 0));
        assert!(limiter.try_acquire().await.is_granted());
    }

    #[tokio::test]
    async fn test_reset_by_another_process_is_not_repeated() {
        let test = memory_backends(at(2024, 6, 1, 12, 0, 10));
        let first = limiter_with(&test, [10, 0, 0, 0]).await;
        let second = RateLimiter::new("svc", test.backends.clone(), no_sync())
            .await
            .unwrap();

        test.clock.set(at(2024, 6, 1, 12, 1, 5));
        assert!(first.try_acquire().await.is_granted());
        assert!(first.try_acquire().await.is_granted());

        // The second limiter still holds the old reset time locally.
        assert!(second.try_acquire().await.is_granted());
        assert_eq!(test.counters.get_count("ratelimit:svc:minute:count").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_get_usage_does_not_mutate() {
        let test = memory_backends(at(2024, 6, 1, 12, 0, 10));
        let limiter = limiter_with(&test, [4, 0, 0, 0]).await;
        assert!(limiter.try_acquire().await.is_granted());

        let before = limiter.config();
        let usage = limiter.get_usage().await.unwrap();
        let again = limiter.get_usage().await.unwrap();

        assert_eq!(usage, again);
        assert_eq!(before, limiter.config());
        assert_eq!(
            usage[&Window::Minute],
            WindowUsage {
                used: 1,
                limit: 4,
                remaining: 3,
                utilization_percent: 25.0
            }
        );
        assert_eq!(usage[&Window::Day].remaining, 0);
        assert_eq!(limiter.total_requests().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_gives_up_when_window_outlasts_timeout() {
        let test = memory_backends(at(2024, 6, 1, 12, 0, 10));
        let limiter = limiter_with(&test, [1, 0, 0, 0]).await;
        assert!(limiter.acquire(None).await);

        let started = Instant::now();
        assert!(!limiter.acquire(Some(Duration::from_secs(5))).await);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_never_sleeps_past_deadline() {
        let test = memory_backends(at(2024, 6, 1, 12, 0, 58));
        let limiter = limiter_with(&test, [1, 0, 0, 0]).await;
        assert!(limiter.acquire(None).await);

        // The manual clock stays frozen, so the window never reopens. One
        // backoff step fits, after which 2s of wait exceeds what remains.
        let started = Instant::now();
        assert!(!limiter.acquire(Some(Duration::from_millis(2500))).await);
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_window_to_reopen() {
        let test = memory_backends(at(2024, 6, 1, 12, 0, 59));
        let limiter = Arc::new(limiter_with(&test, [1, 0, 0, 0]).await);
        assert!(limiter.acquire(None).await);

        let clock = test.clock.clone();
        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire(Some(Duration::from_secs(3))).await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        clock.set(at(2024, 6, 1, 12, 1, 0));

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_acquires_never_exceed_limit() {
        let test = memory_backends(at(2024, 6, 1, 12, 0, 10));
        let limiter = Arc::new(limiter_with(&test, [5, 0, 0, 0]).await);

        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.acquire(None).await }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 5);
    }

    #[tokio::test]
    async fn test_limit_scope_runs_work_or_times_out() {
        let test = memory_backends(at(2024, 6, 1, 12, 0, 10));
        let limiter = limiter_with(&test, [1, 0, 0, 0]).await;

        let value = limiter.limit_scope(Duration::ZERO, async { 42 }).await.unwrap();
        assert_eq!(value, 42);

        let result = limiter.limit_scope(Duration::ZERO, async { 43 }).await;
        assert!(matches!(result, Err(RatekeeperError::QuotaTimeout { .. })));
    }

    #[tokio::test]
    async fn test_save_state_persists_counters() {
        let test = memory_backends(at(2024, 6, 1, 12, 0, 10));
        let limiter = limiter_with(&test, [10, 10, 0, 0]).await;
        assert!(limiter.try_acquire().await.is_granted());
        assert!(limiter.try_acquire().await.is_granted());

        let snapshot = limiter.save_state().await.unwrap();
        assert_eq!(snapshot.total, 2);

        let record = test.config.service("svc").unwrap();
        assert_eq!(record.minute_counter, 2);
        assert_eq!(record.hour_counter, 2);
        assert_eq!(record.day_counter, 0);
        assert_eq!(record.total_requests, 2);
    }

    #[tokio::test]
    async fn test_every_admission_syncs_with_interval_one() {
        let test = memory_backends(at(2024, 6, 1, 12, 0, 10));
        test.config.insert(service("svc", [10, 0, 0, 0], Some(test.clock.now())));
        let options = RateLimiterOptions {
            sync_interval: 1,
            ..Default::default()
        };
        let limiter = RateLimiter::new("svc", test.backends.clone(), options)
            .await
            .unwrap();

        assert!(limiter.try_acquire().await.is_granted());
        for _ in 0..50 {
            if test.config.service("svc").unwrap().total_requests == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("admission never triggered a counter sync");
    }
}
