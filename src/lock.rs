//! Cross-process mutual exclusion over the shared counter store.
//!
//! A lock is a single key, `lock.api.<name>`, holding the owner's random
//! token with a lease TTL. Acquisition is `SET NX` with expiry; release is
//! an atomic compare-and-delete so a holder whose lease already expired can
//! never remove a lock that now belongs to someone else.

use std::future::Future;
use std::panic::{resume_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{RatekeeperError, Result};
use crate::store::CounterStore;

/// Lease granted when the caller has no preference.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(1800);
/// Delay between acquisition attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// A named lock shared by every process using the same counter store.
pub struct DistributedLock {
    name: String,
    key: String,
    token: String,
    poll_interval: Duration,
    store: Arc<dyn CounterStore>,
}

impl DistributedLock {
    pub fn new(name: impl Into<String>, store: Arc<dyn CounterStore>) -> Self {
        let name = name.into();
        Self {
            key: format!("lock.api.{}", name),
            token: uuid::Uuid::new_v4().to_string(),
            name,
            poll_interval: DEFAULT_POLL_INTERVAL,
            store,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Owner token written into the lock key.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Take the lock for `lease`, polling until `timeout` elapses.
    ///
    /// With no timeout the call waits until the lock is free. Store errors
    /// are logged and reported as a failed acquisition.
    pub async fn acquire(&self, lease: Duration, timeout: Option<Duration>) -> bool {
        match self.acquire_with_wait(lease, timeout).await {
            Ok(acquired) => acquired,
            Err(e) => {
                error!(lock = %self.name, error = %e, "Counter store error while acquiring lock");
                false
            }
        }
    }

    async fn acquire_with_wait(&self, lease: Duration, timeout: Option<Duration>) -> Result<bool> {
        let started = Instant::now();

        loop {
            if self.try_acquire(lease).await? {
                return Ok(true);
            }

            let sleep_for = match timeout {
                Some(timeout) => {
                    let remaining = timeout.saturating_sub(started.elapsed());
                    if remaining.is_zero() {
                        warn!(
                            lock = %self.name,
                            timeout_secs = timeout.as_secs_f64(),
                            "Timed out waiting for lock"
                        );
                        return Ok(false);
                    }
                    self.poll_interval.min(remaining)
                }
                None => self.poll_interval,
            };

            tokio::time::sleep(sleep_for).await;
        }
    }

    async fn try_acquire(&self, lease: Duration) -> Result<bool> {
        if self.store.set_if_absent(&self.key, &self.token, lease).await? {
            debug!(lock = %self.name, owner = %self.token, "Lock acquired");
            return Ok(true);
        }

        if let Some(owner) = self.store.get(&self.key).await? {
            debug!(lock = %self.name, owner = %owner, "Lock held by another owner");
        }
        Ok(false)
    }

    /// Release the lock if this instance still owns it.
    pub async fn release(&self) -> bool {
        match self.store.delete_if_equals(&self.key, &self.token).await {
            Ok(true) => {
                debug!(lock = %self.name, owner = %self.token, "Lock released");
                true
            }
            Ok(false) => {
                let current = self.store.get(&self.key).await.ok().flatten();
                warn!(
                    lock = %self.name,
                    owner = %self.token,
                    current_owner = ?current,
                    "Lock not released: expired or owned by another holder"
                );
                false
            }
            Err(e) => {
                error!(lock = %self.name, error = %e, "Counter store error while releasing lock");
                false
            }
        }
    }

    /// Run `work` while holding the lock.
    ///
    /// Fails with `LockTimeout` when the lock cannot be taken. Once taken, the
    /// lock is released whether `work` completes, panics or is cancelled.
    pub async fn scope<F, T>(&self, lease: Duration, timeout: Option<Duration>, work: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        let (value, _) = self.scope_with_release(lease, timeout, work).await?;
        Ok(value)
    }

    /// Like [`DistributedLock::scope`], also reporting whether the final
    /// release found the lock still owned by this instance.
    pub async fn scope_with_release<F, T>(
        &self,
        lease: Duration,
        timeout: Option<Duration>,
        work: F,
    ) -> Result<(T, bool)>
    where
        F: Future<Output = T>,
    {
        if !self.acquire(lease, timeout).await {
            return Err(RatekeeperError::LockTimeout {
                name: self.name.clone(),
                timeout,
            });
        }

        info!(lock = %self.name, "Entered locked section");
        let mut guard = ReleaseOnDrop::new(self);
        let outcome = AssertUnwindSafe(work).catch_unwind().await;
        let released = self.release().await;
        guard.disarm();

        match outcome {
            Ok(value) => Ok((value, released)),
            Err(panic) => resume_unwind(panic),
        }
    }
}

/// Releases the lock from a spawned task if the locked section is dropped
/// before it finishes.
struct ReleaseOnDrop {
    armed: bool,
    name: String,
    key: String,
    token: String,
    store: Arc<dyn CounterStore>,
}

impl ReleaseOnDrop {
    fn new(lock: &DistributedLock) -> Self {
        Self {
            armed: true,
            name: lock.name.clone(),
            key: lock.key.clone(),
            token: lock.token.clone(),
            store: lock.store.clone(),
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(lock = %self.name, "Locked section cancelled outside a runtime; lock held until lease expires");
            return;
        };

        let name = std::mem::take(&mut self.name);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        let store = self.store.clone();
        runtime.spawn(async move {
            match store.delete_if_equals(&key, &token).await {
                Ok(released) => info!(lock = %name, released, "Released lock after cancelled section"),
                Err(e) => error!(lock = %name, error = %e, "Counter store error while releasing lock"),
            }
        });
    }
}
