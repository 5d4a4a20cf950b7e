//! Executes provider methods and persists provider state afterwards.

use std::panic::{resume_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tracing::{error, info};

use super::registry::ProviderRegistry;
use super::{ApiProvider, ProviderContext};
use crate::config::LockConfig;
use crate::error::Result;
use crate::lock::DistributedLock;

struct SyncLock {
    lock: DistributedLock,
    lease: Duration,
    timeout: Option<Duration>,
}

/// Runs methods against one provider.
pub struct ApiManager {
    provider: Arc<dyn ApiProvider>,
    sync_lock: Option<SyncLock>,
}

impl ApiManager {
    /// Resolve `name` from the registry.
    pub async fn new(
        registry: &ProviderRegistry,
        name: &str,
        context: ProviderContext,
    ) -> Result<Self> {
        let provider = registry.create(name, context).await?;
        Ok(Self::from_provider(provider))
    }

    pub fn from_provider(provider: Arc<dyn ApiProvider>) -> Self {
        Self {
            provider,
            sync_lock: None,
        }
    }

    /// Serialize state saves across processes with a lock named after the
    /// provider.
    pub fn with_sync_lock(mut self, context: &ProviderContext, settings: &LockConfig) -> Self {
        let lock = DistributedLock::new(self.provider.name(), context.backends.counters.clone())
            .with_poll_interval(settings.poll_interval());
        self.sync_lock = Some(SyncLock {
            lock,
            lease: settings.lease(),
            timeout: settings.timeout(),
        });
        self
    }

    pub fn provider(&self) -> &Arc<dyn ApiProvider> {
        &self.provider
    }

    /// Run a method, then save provider state whatever the outcome.
    ///
    /// With a sync lock configured, the call and the save run as one locked
    /// section, so two workers never sync the same provider at once. A lock
    /// that cannot be taken fails with `LockTimeout` before the method runs.
    pub async fn execute(&self, method: &str, params: Value) -> Result<Value> {
        info!(provider = %self.provider.name(), method = %method, "Executing provider method");

        let result = match &self.sync_lock {
            Some(sync) => sync
                .lock
                .scope(sync.lease, sync.timeout, self.run_and_save(method, params))
                .await
                .and_then(|result| result),
            None => self.run_and_save(method, params).await,
        };

        if let Err(e) = &result {
            error!(provider = %self.provider.name(), method = %method, error = %e, "Provider method failed");
        }
        result
    }

    async fn run_and_save(&self, method: &str, params: Value) -> Result<Value> {
        let outcome = AssertUnwindSafe(self.provider.execute(method, params))
            .catch_unwind()
            .await;
        self.provider.save_state().await;

        match outcome {
            Ok(result) => result,
            Err(panic) => resume_unwind(panic),
        }
    }

    /// Persist provider state. Failures are logged only.
    pub async fn save_state(&self) {
        match &self.sync_lock {
            Some(sync) => {
                let saved = sync
                    .lock
                    .scope(sync.lease, sync.timeout, self.provider.save_state())
                    .await;
                if let Err(e) = saved {
                    error!(provider = %self.provider.name(), error = %e, "Skipped state save");
                }
            }
            None => self.provider.save_state().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::testing::{at, memory_backends, TestBackends};
    use crate::config::RatekeeperConfig;
    use crate::error::RatekeeperError;
    use crate::store::CounterStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recording {
        calls: AtomicUsize,
        active: AtomicUsize,
        peak: AtomicUsize,
        saves: AtomicUsize,
    }

    #[async_trait]
    impl ApiProvider for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn methods(&self) -> &[&'static str] {
            &["ok", "slow", "fail", "panic"]
        }

        async fn acquire_quota(&self, _timeout: Option<Duration>) -> bool {
            true
        }

        async fn execute(&self, method: &str, params: Value) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match method {
                "ok" => Ok(params),
                "slow" => {
                    let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                    self.peak.fetch_max(active, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    Ok(params)
                }
                "fail" => Err(RatekeeperError::BackingStore("down".to_string())),
                "panic" => panic!("provider bug"),
                other => Err(RatekeeperError::UnknownMethod {
                    provider: "recording".to_string(),
                    method: other.to_string(),
                }),
            }
        }

        async fn save_state(&self) {
            self.saves.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn manager() -> (Arc<Recording>, ApiManager) {
        let provider = Arc::new(Recording::default());
        (provider.clone(), ApiManager::from_provider(provider))
    }

    #[tokio::test]
    async fn test_state_saved_after_success_and_failure() {
        let (provider, manager) = manager();

        let value = manager.execute("ok", Value::from("hi")).await.unwrap();
        assert_eq!(value, "hi");
        assert!(manager.execute("fail", Value::Null).await.is_err());
        assert!(matches!(
            manager.execute("missing", Value::Null).await,
            Err(RatekeeperError::UnknownMethod { .. })
        ));

        assert_eq!(provider.saves.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_state_saved_when_provider_panics() {
        let (provider, manager) = manager();
        let manager = Arc::new(manager);

        let task = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.execute("panic", Value::Null).await })
        };
        assert!(task.await.unwrap_err().is_panic());
        assert_eq!(provider.saves.load(Ordering::SeqCst), 1);
    }

    fn locked_manager(
        test: &TestBackends,
        provider: Arc<Recording>,
        timeout_secs: Option<u64>,
    ) -> ApiManager {
        let mut settings = RatekeeperConfig::default();
        settings.lock.poll_interval_ms = 10;
        settings.lock.timeout_secs = timeout_secs;
        let context = ProviderContext::new(test.backends.clone(), settings.clone());

        ApiManager::from_provider(provider).with_sync_lock(&context, &settings.lock)
    }

    #[tokio::test]
    async fn test_sync_lock_released_after_save() {
        let test = memory_backends(at(2024, 6, 1, 12, 0, 0));
        let provider = Arc::new(Recording::default());
        let manager = locked_manager(&test, provider.clone(), Some(1));

        manager.execute("ok", Value::Null).await.unwrap();
        assert!(manager.execute("fail", Value::Null).await.is_err());

        assert_eq!(provider.saves.load(Ordering::SeqCst), 2);
        assert!(test.counters.get("lock.api.recording").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_held_lock_blocks_the_method() {
        let test = memory_backends(at(2024, 6, 1, 12, 0, 0));
        let provider = Arc::new(Recording::default());
        let manager = locked_manager(&test, provider.clone(), Some(0));
        test.counters
            .set_if_absent("lock.api.recording", "other-worker", Duration::from_secs(60))
            .await
            .unwrap();

        let result = manager.execute("ok", Value::from(1)).await;
        assert!(matches!(result, Err(RatekeeperError::LockTimeout { .. })));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        assert_eq!(provider.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_locked_managers_never_overlap() {
        let test = memory_backends(at(2024, 6, 1, 12, 0, 0));
        let provider = Arc::new(Recording::default());
        let first = locked_manager(&test, provider.clone(), None);
        let second = locked_manager(&test, provider.clone(), None);

        let (a, b) = tokio::join!(
            first.execute("slow", Value::Null),
            second.execute("slow", Value::Null)
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(provider.peak.load(Ordering::SeqCst), 1);
        assert_eq!(provider.saves.load(Ordering::SeqCst), 2);
    }
}
