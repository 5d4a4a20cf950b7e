//! External API providers running under the shared quota.
//!
//! A provider exposes named methods taking and returning JSON. Providers are
//! created through a [`ProviderRegistry`] and driven by an [`ApiManager`],
//! which persists provider state after every call.

mod client;
mod coingecko;
mod manager;
mod registry;

pub use client::{ApiClient, USER_AGENT};
pub use coingecko::CoingeckoProvider;
pub use manager::ApiManager;
pub use registry::{ProviderFactory, ProviderFuture, ProviderRegistry};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::backends::Backends;
use crate::config::RatekeeperConfig;
use crate::error::Result;
use crate::ratelimit::RateLimiterOptions;

/// A rate-limited external API.
#[async_trait]
pub trait ApiProvider: Send + Sync {
    /// Registry name, also the quota resource name.
    fn name(&self) -> &str;

    /// Methods accepted by [`ApiProvider::execute`].
    fn methods(&self) -> &[&'static str];

    /// Take one unit of the provider's quota.
    async fn acquire_quota(&self, timeout: Option<Duration>) -> bool;

    /// Run a method. Unknown names fail with `UnknownMethod`.
    async fn execute(&self, method: &str, params: Value) -> Result<Value>;

    /// Flush buffered request logs and live counters. Never fails.
    async fn save_state(&self);
}

/// Everything a provider factory needs.
#[derive(Clone)]
pub struct ProviderContext {
    pub backends: Backends,
    pub settings: Arc<RatekeeperConfig>,
}

impl ProviderContext {
    pub fn new(backends: Backends, settings: RatekeeperConfig) -> Self {
        Self {
            backends,
            settings: Arc::new(settings),
        }
    }

    pub fn limiter_options(&self) -> RateLimiterOptions {
        RateLimiterOptions {
            sync_interval: self.settings.rate_limiting.sync_interval,
            sync_queue_capacity: self.settings.rate_limiting.sync_queue_capacity,
        }
    }
}
