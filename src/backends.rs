//! The external collaborators the quota engine runs against.

use std::sync::Arc;

use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::{RatekeeperConfig, StoreBackend};
use crate::error::Result;
use crate::persistence::{ConfigStore, FileConfigStore};
use crate::store::{CounterStore, MemoryCounterStore, RedisCounterStore};

/// Shared counter store, durable config store and clock.
#[derive(Clone)]
pub struct Backends {
    pub counters: Arc<dyn CounterStore>,
    pub config: Arc<dyn ConfigStore>,
    pub clock: Arc<dyn Clock>,
}

impl Backends {
    pub fn new(
        counters: Arc<dyn CounterStore>,
        config: Arc<dyn ConfigStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            counters,
            config,
            clock,
        }
    }

    /// Build the production backends described by the configuration.
    pub fn from_config(config: &RatekeeperConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let counters: Arc<dyn CounterStore> = match config.store.backend {
            StoreBackend::Redis => Arc::new(RedisCounterStore::open(&config.store.redis_url)?),
            StoreBackend::Memory => Arc::new(MemoryCounterStore::with_clock(clock.clone())),
        };

        let config_store = Arc::new(FileConfigStore::new(
            config.config_store.services_path.clone(),
            config.config_store.request_log_path.clone(),
        ));

        info!(
            counter_store = counters.store_type(),
            services_path = %config.config_store.services_path.display(),
            "Backends initialized"
        );

        Ok(Self::new(counters, config_store, clock))
    }
}
