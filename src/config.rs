//! Configuration management for Ratekeeper.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RatekeeperError, Result};

/// Prefix for environment overrides, e.g. `RATEKEEPER__STORE__REDIS_URL`.
pub const ENV_PREFIX: &str = "RATEKEEPER";

/// Main configuration for Ratekeeper.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatekeeperConfig {
    /// Shared counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Durable provider configuration store
    #[serde(default)]
    pub config_store: ConfigStoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Distributed lock configuration
    #[serde(default)]
    pub lock: LockConfig,

    /// Per-provider transport settings
    #[serde(default)]
    pub providers: ProvidersConfig,
}

/// Which counter store implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis store (multi-process)
    #[default]
    Redis,
    /// Process-local store
    Memory,
}

/// Shared counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

/// Durable configuration store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigStoreConfig {
    /// YAML file holding provider records
    #[serde(default = "default_services_path")]
    pub services_path: PathBuf,

    /// JSON-lines file receiving request logs
    #[serde(default)]
    pub request_log_path: Option<PathBuf>,
}

impl Default for ConfigStoreConfig {
    fn default() -> Self {
        Self {
            services_path: default_services_path(),
            request_log_path: None,
        }
    }
}

fn default_services_path() -> PathBuf {
    PathBuf::from("services.yaml")
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// One in `sync_interval` admissions copies counters to the config store
    #[serde(default = "default_sync_interval")]
    pub sync_interval: u32,

    /// Pending durability syncs kept before new requests are dropped
    #[serde(default = "default_sync_queue_capacity")]
    pub sync_queue_capacity: usize,

    /// How long a rate-limited request waits for admission, in seconds
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

impl RateLimitingConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            sync_interval: default_sync_interval(),
            sync_queue_capacity: default_sync_queue_capacity(),
            acquire_timeout_secs: default_acquire_timeout(),
        }
    }
}

fn default_sync_interval() -> u32 {
    100
}

fn default_sync_queue_capacity() -> usize {
    16
}

fn default_acquire_timeout() -> u64 {
    30
}

/// Distributed lock configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Delay between acquisition attempts, in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Lease granted to a holder, in seconds
    #[serde(default = "default_lease")]
    pub lease_secs: u64,

    /// Give up acquiring after this many seconds; wait forever when unset
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl LockConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            lease_secs: default_lease(),
            timeout_secs: None,
        }
    }
}

fn default_poll_interval() -> u64 {
    30_000
}

fn default_lease() -> u64 {
    1800
}

/// Transport settings for every known provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub coingecko: CoingeckoConfig,
}

/// CoinGecko transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoingeckoConfig {
    #[serde(default = "default_coingecko_base_url")]
    pub base_url: String,

    /// Longest request URL the provider accepts
    #[serde(default = "default_max_url_length")]
    pub max_url_length: usize,

    /// Per-request HTTP timeout, in seconds
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,

    /// Prefix added to every returned ticker id
    #[serde(default = "default_price_prefix")]
    pub price_prefix: String,
}

impl CoingeckoConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for CoingeckoConfig {
    fn default() -> Self {
        Self {
            base_url: default_coingecko_base_url(),
            max_url_length: default_max_url_length(),
            timeout_secs: default_request_timeout(),
            price_prefix: default_price_prefix(),
        }
    }
}

fn default_coingecko_base_url() -> String {
    "https://api.coingecko.com/api/v3".to_string()
}

fn default_max_url_length() -> usize {
    2048
}

fn default_request_timeout() -> u64 {
    30
}

fn default_price_prefix() -> String {
    "crypto:".to_string()
}

impl RatekeeperConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| RatekeeperError::Config(e.to_string()))
    }

    /// Load configuration from an optional file layered under
    /// `RATEKEEPER__`-prefixed environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|settings| settings.try_deserialize::<RatekeeperConfig>())
            .map_err(|e| RatekeeperError::Config(e.to_string()))
    }
}
