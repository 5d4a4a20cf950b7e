//! Error types for Ratekeeper.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Ratekeeper operations.
#[derive(Error, Debug)]
pub enum RatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// No quota configuration exists for the resource
    #[error("Quota configuration not found for resource {0}")]
    ConfigNotFound(String),

    /// The shared counter store or the config store failed
    #[error("Backing store error: {0}")]
    BackingStore(String),

    /// A scoped lock could not be acquired in time
    #[error("Timed out acquiring lock {name} (timeout: {timeout:?})")]
    LockTimeout {
        name: String,
        timeout: Option<Duration>,
    },

    /// Quota admission was not granted before the deadline
    #[error("Rate limit for {resource} not acquired within {timeout:?}")]
    QuotaTimeout { resource: String, timeout: Duration },

    /// No provider is registered under the name
    #[error("Unknown API provider: {0}")]
    UnknownProvider(String),

    /// The provider does not expose the method
    #[error("API provider {provider} has no method {method}")]
    UnknownMethod { provider: String, method: String },

    /// Transport-level HTTP errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success HTTP responses
    #[error("HTTP {status} from {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },

    /// JSON encoding and decoding errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Ratekeeper operations.
pub type Result<T> = std::result::Result<T, RatekeeperError>;
