//! Durable provider configuration.
//!
//! The quota engine reads a provider's limits and last-reset instants from
//! here once, and writes back only aggregate counters and request logs.

mod file;
mod memory;
mod records;

pub use file::FileConfigStore;
pub use memory::MemoryConfigStore;
pub use records::{CounterSnapshot, RequestLog, ServiceRecord};

use async_trait::async_trait;

use crate::error::Result;

/// Read/write contract of the durable configuration store.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Load a provider's record, or `None` if it is not configured.
    async fn load_service(&self, name: &str) -> Result<Option<ServiceRecord>>;

    /// Persist live counters for a provider.
    async fn save_counters(&self, name: &str, snapshot: &CounterSnapshot) -> Result<()>;

    /// Append request log rows.
    async fn append_request_logs(&self, logs: &[RequestLog]) -> Result<()>;
}
