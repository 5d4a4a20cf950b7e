//! In-memory configuration store.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{ConfigStore, CounterSnapshot, RequestLog, ServiceRecord};
use crate::error::{RatekeeperError, Result};

/// Configuration store kept in process memory.
#[derive(Default)]
pub struct MemoryConfigStore {
    services: DashMap<String, ServiceRecord>,
    request_logs: Mutex<Vec<RequestLog>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a provider record.
    pub fn insert(&self, record: ServiceRecord) {
        self.services.insert(record.name.clone(), record);
    }

    /// Current copy of a provider record.
    pub fn service(&self, name: &str) -> Option<ServiceRecord> {
        self.services.get(name).map(|record| record.clone())
    }

    /// Every request log appended so far.
    pub fn request_logs(&self) -> Vec<RequestLog> {
        self.request_logs.lock().clone()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn load_service(&self, name: &str) -> Result<Option<ServiceRecord>> {
        Ok(self.service(name))
    }

    async fn save_counters(&self, name: &str, snapshot: &CounterSnapshot) -> Result<()> {
        let mut record = self
            .services
            .get_mut(name)
            .ok_or_else(|| RatekeeperError::ConfigNotFound(name.to_string()))?;
        record.apply_snapshot(snapshot);
        Ok(())
    }

    async fn append_request_logs(&self, logs: &[RequestLog]) -> Result<()> {
        self.request_logs.lock().extend_from_slice(logs);
        Ok(())
    }
}
