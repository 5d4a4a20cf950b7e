//! YAML file-backed configuration store.
//!
//! Provider records live in a YAML document:
//!
//! ```yaml
//! services:
//!   - name: coingecko
//!     requests_per_minute: 30
//!     requests_per_month: 10000
//! ```
//!
//! Request logs are appended as JSON lines to a separate file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{ConfigStore, CounterSnapshot, RequestLog, ServiceRecord};
use crate::error::{RatekeeperError, Result};

#[derive(Debug, Default, Serialize, Deserialize)]
struct ServicesDocument {
    #[serde(default)]
    services: Vec<ServiceRecord>,
}

/// Configuration store persisted to the local filesystem.
pub struct FileConfigStore {
    services_path: PathBuf,
    request_log_path: Option<PathBuf>,
    /// Serializes read-modify-write cycles on the services file
    write_lock: Mutex<()>,
}

impl FileConfigStore {
    /// Create a store over a services file and an optional request log file.
    pub fn new(services_path: impl Into<PathBuf>, request_log_path: Option<PathBuf>) -> Self {
        Self {
            services_path: services_path.into(),
            request_log_path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn services_path(&self) -> &Path {
        &self.services_path
    }

    async fn read_document(&self) -> Result<ServicesDocument> {
        let contents = match tokio::fs::read_to_string(&self.services_path).await {
            Ok(contents) => contents,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.services_path.display(), "Services file does not exist");
                return Ok(ServicesDocument::default());
            }
            Err(error) => return Err(error.into()),
        };

        if contents.trim().is_empty() {
            return Ok(ServicesDocument::default());
        }

        serde_yaml::from_str(&contents).map_err(|e| {
            RatekeeperError::Config(format!(
                "Failed to parse services file {}: {}",
                self.services_path.display(),
                e
            ))
        })
    }

    async fn write_document(&self, document: &ServicesDocument) -> Result<()> {
        let contents = serde_yaml::to_string(document)
            .map_err(|e| RatekeeperError::Config(format!("Failed to encode services: {}", e)))?;

        // Readers must never observe a half-written document: stage, then rename.
        let mut staging = self.services_path.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);

        tokio::fs::write(&staging, contents).await?;
        tokio::fs::rename(&staging, &self.services_path).await?;
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn load_service(&self, name: &str) -> Result<Option<ServiceRecord>> {
        let document = self.read_document().await?;
        Ok(document
            .services
            .into_iter()
            .find(|record| record.name == name))
    }

    async fn save_counters(&self, name: &str, snapshot: &CounterSnapshot) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut document = self.read_document().await?;
        let record = document
            .services
            .iter_mut()
            .find(|record| record.name == name)
            .ok_or_else(|| RatekeeperError::ConfigNotFound(name.to_string()))?;
        record.apply_snapshot(snapshot);

        self.write_document(&document).await?;
        debug!(service = %name, total = snapshot.total, "Saved counters to services file");
        Ok(())
    }

    async fn append_request_logs(&self, logs: &[RequestLog]) -> Result<()> {
        let Some(path) = &self.request_log_path else {
            debug!(count = logs.len(), "No request log file configured, dropping logs");
            return Ok(());
        };
        if logs.is_empty() {
            return Ok(());
        }

        let mut buffer = Vec::new();
        for log in logs {
            serde_json::to_writer(&mut buffer, log)?;
            buffer.push(b'\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(&buffer).await?;
        file.flush().await?;

        info!(count = logs.len(), path = %path.display(), "Appended request logs");
        Ok(())
    }
}
