//! Background durability sync of live counters.
//!
//! Admissions occasionally ask for the shared counters to be copied into the
//! durable config store. Requests go through a bounded queue drained by a
//! single worker task; when the queue is full or the worker is gone the
//! request is dropped, so the admission path never waits on persistence.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDateTime;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, trace};

use super::keys::QuotaKeys;
use super::window::Window;
use crate::backends::Backends;
use crate::clock::Clock;
use crate::error::Result;
use crate::persistence::{ConfigStore, CounterSnapshot};
use crate::store::CounterStore;

/// Everything needed to snapshot one resource's counters.
#[derive(Debug, Clone)]
pub struct SyncJob {
    pub resource: String,
    pub keys: QuotaKeys,
    pub reset_times: BTreeMap<Window, Option<NaiveDateTime>>,
}

#[derive(Clone)]
struct SyncWorker {
    counters: Arc<dyn CounterStore>,
    config: Arc<dyn ConfigStore>,
    clock: Arc<dyn Clock>,
}

impl SyncWorker {
    async fn snapshot(&self, job: &SyncJob) -> Result<CounterSnapshot> {
        let mut counts = BTreeMap::new();
        for window in Window::ALL {
            counts.insert(window, self.counters.get_count(&job.keys.window(window)).await?);
        }
        let total = self.counters.get_count(&job.keys.total()).await?;

        Ok(CounterSnapshot {
            counts,
            total,
            reset_times: job.reset_times.clone(),
            taken_at: self.clock.now(),
        })
    }

    async fn run(&self, job: &SyncJob) -> Result<CounterSnapshot> {
        let snapshot = self.snapshot(job).await?;
        self.config.save_counters(&job.resource, &snapshot).await?;
        debug!(
            resource = %job.resource,
            total = snapshot.total,
            "Synchronized counters to config store"
        );
        Ok(snapshot)
    }
}

/// Handle to the background sync worker.
#[derive(Clone)]
pub struct UsageSyncer {
    sender: mpsc::Sender<SyncJob>,
    worker: SyncWorker,
}

impl UsageSyncer {
    /// Spawn the worker on the current tokio runtime.
    pub fn spawn(backends: &Backends, capacity: usize) -> Self {
        let worker = SyncWorker {
            counters: backends.counters.clone(),
            config: backends.config.clone(),
            clock: backends.clock.clone(),
        };
        let (sender, mut receiver) = mpsc::channel::<SyncJob>(capacity.max(1));

        let background = worker.clone();
        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                if let Err(e) = background.run(&job).await {
                    error!(resource = %job.resource, error = %e, "Counter sync failed");
                }
            }
            trace!("Counter sync worker stopped");
        });

        Self { sender, worker }
    }

    /// Queue a sync without waiting. Returns whether it was accepted.
    pub fn request(&self, job: SyncJob) -> bool {
        match self.sender.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                debug!(resource = %job.resource, "Counter sync queue full, dropping request");
                false
            }
            Err(TrySendError::Closed(job)) => {
                debug!(resource = %job.resource, "Counter sync worker gone, dropping request");
                false
            }
        }
    }

    /// Run a sync inline and wait for it.
    pub async fn sync_now(&self, job: &SyncJob) -> Result<CounterSnapshot> {
        self.worker.run(job).await
    }
}
