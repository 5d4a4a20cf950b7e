//! Rate-limited batch fetching.
//!
//! Splits a large id list with a [`RequestChunker`], takes one unit of quota
//! per batch, and merges per-batch results into a single report. A failed or
//! denied batch is recorded and skipped; the remaining batches still run.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use super::chunker::RequestChunker;
use crate::error::{RatekeeperError, Result};
use crate::ratelimit::QuotaGate;

/// Default wait for quota before a batch is counted as failed.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Progress callback receiving `(done, estimated_total, message)`.
pub type ProgressFn = Arc<dyn Fn(usize, usize, &str) + Send + Sync>;

/// A batch that produced no results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchFailure {
    /// 1-based position of the batch
    pub batch_index: usize,
    pub ids: Vec<String>,
    pub error: String,
}

/// Merged outcome of a batched fetch.
#[derive(Debug, Clone, Serialize)]
pub struct FetchReport<V> {
    pub results: BTreeMap<String, V>,
    pub requested: usize,
    pub received: usize,
    pub total_batches: usize,
    pub failures: Vec<BatchFailure>,
}

impl<V> FetchReport<V> {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Drives batches through a quota gate.
pub struct BatchFetchOrchestrator<G: QuotaGate + ?Sized> {
    gate: Arc<G>,
    chunker: RequestChunker,
    acquire_timeout: Duration,
    progress: Option<ProgressFn>,
}

impl<G: QuotaGate + ?Sized> BatchFetchOrchestrator<G> {
    pub fn new(gate: Arc<G>, chunker: RequestChunker) -> Self {
        Self {
            gate,
            chunker,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            progress: None,
        }
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    fn report_progress(&self, done: usize, total: usize, message: &str) {
        if let Some(progress) = &self.progress {
            progress(done, total, message);
        }
    }

    /// Fetch every id, one quota unit per batch.
    ///
    /// Never fails as a whole: batch errors and quota denials end up in
    /// `failures`, and whatever succeeded is returned in `results`.
    pub async fn fetch<S, F, Fut, V>(&self, ids: &[S], mut fetch_one: F) -> FetchReport<V>
    where
        S: AsRef<str>,
        F: FnMut(Vec<String>) -> Fut,
        Fut: Future<Output = Result<BTreeMap<String, V>>>,
    {
        let mut report = FetchReport {
            results: BTreeMap::new(),
            requested: ids.len(),
            received: 0,
            total_batches: 0,
            failures: Vec::new(),
        };
        if ids.is_empty() {
            return report;
        }

        let estimated = self.chunker.estimate_batch_count(ids);
        self.report_progress(0, estimated, "Starting batched fetch");

        for (position, batch) in self.chunker.chunks(ids).enumerate() {
            let batch_index = position + 1;
            let batch: Vec<String> = batch.into_iter().map(str::to_string).collect();
            report.total_batches = batch_index;

            info!(
                resource = %self.gate.resource(),
                batch = batch_index,
                estimated_batches = estimated,
                size = batch.len(),
                "Processing batch"
            );
            self.report_progress(batch_index, estimated, "Processing batch");

            if !self.gate.acquire(Some(self.acquire_timeout)).await {
                let denial = RatekeeperError::QuotaTimeout {
                    resource: self.gate.resource().to_string(),
                    timeout: self.acquire_timeout,
                };
                warn!(batch = batch_index, error = %denial, "Batch skipped");
                report.failures.push(BatchFailure {
                    batch_index,
                    ids: batch,
                    error: denial.to_string(),
                });
                continue;
            }

            match fetch_one(batch.clone()).await {
                Ok(results) => report.results.extend(results),
                Err(e) => {
                    error!(
                        batch = batch_index,
                        size = batch.len(),
                        sample = ?&batch[..batch.len().min(5)],
                        error = %e,
                        "Batch failed"
                    );
                    report.failures.push(BatchFailure {
                        batch_index,
                        ids: batch,
                        error: e.to_string(),
                    });
                }
            }
        }

        report.received = report.results.len();
        info!(
            resource = %self.gate.resource(),
            requested = report.requested,
            received = report.received,
            failed_batches = report.failures.len(),
            "Batched fetch finished"
        );
        if !report.failures.is_empty() {
            let failed: Vec<usize> = report.failures.iter().map(|f| f.batch_index).collect();
            warn!(batches = ?failed, "Some batches failed");
        }

        report
    }
}
