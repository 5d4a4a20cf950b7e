//! Batched fetching of large id lists under a quota.

mod chunker;
mod orchestrator;

pub use chunker::{Chunks, RequestChunker};
pub use orchestrator::{
    BatchFailure, BatchFetchOrchestrator, FetchReport, ProgressFn, DEFAULT_ACQUIRE_TIMEOUT,
};
