//! Ratekeeper - Distributed Quota Enforcement for External APIs
//!
//! This crate keeps a fleet of worker processes within an external API's
//! minute, hour, day and month quotas. Counters live in a shared store
//! (Redis in production), so every worker draws from the same budget. On top
//! of the limiter sit a cross-process lock, URL-length aware batching of
//! large id lists, and a small provider layer for rate-limited HTTP APIs.

pub mod backends;
pub mod batch;
pub mod clock;
pub mod config;
pub mod error;
pub mod lock;
pub mod persistence;
pub mod provider;
pub mod ratelimit;
pub mod store;
