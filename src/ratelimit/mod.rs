//! Rate limiting logic and state management.

mod backend;
mod keys;
mod limiter;
mod quota;
mod sync;
mod window;

pub use backend::QuotaGate;
pub use keys::QuotaKeys;
pub use limiter::{Admission, RateLimiter, RateLimiterOptions, WindowUsage, DEFAULT_SYNC_INTERVAL};
pub use quota::QuotaConfig;
pub use sync::{SyncJob, UsageSyncer};
pub use window::Window;
