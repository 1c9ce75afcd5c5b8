//! Rate limiting, retry and queue management.

mod backoff;
mod job;
mod limiter;
mod registry;
mod stats;

pub use backoff::Backoff;
pub use job::Execution;
pub use limiter::RateLimiter;
pub use registry::LimiterRegistry;
pub use stats::LimiterStats;
