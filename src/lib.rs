//! Pacer - Request Rate Limiter with Retry
//!
//! This crate serializes calls to rate-limited third-party APIs. Operations
//! submitted to a [`RateLimiter`] run one at a time in submission order, with
//! their start times spaced at least a minimum interval apart. Failed
//! operations are retried with a configurable backoff before the failure is
//! reported back to the caller.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod runner;

pub use config::{LimiterConfig, PacerConfig};
pub use error::{ExecuteError, PacerError, Result};
pub use ratelimit::{Backoff, Execution, LimiterRegistry, LimiterStats, RateLimiter};
