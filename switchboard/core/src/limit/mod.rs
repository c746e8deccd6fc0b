//! Admission Control
//!
//! Two small building blocks used by the protocol and the reconnect loop:
//!
//! - [`RateLimiter`]: token bucket, `acquire` waits for a token or for cancellation
//! - [`Backoff`]: growing retry delay with jitter, reset on success
//!
//! Both resolve (rather than fail) when their [`Signal`](crate::signal::Signal)
//! is cancelled. Being told to stop waiting is not an error.

mod backoff;
mod rate;

pub use backoff::{Backoff, BackoffConfig};
pub use rate::{LimiterMetrics, RateLimitConfig, RateLimitResult, RateLimiter};
