//! Token bucket rate limiter
//!
//! The bucket holds up to `burst` tokens and refills continuously at `rate`
//! tokens per second. Each admission consumes one token. When the bucket is
//! empty, [`RateLimiter::acquire`] sleeps exactly until the next token is due.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::MuxError;
use crate::signal::Signal;

/// Refill rounding slack, so a sleep of exactly the computed delay admits
const EPSILON: f64 = 1e-9;

// =============================================================================
// Configuration
// =============================================================================

/// Token bucket parameters
///
/// Serializes to the compact `{"b": burst, "r": rate}` shape used in the
/// handshake's limiter advertisement. Config files may spell the keys out.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Bucket size; the number of admissions allowed back to back
    #[serde(rename = "b", alias = "burst")]
    pub burst: f64,

    /// Refill rate in tokens per second
    #[serde(rename = "r", alias = "rate")]
    pub rate: f64,
}

impl RateLimitConfig {
    /// Create a configuration
    #[must_use]
    pub fn new(burst: f64, rate: f64) -> Self {
        Self { burst, rate }
    }

    /// Default limits for call starts when the server advertises none
    #[must_use]
    pub fn default_calls() -> Self {
        Self::new(10.0, 5.0)
    }

    /// Default limits for data packets when the server advertises none
    #[must_use]
    pub fn default_packets() -> Self {
        Self::new(50.0, 100.0)
    }

    /// Reject a bucket that could never admit anything
    pub fn validate(&self) -> Result<(), MuxError> {
        if !self.burst.is_finite() || self.burst < 1.0 {
            return Err(MuxError::InvalidConfig(format!(
                "rate limiter burst must be at least 1, got {}",
                self.burst
            )));
        }
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Err(MuxError::InvalidConfig(format!(
                "rate limiter rate must be positive, got {}",
                self.rate
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Results & Metrics
// =============================================================================

/// Outcome of a non-blocking [`RateLimiter::check`]
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RateLimitResult {
    /// A token was consumed
    Allowed,

    /// No token available yet
    Throttled {
        /// Time until the next token is due
        delay: Duration,
    },
}

impl RateLimitResult {
    /// Whether a token was consumed
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// The wait until the next token, if throttled
    #[must_use]
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Self::Throttled { delay } => Some(*delay),
            Self::Allowed => None,
        }
    }
}

/// Snapshot of a limiter's counters
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LimiterMetrics {
    /// Admissions granted
    pub admitted: u64,
    /// Admissions that had to wait for a refill first
    pub throttled: u64,
    /// Tokens currently in the bucket
    pub available_tokens: f64,
}

// =============================================================================
// Limiter
// =============================================================================

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket limiter
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    bucket: Mutex<Bucket>,
    admitted: AtomicU64,
    throttled: AtomicU64,
}

impl RateLimiter {
    /// Build a limiter with a full bucket
    ///
    /// # Errors
    ///
    /// [`MuxError::InvalidConfig`] when `burst < 1` or `rate <= 0`.
    pub fn new(config: RateLimitConfig) -> Result<Self, MuxError> {
        config.validate()?;
        Ok(Self {
            config,
            bucket: Mutex::new(Bucket {
                tokens: config.burst,
                last_refill: Instant::now(),
            }),
            admitted: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
        })
    }

    /// The limiter's configuration
    #[must_use]
    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Try to take a token without waiting
    pub fn check(&self) -> RateLimitResult {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);

        if bucket.tokens + EPSILON >= 1.0 {
            bucket.tokens = (bucket.tokens - 1.0).max(0.0);
            self.admitted.fetch_add(1, Ordering::Relaxed);
            RateLimitResult::Allowed
        } else {
            let missing = 1.0 - bucket.tokens;
            // Tiny rates put the next token beyond what a Duration can hold
            let delay = Duration::try_from_secs_f64(missing / self.config.rate)
                .unwrap_or(Duration::MAX);
            RateLimitResult::Throttled { delay }
        }
    }

    /// Wait for a token
    ///
    /// Returns `true` once a token is consumed, `false` if `signal` cancelled
    /// first. A cancelled wait consumes nothing.
    pub async fn acquire(&self, signal: &Signal) -> bool {
        let mut waited = false;
        loop {
            if signal.is_cancelled() {
                return false;
            }
            match self.check() {
                RateLimitResult::Allowed => {
                    if waited {
                        self.throttled.fetch_add(1, Ordering::Relaxed);
                    }
                    return true;
                }
                RateLimitResult::Throttled { delay } => {
                    waited = true;
                    tracing::trace!(delay = ?delay, "Rate limited, waiting");
                    tokio::select! {
                        biased;
                        () = signal.cancelled() => return false,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Tokens currently available, after refilling
    #[must_use]
    pub fn available_tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        bucket.tokens
    }

    /// Counter snapshot
    #[must_use]
    pub fn metrics(&self) -> LimiterMetrics {
        LimiterMetrics {
            admitted: self.admitted.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            available_tokens: self.available_tokens(),
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            bucket.tokens = (bucket.tokens + elapsed * self.config.rate).min(self.config.burst);
            bucket.last_refill = now;
        }
    }
}
