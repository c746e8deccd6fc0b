//! Retry backoff with jitter
//!
//! Each [`Backoff::error`] grows the delay as
//! `min(max, (base + current) × factor) × jitter`, where `jitter` is drawn
//! uniformly from `[1 − J, 1 + J]`. [`Backoff::success`] drops it back to zero.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::MuxError;
use crate::signal::Signal;

/// Backoff parameters
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay added on every error before growth (milliseconds)
    pub base_ms: u64,

    /// Cap on the delay before jitter (milliseconds)
    pub max_ms: u64,

    /// Multiplicative growth per error
    pub factor: f64,

    /// Jitter half-width `J`, in `[0, 1]`
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 250,
            max_ms: 30_000,
            factor: 2.0,
            jitter: 0.2,
        }
    }
}

impl BackoffConfig {
    /// Set the base delay
    #[must_use]
    pub fn with_base(mut self, base: Duration) -> Self {
        self.base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the delay cap
    #[must_use]
    pub fn with_max(mut self, max: Duration) -> Self {
        self.max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the growth factor
    #[must_use]
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Set the jitter half-width
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Disable jitter (deterministic delays)
    #[must_use]
    pub fn without_jitter(self) -> Self {
        self.with_jitter(0.0)
    }

    /// Check growth factor and jitter ranges
    pub fn validate(&self) -> Result<(), MuxError> {
        if !self.factor.is_finite() || self.factor <= 0.0 {
            return Err(MuxError::InvalidConfig(format!(
                "backoff factor must be positive, got {}",
                self.factor
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(MuxError::InvalidConfig(format!(
                "backoff jitter must be within [0, 1], got {}",
                self.jitter
            )));
        }
        Ok(())
    }
}

/// Stateful retry delay
#[derive(Clone, Debug)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
    errors: u32,
}

impl Backoff {
    /// Build a backoff starting at zero delay
    ///
    /// # Errors
    ///
    /// [`MuxError::InvalidConfig`] for a non-positive factor or jitter outside `[0, 1]`.
    pub fn new(config: BackoffConfig) -> Result<Self, MuxError> {
        config.validate()?;
        Ok(Self {
            config,
            current: Duration::ZERO,
            errors: 0,
        })
    }

    /// Record a failure and return the grown delay
    pub fn error(&mut self) -> Duration {
        let base = Duration::from_millis(self.config.base_ms).as_secs_f64();
        let max = Duration::from_millis(self.config.max_ms).as_secs_f64();

        let grown = ((base + self.current.as_secs_f64()) * self.config.factor).min(max);
        let secs = grown * self.jitter_factor();

        self.current = if secs.is_finite() && secs > 0.0 {
            Duration::from_secs_f64(secs)
        } else {
            Duration::ZERO
        };
        self.errors = self.errors.saturating_add(1);
        self.current
    }

    /// Record a success; the next delay starts from zero again
    pub fn success(&mut self) {
        self.current = Duration::ZERO;
        self.errors = 0;
    }

    /// The delay the next [`Backoff::timeout`] will sleep
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.current
    }

    /// Consecutive errors since the last success
    #[must_use]
    pub fn errors(&self) -> u32 {
        self.errors
    }

    /// Sleep the current delay, returning early if `signal` cancels
    ///
    /// Returns `true` when the full delay elapsed.
    pub async fn timeout(&self, signal: &Signal) -> bool {
        if self.current.is_zero() {
            return !signal.is_cancelled();
        }
        tokio::select! {
            biased;
            () = signal.cancelled() => false,
            () = tokio::time::sleep(self.current) => true,
        }
    }

    fn jitter_factor(&self) -> f64 {
        let j = self.config.jitter;
        if j <= 0.0 {
            return 1.0;
        }
        rand::thread_rng().gen_range((1.0 - j)..=(1.0 + j))
    }
}
