//! Retry delay strategies.
//!
//! A [`RetryStrategy`] is a tagged enum evaluated by one function, [`RetryStrategy::delay`].
//! Retry numbering: `retry = 0` is the initial call (no delay) and retries start at `retry = 1`.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use tollgate::RetryStrategy;
//!
//! let strategy = RetryStrategy::exponential(Duration::from_millis(100), 2.0);
//! assert_eq!(strategy.delay(0), Duration::ZERO); // initial call
//! assert_eq!(strategy.delay(1), Duration::from_millis(100));
//! assert_eq!(strategy.delay(3), Duration::from_millis(400));
//!
//! let linear = RetryStrategy::linear(Duration::from_millis(50), Duration::from_millis(25));
//! assert_eq!(linear.delay(3), Duration::from_millis(100));
//! ```
//!
//! Overflow behavior: computations that would overflow saturate to `MAX_BACKOFF` (1 day).

use crate::error::ConfigError;
use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// How long to wait before each retry.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum RetryStrategy {
    /// Retry straight away.
    Immediate,
    /// `base + increment × (retry − 1)`.
    Linear {
        /// Delay before the first retry.
        base: Duration,
        /// Added for each further retry.
        increment: Duration,
    },
    /// `base × multiplier^(retry − 1)`.
    Exponential {
        /// Delay before the first retry.
        base: Duration,
        /// Growth factor, at least 1.
        multiplier: f64,
    },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::Exponential { base: Duration::from_millis(100), multiplier: 2.0 }
    }
}

impl RetryStrategy {
    /// Create a linear strategy.
    pub fn linear(base: Duration, increment: Duration) -> Self {
        RetryStrategy::Linear { base, increment }
    }

    /// Create an exponential strategy.
    pub fn exponential(base: Duration, multiplier: f64) -> Self {
        RetryStrategy::Exponential { base, multiplier }
    }

    /// Delay before retry number `retry` (0 = initial call, no delay).
    pub fn delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let steps = retry - 1;
        let delay = match *self {
            RetryStrategy::Immediate => Duration::ZERO,
            RetryStrategy::Linear { base, increment } => increment
                .checked_mul(steps)
                .and_then(|grown| base.checked_add(grown))
                .unwrap_or(MAX_BACKOFF),
            RetryStrategy::Exponential { base, multiplier } => {
                let exponent = i32::try_from(steps).unwrap_or(i32::MAX);
                let nanos = base.as_nanos() as f64 * multiplier.powi(exponent);
                if nanos.is_finite() && nanos < MAX_BACKOFF.as_nanos() as f64 {
                    Duration::from_nanos(nanos.max(0.0).round() as u64)
                } else {
                    MAX_BACKOFF
                }
            }
        };
        delay.min(MAX_BACKOFF)
    }

    /// Reject exponential multipliers below 1 or not finite.
    pub fn validate(&self, field: &str) -> Result<(), ConfigError> {
        match *self {
            RetryStrategy::Exponential { multiplier, .. }
                if !(multiplier.is_finite() && multiplier >= 1.0) =>
            {
                Err(ConfigError::OutOfRange {
                    field: format!("{field}.multiplier"),
                    value: multiplier,
                    min: 1.0,
                    max: f64::MAX,
                })
            }
            _ => Ok(()),
        }
    }
}
