//! Retry policies and the per-service policy table.
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial try + retries); `1` disables retrying.
//! - The delay before retry `n` is the strategy's delay, capped at `max_delay`, then jittered.
//! - The table picks a policy by service-name prefix; the first matching prefix wins and
//!   unmatched services use the default policy.
//!
//! The dispatcher drives the retry loop itself because every retry must also re-check the
//! circuit breaker and the request deadline.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use tollgate::{Jitter, RetryPolicy, RetryStrategy, RetryTable};
//!
//! let table = RetryTable::new(RetryPolicy::default()).with_prefix(
//!     "search-",
//!     RetryPolicy::new(RetryStrategy::Immediate, 5).with_jitter(Jitter::None),
//! );
//! assert_eq!(table.policy_for("search-eu").max_attempts, 5);
//! assert_eq!(table.policy_for("billing").max_attempts, 3);
//! ```

use crate::backoff::RetryStrategy;
use crate::error::ConfigError;
use crate::jitter::Jitter;
use rand::Rng;
use std::time::Duration;

/// Retry behaviour for one group of services.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryPolicy {
    /// Delay schedule.
    pub strategy: RetryStrategy,
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Cap applied before jitter.
    pub max_delay: Option<Duration>,
    /// Randomisation applied last.
    pub jitter: Jitter,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::default(),
            max_attempts: 3,
            max_delay: Some(Duration::from_secs(5)),
            jitter: Jitter::Full,
        }
    }
}

impl RetryPolicy {
    /// `strategy` for up to `max_attempts` total attempts, no cap, no jitter.
    pub fn new(strategy: RetryStrategy, max_attempts: u32) -> Self {
        Self { strategy, max_attempts, max_delay: None, jitter: Jitter::None }
    }

    /// Single attempt, never retried.
    pub fn no_retry() -> Self {
        Self::new(RetryStrategy::Immediate, 1)
    }

    /// Cap every delay.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Randomise delays.
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// True when another attempt is allowed after `attempts` have been made.
    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before retry `retry` (1-indexed).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.delay_with_rng(retry, &mut rand::rng())
    }

    /// Delay before retry `retry` using `rng` for jitter.
    pub fn delay_with_rng<R: Rng>(&self, retry: u32, rng: &mut R) -> Duration {
        let raw = self.strategy.delay(retry);
        let capped = self.max_delay.map_or(raw, |cap| raw.min(cap));
        self.jitter.apply_with_rng(capped, rng)
    }

    /// Check attempts, delays and the strategy.
    pub fn validate(&self, field: &str) -> Result<(), ConfigError> {
        ConfigError::count(format!("{field}.max_attempts"), u64::from(self.max_attempts))?;
        self.strategy.validate(&format!("{field}.strategy"))?;
        if let Some(max_delay) = self.max_delay {
            ConfigError::non_zero(format!("{field}.max_delay"), max_delay)?;
        }
        Ok(())
    }
}

/// Policy for services whose name starts with `prefix`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryOverride {
    /// Service-name prefix.
    pub prefix: String,
    /// Policy for matching services.
    pub policy: RetryPolicy,
}

/// Retry policies selected by service name.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RetryTable {
    /// Policy for services matching no prefix.
    pub default: RetryPolicy,
    /// First matching prefix wins.
    pub overrides: Vec<RetryOverride>,
}

impl RetryTable {
    /// Table with only a default policy.
    pub fn new(default: RetryPolicy) -> Self {
        Self { default, overrides: Vec::new() }
    }

    /// Append a prefix rule.
    pub fn with_prefix(mut self, prefix: impl Into<String>, policy: RetryPolicy) -> Self {
        self.overrides.push(RetryOverride { prefix: prefix.into(), policy });
        self
    }

    /// Policy for `service`.
    pub fn policy_for(&self, service: &str) -> &RetryPolicy {
        self.overrides
            .iter()
            .find(|rule| service.starts_with(rule.prefix.as_str()))
            .map_or(&self.default, |rule| &rule.policy)
    }

    /// Check every policy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.default.validate("retry.default")?;
        for (i, rule) in self.overrides.iter().enumerate() {
            rule.policy.validate(&format!("retry.overrides[{i}]"))?;
        }
        Ok(())
    }
}
