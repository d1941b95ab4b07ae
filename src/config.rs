//! Top-level policy configuration.
//!
//! [`PolicyConfig`] gathers every component's settings in one value that can be built in code or,
//! with the `serde` feature, deserialized from a file. Missing sections take their defaults.
//! Validation runs once when the dispatcher is built; invalid values are reported, never clamped.

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::ConfigError;
use crate::fallback::FallbackToggles;
use crate::rate_limit::RateLimitConfig;
use crate::retry::RetryTable;
use crate::throttle::ThrottleConfig;
use std::time::Duration;

/// Default end-to-end budget for one request, retries included.
pub const DEFAULT_REQUEST_BUDGET: Duration = Duration::from_secs(10);

/// Everything the dispatcher needs to know.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PolicyConfig {
    /// Per-priority rate tiers.
    pub rate_limits: RateLimitConfig,
    /// Breaker defaults and per-group overrides.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Resource thresholds, level profiles and staleness.
    pub throttle: ThrottleConfig,
    /// Retry policies by service prefix.
    pub retry: RetryTable,
    /// Which fallback stages may run.
    pub fallback: FallbackToggles,
    /// Total time allowed per request.
    pub request_budget: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            rate_limits: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            throttle: ThrottleConfig::default(),
            retry: RetryTable::default(),
            fallback: FallbackToggles::default(),
            request_budget: DEFAULT_REQUEST_BUDGET,
        }
    }
}

impl PolicyConfig {
    /// Replace the request budget.
    pub fn with_request_budget(mut self, budget: Duration) -> Self {
        self.request_budget = budget;
        self
    }

    /// Check every section; the first problem found is returned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rate_limits.validate()?;
        self.circuit_breaker.validate()?;
        self.throttle.validate()?;
        self.retry.validate()?;
        self.fallback.validate()?;
        ConfigError::non_zero("request_budget", self.request_budget)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::{Priority, RateLimitPolicy};

    #[test]
    fn defaults_validate() {
        let config = PolicyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.request_budget, Duration::from_secs(10));
        assert_eq!(config.circuit_breaker.min_requests, 10);
    }

    #[test]
    fn zero_budget_is_rejected() {
        let err = PolicyConfig::default().with_request_budget(Duration::ZERO).validate().unwrap_err();
        assert_eq!(err, ConfigError::ZeroDuration { field: "request_budget".into() });
    }

    #[test]
    fn nested_errors_keep_their_path() {
        let mut config = PolicyConfig::default();
        config.rate_limits =
            config.rate_limits.with_policy(Priority::High, RateLimitPolicy::per_second(-1.0, 5));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().starts_with("rate_limits.high.base_rate"), "{err}");
    }
}
