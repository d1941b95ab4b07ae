//! Per-tier rate limit policies.

use super::Priority;
use crate::error::ConfigError;
use crate::window::DEFAULT_BUCKETS_PER_WINDOW;
use std::time::Duration;

/// Limits for one priority tier.
///
/// Immutable once validated; the adaptive throttle scales `base_rate` and `burst_capacity` at
/// call time without touching the policy.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RateLimitPolicy {
    /// Steady requests per second.
    pub base_rate: f64,
    /// Maximum requests per window, including the burst allowance.
    pub burst_capacity: u32,
    /// Sliding window length.
    pub window: Duration,
}

impl RateLimitPolicy {
    /// `base_rate` req/s with `burst_capacity` per one-second window.
    pub fn per_second(base_rate: f64, burst_capacity: u32) -> Self {
        Self { base_rate, burst_capacity, window: Duration::from_secs(1) }
    }

    /// Override the window length.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Reject non-positive rates, zero bursts and zero windows.
    pub fn validate(&self, field: &str) -> Result<(), ConfigError> {
        ConfigError::positive(format!("{field}.base_rate"), self.base_rate)?;
        ConfigError::count(format!("{field}.burst_capacity"), u64::from(self.burst_capacity))?;
        ConfigError::non_zero(format!("{field}.window"), self.window)
    }
}

/// One policy per priority tier.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RateLimitConfig {
    /// Critical tier.
    pub critical: RateLimitPolicy,
    /// High tier.
    pub high: RateLimitPolicy,
    /// Normal tier.
    pub normal: RateLimitPolicy,
    /// Low tier.
    pub low: RateLimitPolicy,
    /// Sub-window buckets per window.
    pub buckets_per_window: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            critical: RateLimitPolicy::per_second(200.0, 400),
            high: RateLimitPolicy::per_second(100.0, 200),
            normal: RateLimitPolicy::per_second(50.0, 100),
            low: RateLimitPolicy::per_second(10.0, 20),
            buckets_per_window: DEFAULT_BUCKETS_PER_WINDOW,
        }
    }
}

impl RateLimitConfig {
    /// Policy for `priority`.
    pub fn policy(&self, priority: Priority) -> &RateLimitPolicy {
        match priority {
            Priority::Critical => &self.critical,
            Priority::High => &self.high,
            Priority::Normal => &self.normal,
            Priority::Low => &self.low,
        }
    }

    /// Replace the policy for `priority`.
    pub fn with_policy(mut self, priority: Priority, policy: RateLimitPolicy) -> Self {
        match priority {
            Priority::Critical => self.critical = policy,
            Priority::High => self.high = policy,
            Priority::Normal => self.normal = policy,
            Priority::Low => self.low = policy,
        }
        self
    }

    /// Validate every tier.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for priority in Priority::ALL {
            self.policy(priority).validate(&format!("rate_limits.{priority}"))?;
        }
        ConfigError::count("rate_limits.buckets_per_window", u64::from(self.buckets_per_window))
    }
}
