//! Rate limiting primitives.
//!
//! This module provides the building blocks for per-caller admission:
//! - [`CallerIdentity`] and [`Priority`]: who is asking, and under which tier.
//! - [`RateLimitPolicy`] / [`RateLimitConfig`]: the per-tier limits.
//! - [`RateLimiter`]: sliding-window admission with a burst allowance.
//! - [`Admission`]: the result of a rate limit check (Admit/Throttle).
//!
//! # Architecture
//!
//! Each priority tier owns an independent [`crate::window::WindowCounter`], so a critical caller
//! never borrows headroom from the low tier and vice versa. The adaptive throttle scales the
//! configured limits at call time through a published
//! [`ThrottleSnapshot`](crate::throttle::ThrottleSnapshot); the policies themselves stay
//! immutable.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub mod limiter;
pub mod policy;
pub use limiter::{EffectiveLimits, RateLimiter};
pub use policy::{RateLimitConfig, RateLimitPolicy};

/// Priority tier of a caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Priority {
    /// Highest tier.
    Critical,
    /// Elevated tier.
    High,
    /// Default tier.
    #[default]
    Normal,
    /// Best-effort tier.
    Low,
}

impl Priority {
    /// Every tier, highest first.
    pub const ALL: [Priority; 4] = [Priority::Critical, Priority::High, Priority::Normal, Priority::Low];

    /// Lowercase tier name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is making a request. Immutable for the life of the request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallerIdentity {
    key: Arc<str>,
    priority: Priority,
}

impl CallerIdentity {
    /// Caller `key` accounted under `priority`.
    pub fn new(key: impl Into<Arc<str>>, priority: Priority) -> Self {
        Self { key: key.into(), priority }
    }

    /// Opaque caller key (API key, tenant id, client address).
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Tier the caller is accounted under.
    pub fn priority(&self) -> Priority {
        self.priority
    }
}

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.key, self.priority)
    }
}

/// The decision returned by the rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The request is admitted and has been counted.
    Admit {
        /// In-window count including this request.
        count: u64,
        /// Requests left in the window before throttling.
        /// Useful for `X-RateLimit-Remaining` headers.
        remaining: u64,
        /// Admitted above the steady limit, out of the burst allowance.
        burst: bool,
    },
    /// The request is refused and was not counted.
    Throttle {
        /// How long the caller should wait before retrying. Always non-zero.
        /// Useful for `Retry-After` headers.
        retry_after: Duration,
        /// In-window count at the time of the decision.
        count: u64,
        /// Effective limit that was hit.
        limit: u64,
    },
}

impl Admission {
    /// Helper to check if admitted.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admit { .. })
    }

    /// Helper to check if admitted out of the burst allowance.
    pub fn is_burst(&self) -> bool {
        matches!(self, Admission::Admit { burst: true, .. })
    }

    /// Retry hint of a throttle decision.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Admission::Throttle { retry_after, .. } => Some(*retry_after),
            Admission::Admit { .. } => None,
        }
    }
}
