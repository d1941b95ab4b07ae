//! Error types: configuration errors raised at construction, and the dispatch verdicts surfaced
//! to callers.
use crate::rate_limit::Priority;
use std::fmt;
use std::time::Duration;

/// Invalid policy configuration. Raised once, at construction time; values are never clamped.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// A rate or multiplier that must be strictly positive was not.
    #[error("{field} must be > 0 (got {value})")]
    NonPositive {
        /// Dotted path of the offending field.
        field: String,
        /// Value provided.
        value: f64,
    },
    /// A value fell outside its permitted range.
    #[error("{field} must be within [{min}, {max}] (got {value})")]
    OutOfRange {
        /// Dotted path of the offending field.
        field: String,
        /// Value provided.
        value: f64,
        /// Inclusive lower bound.
        min: f64,
        /// Inclusive upper bound.
        max: f64,
    },
    /// A duration that must be non-zero was zero.
    #[error("{field} must be a non-zero duration")]
    ZeroDuration {
        /// Dotted path of the offending field.
        field: String,
    },
    /// A count that must be non-zero was zero.
    #[error("{field} must be > 0")]
    ZeroCount {
        /// Dotted path of the offending field.
        field: String,
    },
    /// Thresholds must strictly ascend low < medium < high < critical.
    #[error("{field} thresholds must ascend (low {low} < medium {medium} < high {high} < critical {critical})")]
    NotAscending {
        /// Dotted path of the threshold table.
        field: String,
        /// Low threshold.
        low: f64,
        /// Medium threshold.
        medium: f64,
        /// High threshold.
        high: f64,
        /// Critical threshold.
        critical: f64,
    },
    /// Any other inconsistency between related fields.
    #[error("{field}: {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: String,
        /// What is wrong.
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn positive(field: impl Into<String>, value: f64) -> Result<(), ConfigError> {
        if value.is_finite() && value > 0.0 {
            Ok(())
        } else {
            Err(ConfigError::NonPositive { field: field.into(), value })
        }
    }

    pub(crate) fn unit_interval(field: impl Into<String>, value: f64) -> Result<(), ConfigError> {
        if (0.0..=1.0).contains(&value) {
            Ok(())
        } else {
            Err(ConfigError::OutOfRange { field: field.into(), value, min: 0.0, max: 1.0 })
        }
    }

    pub(crate) fn non_zero(field: impl Into<String>, duration: Duration) -> Result<(), ConfigError> {
        if duration.is_zero() {
            Err(ConfigError::ZeroDuration { field: field.into() })
        } else {
            Ok(())
        }
    }

    pub(crate) fn count(field: impl Into<String>, value: u64) -> Result<(), ConfigError> {
        if value == 0 {
            Err(ConfigError::ZeroCount { field: field.into() })
        } else {
            Ok(())
        }
    }
}

/// Why a request was throttled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleReason {
    /// The caller's tier window is full.
    RateLimit {
        /// Tier the caller was accounted under.
        priority: Priority,
    },
    /// The adaptive in-flight cap is reached.
    Concurrency {
        /// Calls in flight when rejected.
        in_flight: usize,
        /// Cap published by the adaptive throttle.
        max: usize,
    },
}

impl fmt::Display for ThrottleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThrottleReason::RateLimit { priority } => write!(f, "{} tier rate limit", priority),
            ThrottleReason::Concurrency { in_flight, max } => {
                write!(f, "concurrency limit ({} in flight, max {})", in_flight, max)
            }
        }
    }
}

/// Verdict for a request that was not served.
///
/// `Throttled` and `CircuitOpen` are expected control-flow signals and stay distinguishable from
/// downstream failures so callers can answer differently (e.g. HTTP 429 vs 503).
#[derive(Debug, Clone)]
pub enum DispatchError<E> {
    /// Admission refused; the caller should retry after the hint.
    Throttled {
        /// How long to wait before retrying.
        retry_after: Duration,
        /// Which limit refused the request.
        reason: ThrottleReason,
    },
    /// The service's circuit is open and no fallback served the request.
    CircuitOpen {
        /// Downstream service name.
        service: String,
        /// Time until the breaker will admit a probe.
        retry_after: Duration,
    },
    /// The downstream call failed and retries were exhausted or abandoned.
    Downstream {
        /// Attempts made, including the first.
        attempts: u32,
        /// The last failure, unwrapped.
        source: E,
    },
    /// The per-request time budget ran out.
    Timeout {
        /// Time spent on the request.
        elapsed: Duration,
        /// Configured budget.
        budget: Duration,
        /// Attempts started.
        attempts: u32,
    },
}

impl<E: fmt::Display> fmt::Display for DispatchError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Throttled { retry_after, reason } => {
                write!(f, "throttled by {}; retry after {:?}", reason, retry_after)
            }
            Self::CircuitOpen { service, retry_after } => write!(
                f,
                "service '{}' temporarily unavailable (circuit open, retry after {:?})",
                service, retry_after
            ),
            Self::Downstream { attempts, source } => {
                write!(f, "downstream failed after {} attempt(s): {}", attempts, source)
            }
            Self::Timeout { elapsed, budget, attempts } => write!(
                f,
                "request budget exhausted after {:?} (budget {:?}, {} attempt(s))",
                elapsed, budget, attempts
            ),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for DispatchError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Downstream { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl<E> DispatchError<E> {
    /// Check if this is an admission throttle.
    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::Throttled { .. })
    }

    /// Check if this is a fail-fast circuit rejection.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if the downstream itself failed.
    pub fn is_downstream(&self) -> bool {
        matches!(self, Self::Downstream { .. })
    }

    /// Check if the request budget ran out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Retry hint for throttled and circuit-open verdicts.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Throttled { retry_after, .. } | Self::CircuitOpen { retry_after, .. } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }

    /// Borrow the downstream failure if present.
    pub fn downstream(&self) -> Option<&E> {
        match self {
            Self::Downstream { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Take the downstream failure if present.
    pub fn into_source(self) -> Option<E> {
        match self {
            Self::Downstream { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Conventional HTTP status for the verdict.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Throttled { .. } => 429,
            Self::CircuitOpen { .. } => 503,
            Self::Downstream { .. } => 502,
            Self::Timeout { .. } => 504,
        }
    }
}
