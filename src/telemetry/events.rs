use crate::fallback::{FallbackKind, FallbackReason};
use crate::rate_limit::Priority;
use crate::throttle::{LevelSource, ThrottleLevel};
use std::fmt;
use std::time::Duration;

#[cfg(feature = "telemetry-json")]
use serde_json::json;

/// Admission events emitted by every component.
///
/// Breaker transitions, throttle level changes, rate limit refusals, retries and fallbacks are
/// all reported through this one type so a single sink can observe the whole admission path.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionEvent {
    /// Circuit breaker transitions
    Circuit(CircuitEvent),
    /// Adaptive throttle level changes
    Throttle(ThrottleEvent),
    /// Rate limiter and concurrency gate refusals
    RateLimit(RateLimitEvent),
    /// Retry engine events
    Retry(RetryEvent),
    /// Fallback chain outcomes
    Fallback(FallbackEvent),
}

/// Events emitted by circuit breakers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitEvent {
    /// Circuit transitioned to open state.
    ///
    /// Subsequent calls are rejected without reaching the downstream until the reset timeout
    /// elapses.
    Opened {
        /// Downstream service name
        service: String,
        /// Failures that triggered the open
        failure_count: u64,
        /// Outcomes considered
        request_count: u64,
    },
    /// Circuit transitioned to half-open state.
    ///
    /// A limited number of probe calls are let through.
    HalfOpen {
        /// Downstream service name
        service: String,
    },
    /// Circuit transitioned to closed state.
    Closed {
        /// Downstream service name
        service: String,
    },
}

/// Events emitted by the adaptive throttle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleEvent {
    /// The published level changed.
    LevelChanged {
        /// Previous level
        from: ThrottleLevel,
        /// New level
        to: ThrottleLevel,
        /// What produced the new level
        source: LevelSource,
    },
}

/// Events emitted when admission is refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitEvent {
    /// A caller hit its tier limit.
    Throttled {
        /// Caller key
        caller: String,
        /// Tier the caller was accounted under
        priority: Priority,
        /// Retry hint returned to the caller
        retry_after: Duration,
    },
    /// The in-flight cap was reached.
    ConcurrencyLimited {
        /// Calls in flight
        in_flight: usize,
        /// Published cap
        max_concurrent: usize,
    },
}

/// Events emitted by the retry engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    /// A retry attempt is about to be made.
    ///
    /// Emitted before sleeping and retrying a failed call.
    Attempt {
        /// Downstream service name
        service: String,
        /// The attempt about to run (1-indexed; the first retry is attempt 2)
        attempt: u32,
        /// The backoff delay before this retry
        delay: Duration,
    },
    /// All retry attempts have been exhausted.
    Exhausted {
        /// Downstream service name
        service: String,
        /// Total number of attempts made
        total_attempts: u32,
        /// Total time spent on the request
        total_duration: Duration,
    },
    /// Remaining retries were abandoned.
    Abandoned {
        /// Downstream service name
        service: String,
        /// Attempts made before abandoning
        attempts: u32,
        /// Why retrying stopped
        reason: AbandonReason,
    },
}

/// Why the retry engine stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    /// The next sleep or attempt would run past the request deadline.
    Deadline,
    /// The breaker opened while retrying.
    CircuitOpen,
}

impl AbandonReason {
    /// Snake-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AbandonReason::Deadline => "deadline",
            AbandonReason::CircuitOpen => "circuit_open",
        }
    }
}

/// Events emitted by the fallback chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackEvent {
    /// A fallback produced the response.
    Served {
        /// Downstream service name
        service: String,
        /// Which fallback answered
        kind: FallbackKind,
        /// Why the fallback chain ran
        reason: FallbackReason,
    },
    /// Every enabled fallback declined.
    Unavailable {
        /// Downstream service name
        service: String,
        /// Why the fallback chain ran
        reason: FallbackReason,
    },
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionEvent::Circuit(event) => write!(f, "Circuit::{}", event),
            AdmissionEvent::Throttle(event) => write!(f, "Throttle::{}", event),
            AdmissionEvent::RateLimit(event) => write!(f, "RateLimit::{}", event),
            AdmissionEvent::Retry(event) => write!(f, "Retry::{}", event),
            AdmissionEvent::Fallback(event) => write!(f, "Fallback::{}", event),
        }
    }
}

impl fmt::Display for CircuitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitEvent::Opened { service, failure_count, request_count } => {
                write!(f, "Opened({}, failures={}/{})", service, failure_count, request_count)
            }
            CircuitEvent::HalfOpen { service } => write!(f, "HalfOpen({})", service),
            CircuitEvent::Closed { service } => write!(f, "Closed({})", service),
        }
    }
}

impl fmt::Display for ThrottleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThrottleEvent::LevelChanged { from, to, source } => {
                write!(f, "LevelChanged({} -> {}, {})", from, to, source)
            }
        }
    }
}

impl fmt::Display for RateLimitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitEvent::Throttled { caller, priority, retry_after } => {
                write!(f, "Throttled({}@{}, retry_after={:?})", caller, priority, retry_after)
            }
            RateLimitEvent::ConcurrencyLimited { in_flight, max_concurrent } => {
                write!(f, "ConcurrencyLimited({}/{})", in_flight, max_concurrent)
            }
        }
    }
}

impl fmt::Display for RetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryEvent::Attempt { service, attempt, delay } => {
                write!(f, "Attempt({}, #{}, delay={:?})", service, attempt, delay)
            }
            RetryEvent::Exhausted { service, total_attempts, total_duration } => write!(
                f,
                "Exhausted({}, attempts={}, duration={:?})",
                service, total_attempts, total_duration
            ),
            RetryEvent::Abandoned { service, attempts, reason } => {
                write!(f, "Abandoned({}, attempts={}, {})", service, attempts, reason.as_str())
            }
        }
    }
}

impl fmt::Display for FallbackEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackEvent::Served { service, kind, reason } => {
                write!(f, "Served({}, {}, {})", service, kind, reason)
            }
            FallbackEvent::Unavailable { service, reason } => {
                write!(f, "Unavailable({}, {})", service, reason)
            }
        }
    }
}

#[cfg_attr(not(feature = "telemetry-json"), allow(dead_code))]
#[inline]
fn clamp_u64(val: u128) -> u64 {
    val.min(u128::from(u64::MAX)) as u64
}

/// Convert an AdmissionEvent into a JSON value for sinks.
#[cfg(feature = "telemetry-json")]
pub fn event_to_json(event: &AdmissionEvent) -> serde_json::Value {
    match event {
        AdmissionEvent::Circuit(c) => match c {
            CircuitEvent::Opened { service, failure_count, request_count } => json!({
                "kind": "circuit_opened",
                "service": service,
                "failures": *failure_count,
                "requests": *request_count,
            }),
            CircuitEvent::HalfOpen { service } => {
                json!({ "kind": "circuit_half_open", "service": service })
            }
            CircuitEvent::Closed { service } => {
                json!({ "kind": "circuit_closed", "service": service })
            }
        },
        AdmissionEvent::Throttle(ThrottleEvent::LevelChanged { from, to, source }) => json!({
            "kind": "throttle_level_changed",
            "from": from.as_str(),
            "to": to.as_str(),
            "source": source.as_str(),
        }),
        AdmissionEvent::RateLimit(r) => match r {
            RateLimitEvent::Throttled { caller, priority, retry_after } => json!({
                "kind": "rate_limited",
                "caller": caller,
                "priority": priority.as_str(),
                "retry_after_ms": clamp_u64(retry_after.as_millis()),
            }),
            RateLimitEvent::ConcurrencyLimited { in_flight, max_concurrent } => json!({
                "kind": "concurrency_limited",
                "in_flight": *in_flight,
                "max": *max_concurrent,
            }),
        },
        AdmissionEvent::Retry(r) => match r {
            RetryEvent::Attempt { service, attempt, delay } => json!({
                "kind": "retry_attempt",
                "service": service,
                "attempt": *attempt,
                "delay_ms": clamp_u64(delay.as_millis()),
            }),
            RetryEvent::Exhausted { service, total_attempts, total_duration } => json!({
                "kind": "retry_exhausted",
                "service": service,
                "attempts": *total_attempts,
                "duration_ms": clamp_u64(total_duration.as_millis()),
            }),
            RetryEvent::Abandoned { service, attempts, reason } => json!({
                "kind": "retry_abandoned",
                "service": service,
                "attempts": *attempts,
                "reason": reason.as_str(),
            }),
        },
        AdmissionEvent::Fallback(fb) => match fb {
            FallbackEvent::Served { service, kind, reason } => json!({
                "kind": "fallback_served",
                "service": service,
                "fallback": kind.as_str(),
                "reason": reason.as_str(),
            }),
            FallbackEvent::Unavailable { service, reason } => json!({
                "kind": "fallback_unavailable",
                "service": service,
                "reason": reason.as_str(),
            }),
        },
    }
}
