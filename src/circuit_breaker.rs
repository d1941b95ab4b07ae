//! Circuit breaker configuration and the per-service state machine.
//!
//! ```text
//!            failure ratio ≥ threshold            reset_timeout elapsed
//!  Closed ─────────────────────────────▶ Open ─────────────────────────▶ HalfOpen
//!    ▲                                    ▲                                 │
//!    │                                    └──────── any probe failure ──────┤
//!    └───────────────────── min_requests probe successes ───────────────────┘
//! ```
//!
//! A [`ServiceCircuit`] holds one service's record. It is never shared directly: the
//! [`CircuitBreakerRegistry`](crate::circuit_breaker_registry::CircuitBreakerRegistry) keeps one
//! per service behind its own mutex, so every transition of a service is serialized.

use crate::clock::duration_millis;
use crate::error::ConfigError;
use crate::window::{SlidingWindow, DEFAULT_BUCKETS_PER_WINDOW};
use std::fmt;
use std::ops::Add;
use std::time::Duration;

/// Current state of a service's circuit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Normal operating mode.
    #[default]
    Closed,
    /// Short-circuits calls until the reset timeout elapses.
    Open,
    /// Probe mode allowing a limited number of calls to test recovery.
    HalfOpen,
}

impl CircuitState {
    /// Snake-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answer to "may I call this service?". A rejection is a verdict, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPermission {
    /// Go ahead and report the outcome afterwards.
    Proceed,
    /// Fail fast.
    Reject {
        /// Time until the breaker will consider admitting a call again.
        retry_after: Duration,
    },
}

impl CallPermission {
    /// Helper to check if the call may proceed.
    pub fn is_proceed(&self) -> bool {
        matches!(self, CallPermission::Proceed)
    }
}

/// Settings replaced for services whose name starts with `prefix`.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ServiceGroupOverride {
    /// Service-name prefix this override applies to.
    pub prefix: String,
    /// Replacement failure ratio.
    pub error_threshold: Option<f64>,
    /// Replacement open duration.
    pub reset_timeout: Option<Duration>,
    /// Replacement minimum sample size.
    pub min_requests: Option<u32>,
}

impl ServiceGroupOverride {
    /// Override applying to services named `prefix*`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into(), ..Self::default() }
    }

    /// Replace the failure ratio.
    pub fn error_threshold(mut self, threshold: f64) -> Self {
        self.error_threshold = Some(threshold);
        self
    }

    /// Replace the open duration.
    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = Some(timeout);
        self
    }

    /// Replace the minimum sample size.
    pub fn min_requests(mut self, min: u32) -> Self {
        self.min_requests = Some(min);
        self
    }
}

/// Breaker settings shared by every service, plus ordered per-group overrides.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CircuitBreakerConfig {
    /// Failure ratio in the outcome window that opens the circuit.
    pub error_threshold: f64,
    /// Outcomes needed before the ratio is trusted; also the half-open probe quota.
    pub min_requests: u32,
    /// How long the circuit stays open before probing.
    pub reset_timeout: Duration,
    /// Length of the outcome window.
    pub window: Duration,
    /// Sub-window buckets in the outcome window.
    pub buckets_per_window: u32,
    /// First matching prefix wins.
    pub overrides: Vec<ServiceGroupOverride>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold: 0.5,
            min_requests: 10,
            reset_timeout: Duration::from_secs(30),
            window: Duration::from_secs(60),
            buckets_per_window: DEFAULT_BUCKETS_PER_WINDOW,
            overrides: Vec::new(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Append a per-group override.
    pub fn with_override(mut self, group: ServiceGroupOverride) -> Self {
        self.overrides.push(group);
        self
    }

    /// Settings for `service`: the first override whose prefix matches, over the defaults.
    pub fn settings_for(&self, service: &str) -> CircuitSettings {
        let defaults = CircuitSettings {
            error_threshold: self.error_threshold,
            min_requests: self.min_requests,
            reset_timeout: self.reset_timeout,
        };
        match self.overrides.iter().find(|o| service.starts_with(o.prefix.as_str())) {
            Some(group) => CircuitSettings {
                error_threshold: group.error_threshold.unwrap_or(defaults.error_threshold),
                min_requests: group.min_requests.unwrap_or(defaults.min_requests),
                reset_timeout: group.reset_timeout.unwrap_or(defaults.reset_timeout),
            },
            None => defaults,
        }
    }

    /// Check defaults and every override.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::unit_interval("circuit_breaker.error_threshold", self.error_threshold)?;
        ConfigError::count("circuit_breaker.min_requests", u64::from(self.min_requests))?;
        ConfigError::non_zero("circuit_breaker.reset_timeout", self.reset_timeout)?;
        ConfigError::non_zero("circuit_breaker.window", self.window)?;
        ConfigError::count("circuit_breaker.buckets_per_window", u64::from(self.buckets_per_window))?;
        for (i, group) in self.overrides.iter().enumerate() {
            let field = format!("circuit_breaker.overrides[{i}]");
            if let Some(threshold) = group.error_threshold {
                ConfigError::unit_interval(format!("{field}.error_threshold"), threshold)?;
            }
            if let Some(min) = group.min_requests {
                ConfigError::count(format!("{field}.min_requests"), u64::from(min))?;
            }
            if let Some(timeout) = group.reset_timeout {
                ConfigError::non_zero(format!("{field}.reset_timeout"), timeout)?;
            }
        }
        Ok(())
    }
}

/// Settings resolved for one service.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitSettings {
    /// Failure ratio that opens the circuit.
    pub error_threshold: f64,
    /// Configured minimum sample size, before throttle scaling.
    pub min_requests: u32,
    /// Open duration.
    pub reset_timeout: Duration,
}

impl CircuitSettings {
    /// `min_requests` scaled under throttle pressure: `max(1, ceil(min_requests × scale))`.
    pub fn scaled_min_requests(&self, scale: f64) -> u32 {
        let scaled = (f64::from(self.min_requests) * scale - 1e-9).ceil();
        if scaled.is_nan() || scaled < 1.0 {
            1
        } else if scaled >= f64::from(u32::MAX) {
            u32::MAX
        } else {
            scaled as u32
        }
    }
}

/// Successes and failures in one outcome bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeTally {
    /// Successful calls.
    pub successes: u64,
    /// Failed calls.
    pub failures: u64,
}

impl OutcomeTally {
    /// Outcomes counted.
    pub fn total(&self) -> u64 {
        self.successes.saturating_add(self.failures)
    }
}

impl Add for OutcomeTally {
    type Output = OutcomeTally;

    fn add(self, rhs: Self) -> Self {
        OutcomeTally {
            successes: self.successes.saturating_add(rhs.successes),
            failures: self.failures.saturating_add(rhs.failures),
        }
    }
}

/// Read-only view of a service's record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Successful probes in the current half-open period.
    pub successes_in_probe: u32,
    /// Probes admitted and not yet reported.
    pub probes_in_flight: u32,
    /// Outcomes in the closed-state window.
    pub window: OutcomeTally,
    /// Clock milliseconds of the latest transition.
    pub last_transition_millis: u64,
}

/// State change produced by a call or report; the registry turns these into events and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    Opened { failure_count: u64, request_count: u64 },
    HalfOpened,
    Closed,
}

/// One service's breaker record.
#[derive(Debug)]
pub(crate) struct ServiceCircuit {
    settings: CircuitSettings,
    state: CircuitState,
    outcomes: SlidingWindow<OutcomeTally>,
    consecutive_failures: u32,
    successes_in_probe: u32,
    probes_in_flight: u32,
    last_probe_millis: u64,
    last_transition_millis: u64,
}

impl ServiceCircuit {
    pub(crate) fn new(settings: CircuitSettings, config: &CircuitBreakerConfig, now: u64) -> Self {
        Self {
            settings,
            state: CircuitState::Closed,
            outcomes: SlidingWindow::new(config.window, config.buckets_per_window),
            consecutive_failures: 0,
            successes_in_probe: 0,
            probes_in_flight: 0,
            last_probe_millis: now,
            last_transition_millis: now,
        }
    }

    pub(crate) fn state(&self) -> CircuitState {
        self.state
    }

    fn reset_millis(&self) -> u64 {
        duration_millis(self.settings.reset_timeout)
    }

    fn trip(&mut self, now: u64) {
        self.state = CircuitState::Open;
        self.last_transition_millis = now;
        self.successes_in_probe = 0;
        self.probes_in_flight = 0;
        self.outcomes.clear();
    }

    fn close(&mut self, now: u64) {
        self.state = CircuitState::Closed;
        self.last_transition_millis = now;
        self.consecutive_failures = 0;
        self.successes_in_probe = 0;
        self.probes_in_flight = 0;
        self.outcomes.clear();
    }

    // Probes that were admitted but never reported stop holding a slot after `reset_timeout`.
    fn expire_stale_probes(&mut self, now: u64) {
        if self.probes_in_flight > 0
            && now.saturating_sub(self.last_probe_millis) >= self.reset_millis()
        {
            self.probes_in_flight = 0;
        }
    }

    pub(crate) fn before_call(
        &mut self,
        now: u64,
        min_requests: u32,
    ) -> (CallPermission, Option<Transition>) {
        match self.state {
            CircuitState::Closed => (CallPermission::Proceed, None),
            CircuitState::Open => {
                let elapsed = now.saturating_sub(self.last_transition_millis);
                let reset = self.reset_millis();
                if elapsed >= reset {
                    self.state = CircuitState::HalfOpen;
                    self.last_transition_millis = now;
                    self.successes_in_probe = 0;
                    self.probes_in_flight = 1;
                    self.last_probe_millis = now;
                    (CallPermission::Proceed, Some(Transition::HalfOpened))
                } else {
                    let retry_after = Duration::from_millis(reset - elapsed);
                    (CallPermission::Reject { retry_after }, None)
                }
            }
            CircuitState::HalfOpen => {
                self.expire_stale_probes(now);
                if self.successes_in_probe >= min_requests {
                    self.close(now);
                    return (CallPermission::Proceed, Some(Transition::Closed));
                }
                if self.successes_in_probe + self.probes_in_flight < min_requests {
                    self.probes_in_flight += 1;
                    self.last_probe_millis = now;
                    (CallPermission::Proceed, None)
                } else {
                    let waited = now.saturating_sub(self.last_probe_millis);
                    let retry_after =
                        Duration::from_millis(self.reset_millis().saturating_sub(waited).max(1));
                    (CallPermission::Reject { retry_after }, None)
                }
            }
        }
    }

    pub(crate) fn on_outcome(
        &mut self,
        success: bool,
        now: u64,
        min_requests: u32,
    ) -> Option<Transition> {
        match self.state {
            CircuitState::Closed => {
                self.outcomes.bump(now, |tally| {
                    if success {
                        tally.successes += 1;
                    } else {
                        tally.failures += 1;
                    }
                });
                if success {
                    self.consecutive_failures = 0;
                } else {
                    self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                }

                let tally = self.outcomes.fold(now, OutcomeTally::default(), |acc, t| acc + *t);
                let total = tally.total();
                let ratio = tally.failures as f64 / total.max(1) as f64;
                if tally.failures > 0
                    && total >= u64::from(min_requests)
                    && ratio >= self.settings.error_threshold
                {
                    self.trip(now);
                    Some(Transition::Opened { failure_count: tally.failures, request_count: total })
                } else {
                    None
                }
            }
            // Late reports from calls admitted before the trip.
            CircuitState::Open => None,
            CircuitState::HalfOpen => {
                self.probes_in_flight = self.probes_in_flight.saturating_sub(1);
                if success {
                    self.consecutive_failures = 0;
                    self.successes_in_probe += 1;
                    if self.successes_in_probe >= min_requests {
                        self.close(now);
                        return Some(Transition::Closed);
                    }
                    None
                } else {
                    self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                    let request_count = u64::from(self.successes_in_probe) + 1;
                    self.trip(now);
                    Some(Transition::Opened { failure_count: 1, request_count })
                }
            }
        }
    }

    /// Give back a probe slot for a call that was admitted but never made.
    pub(crate) fn cancel(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.probes_in_flight = self.probes_in_flight.saturating_sub(1);
        }
    }

    pub(crate) fn force_close(&mut self, now: u64) -> Option<Transition> {
        let was = self.state;
        self.close(now);
        (was != CircuitState::Closed).then_some(Transition::Closed)
    }

    pub(crate) fn snapshot(&mut self, now: u64) -> CircuitSnapshot {
        let window = self.outcomes.fold(now, OutcomeTally::default(), |acc, t| acc + *t);
        CircuitSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            successes_in_probe: self.successes_in_probe,
            probes_in_flight: self.probes_in_flight,
            window,
            last_transition_millis: self.last_transition_millis,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn circuit(threshold: f64, min: u32, reset_secs: u64) -> ServiceCircuit {
        let config = CircuitBreakerConfig {
            error_threshold: threshold,
            min_requests: min,
            reset_timeout: Duration::from_secs(reset_secs),
            ..CircuitBreakerConfig::default()
        };
        ServiceCircuit::new(config.settings_for("svc"), &config, 0)
    }

    #[test]
    fn opens_on_failure_ratio_regardless_of_order() {
        let mut c = circuit(0.5, 10, 30);
        for i in 0..10u64 {
            let success = i % 5 == 0 || i % 5 == 2;
            let t = c.on_outcome(success, i, 10);
            if i < 9 {
                assert_eq!(t, None, "opened early at report {i}");
            } else {
                assert_eq!(t, Some(Transition::Opened { failure_count: 6, request_count: 10 }));
            }
        }
        assert_eq!(c.state(), CircuitState::Open);
    }

    #[test]
    fn stays_closed_below_min_requests() {
        let mut c = circuit(0.5, 10, 30);
        for i in 0..9 {
            assert_eq!(c.on_outcome(false, i, 10), None);
        }
        assert_eq!(c.state(), CircuitState::Closed);
        assert_eq!(c.snapshot(9).consecutive_failures, 9);
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let mut c = circuit(0.9, 100, 30);
        c.on_outcome(false, 0, 100);
        c.on_outcome(false, 1, 100);
        c.on_outcome(true, 2, 100);
        assert_eq!(c.snapshot(3).consecutive_failures, 0);
    }

    #[test]
    fn zero_threshold_needs_a_failure() {
        let mut c = circuit(0.0, 2, 30);
        assert_eq!(c.on_outcome(true, 0, 2), None);
        assert_eq!(c.on_outcome(true, 1, 2), None);
        assert!(matches!(c.on_outcome(false, 2, 2), Some(Transition::Opened { .. })));
    }

    #[test]
    fn open_rejects_until_reset_timeout_then_admits_probe() {
        let mut c = circuit(0.5, 1, 30);
        c.on_outcome(false, 0, 1);
        assert_eq!(
            c.before_call(10_000, 1),
            (CallPermission::Reject { retry_after: Duration::from_secs(20) }, None)
        );
        assert_eq!(c.before_call(30_000, 1), (CallPermission::Proceed, Some(Transition::HalfOpened)));
        assert_eq!(c.state(), CircuitState::HalfOpen);
        assert!(!c.before_call(30_001, 1).0.is_proceed(), "probe quota is one");
    }

    #[test]
    fn reports_while_open_are_ignored() {
        let mut c = circuit(0.5, 1, 30);
        c.on_outcome(false, 0, 1);
        assert_eq!(c.on_outcome(true, 5, 1), None);
        assert_eq!(c.on_outcome(false, 6, 1), None);
        assert_eq!(c.snapshot(7).state, CircuitState::Open);
        assert_eq!(c.snapshot(7).last_transition_millis, 0);
    }

    #[test]
    fn probe_failure_reopens_and_zeroes_counters() {
        let mut c = circuit(0.5, 3, 30);
        for i in 0..3 {
            c.on_outcome(false, i, 3);
        }
        assert_eq!(c.before_call(30_002, 3).0, CallPermission::Proceed);
        assert_eq!(c.before_call(30_003, 3).0, CallPermission::Proceed);
        c.on_outcome(true, 30_004, 3);
        c.on_outcome(true, 30_005, 3);
        assert_eq!(c.snapshot(30_005).successes_in_probe, 2);

        assert_eq!(c.before_call(30_006, 3).0, CallPermission::Proceed);
        assert_eq!(
            c.on_outcome(false, 30_007, 3),
            Some(Transition::Opened { failure_count: 1, request_count: 3 })
        );
        let snap = c.snapshot(30_007);
        assert_eq!(snap.state, CircuitState::Open);
        assert_eq!(snap.successes_in_probe, 0);
        assert_eq!(snap.probes_in_flight, 0);
        assert_eq!(snap.last_transition_millis, 30_007);
    }

    #[test]
    fn enough_probe_successes_close() {
        let mut c = circuit(0.5, 2, 1);
        c.on_outcome(false, 0, 2);
        c.on_outcome(false, 1, 2);
        assert_eq!(c.before_call(1_001, 2).1, Some(Transition::HalfOpened));
        assert_eq!(c.before_call(1_002, 2).0, CallPermission::Proceed);
        assert_eq!(c.on_outcome(true, 1_003, 2), None);
        assert_eq!(c.on_outcome(true, 1_004, 2), Some(Transition::Closed));
        let snap = c.snapshot(1_004);
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.window, OutcomeTally::default());
    }

    #[test]
    fn unreported_probes_expire() {
        let mut c = circuit(0.5, 1, 10);
        c.on_outcome(false, 0, 1);
        assert!(c.before_call(10_000, 1).0.is_proceed());
        assert!(!c.before_call(15_000, 1).0.is_proceed());
        assert!(c.before_call(20_000, 1).0.is_proceed());
    }

    #[test]
    fn cancel_returns_probe_slot() {
        let mut c = circuit(0.5, 1, 10);
        c.on_outcome(false, 0, 1);
        assert!(c.before_call(10_000, 1).0.is_proceed());
        c.cancel();
        assert!(c.before_call(10_001, 1).0.is_proceed());
    }

    #[test]
    fn shrinking_quota_closes_on_next_call() {
        let mut c = circuit(0.5, 4, 1);
        c.on_outcome(false, 0, 4);
        for i in 0..4 {
            c.on_outcome(false, i, 4);
        }
        c.before_call(5_000, 4);
        c.before_call(5_000, 4);
        c.on_outcome(true, 5_001, 4);
        c.on_outcome(true, 5_002, 4);
        assert_eq!(c.before_call(5_003, 2), (CallPermission::Proceed, Some(Transition::Closed)));
    }

    #[test]
    fn overrides_first_match_wins() {
        let config = CircuitBreakerConfig::default()
            .with_override(ServiceGroupOverride::new("payments-").min_requests(3))
            .with_override(ServiceGroupOverride::new("payments").error_threshold(0.9));
        let s = config.settings_for("payments-eu");
        assert_eq!(s.min_requests, 3);
        assert_eq!(s.error_threshold, 0.5);
        assert_eq!(config.settings_for("payments").error_threshold, 0.9);
        assert_eq!(config.settings_for("search").min_requests, 10);
    }

    #[test]
    fn scaled_min_requests() {
        let settings = CircuitBreakerConfig::default().settings_for("x");
        assert_eq!(settings.scaled_min_requests(1.0), 10);
        assert_eq!(settings.scaled_min_requests(0.4), 4);
        assert_eq!(settings.scaled_min_requests(0.01), 1);
        assert_eq!(settings.scaled_min_requests(0.15), 2);
    }

    #[test]
    fn validation() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());
        let bad = CircuitBreakerConfig { error_threshold: 1.5, ..CircuitBreakerConfig::default() };
        assert!(matches!(bad.validate(), Err(ConfigError::OutOfRange { .. })));
        let bad_override = CircuitBreakerConfig::default()
            .with_override(ServiceGroupOverride::new("a").reset_timeout(Duration::ZERO));
        let err = bad_override.validate().unwrap_err();
        assert!(err.to_string().contains("overrides[0].reset_timeout"));
    }
}
