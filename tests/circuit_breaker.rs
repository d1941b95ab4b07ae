use std::sync::Arc;
use std::time::Duration;
use tollgate::telemetry::{AdmissionEvent, CircuitEvent, EventBus, MemorySink};
use tollgate::{
    CallPermission, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, ManualClock,
    ServiceGroupOverride,
};

fn registry(config: CircuitBreakerConfig) -> (CircuitBreakerRegistry, ManualClock, MemorySink) {
    let clock = ManualClock::starting_at(10_000);
    let sink = MemorySink::new();
    let registry = CircuitBreakerRegistry::new(config)
        .expect("valid config")
        .with_clock(Arc::new(clock.clone()))
        .with_events(EventBus::new(sink.clone()));
    (registry, clock, sink)
}

fn opened_count(sink: &MemorySink) -> usize {
    sink.events_matching(|e| matches!(e, AdmissionEvent::Circuit(CircuitEvent::Opened { .. })))
        .len()
}

#[test]
fn six_failures_in_ten_open_then_half_open_after_reset() {
    let config = CircuitBreakerConfig {
        error_threshold: 0.5,
        min_requests: 10,
        reset_timeout: Duration::from_secs(30),
        ..CircuitBreakerConfig::default()
    };
    let (registry, clock, sink) = registry(config);

    // Successes first so the ratio only reaches the threshold on the last report.
    for _ in 0..4 {
        assert!(registry.before_call("ledger").is_proceed());
        registry.report_outcome("ledger", true);
    }
    for _ in 0..6 {
        assert!(registry.before_call("ledger").is_proceed());
        registry.report_outcome("ledger", false);
    }
    assert_eq!(registry.state("ledger"), CircuitState::Open);
    assert_eq!(opened_count(&sink), 1);

    match registry.before_call("ledger") {
        CallPermission::Reject { retry_after } => assert_eq!(retry_after, Duration::from_secs(30)),
        other => panic!("expected reject, got {other:?}"),
    }

    clock.advance(Duration::from_secs(30));
    assert_eq!(registry.before_call("ledger"), CallPermission::Proceed);
    assert_eq!(registry.state("ledger"), CircuitState::HalfOpen);
    let snapshot = registry.circuit("ledger").expect("record exists");
    assert_eq!(snapshot.probes_in_flight, 1);
}

#[test]
fn below_min_requests_never_opens() {
    let config = CircuitBreakerConfig { min_requests: 10, ..CircuitBreakerConfig::default() };
    let (registry, _, sink) = registry(config);
    for _ in 0..9 {
        registry.report_outcome("cache", false);
    }
    assert_eq!(registry.state("cache"), CircuitState::Closed);
    assert!(sink.is_empty());
}

#[test]
fn failing_probe_after_two_successes_reopens_with_zeroed_counters() {
    let config = CircuitBreakerConfig {
        min_requests: 3,
        reset_timeout: Duration::from_secs(5),
        ..CircuitBreakerConfig::default()
    };
    let (registry, clock, sink) = registry(config);
    for _ in 0..3 {
        registry.report_outcome("search", false);
    }
    assert_eq!(registry.state("search"), CircuitState::Open);

    clock.advance(Duration::from_secs(5));
    for _ in 0..3 {
        assert!(registry.before_call("search").is_proceed());
    }
    registry.report_outcome("search", true);
    registry.report_outcome("search", true);
    assert_eq!(registry.circuit("search").map(|s| s.successes_in_probe), Some(2));
    registry.report_outcome("search", false);

    let snapshot = registry.circuit("search").expect("record exists");
    assert_eq!(snapshot.state, CircuitState::Open);
    assert_eq!(snapshot.successes_in_probe, 0);
    assert_eq!(snapshot.probes_in_flight, 0);
    assert_eq!(opened_count(&sink), 2);
}

#[test]
fn single_success_then_failure_in_half_open_reopens() {
    let config = CircuitBreakerConfig {
        min_requests: 2,
        reset_timeout: Duration::from_secs(1),
        ..CircuitBreakerConfig::default()
    };
    let (registry, clock, _) = registry(config);
    registry.report_outcome("s", false);
    registry.report_outcome("s", false);
    clock.advance(Duration::from_secs(1));

    assert!(registry.before_call("s").is_proceed());
    registry.report_outcome("s", true);
    assert!(registry.before_call("s").is_proceed());
    registry.report_outcome("s", false);

    let snapshot = registry.circuit("s").expect("record exists");
    assert_eq!(snapshot.state, CircuitState::Open);
    assert_eq!(snapshot.successes_in_probe, 0);
}

#[test]
fn unreported_calls_do_not_corrupt_transitions() {
    let config = CircuitBreakerConfig {
        min_requests: 2,
        reset_timeout: Duration::from_secs(2),
        ..CircuitBreakerConfig::default()
    };
    let (registry, clock, sink) = registry(config);

    // Closed: permissions without reports change nothing.
    registry.report_outcome("inv", true);
    for _ in 0..20 {
        assert!(registry.before_call("inv").is_proceed());
    }
    assert_eq!(registry.circuit("inv").map(|s| s.window.total()), Some(1));

    registry.report_outcome("inv", false);
    registry.report_outcome("inv", false);
    assert_eq!(registry.state("inv"), CircuitState::Open);

    // Half-open: both probes are taken and never reported.
    clock.advance(Duration::from_secs(2));
    assert!(registry.before_call("inv").is_proceed());
    assert!(registry.before_call("inv").is_proceed());
    assert!(!registry.before_call("inv").is_proceed());

    // Abandoned probes release their slots after another reset timeout.
    clock.advance(Duration::from_secs(2));
    assert!(registry.before_call("inv").is_proceed());
    registry.report_outcome("inv", true);
    assert!(registry.before_call("inv").is_proceed());
    registry.report_outcome("inv", true);
    assert_eq!(registry.state("inv"), CircuitState::Closed);
    assert_eq!(opened_count(&sink), 1);
}

#[test]
fn cancelled_permission_frees_the_probe_slot() {
    let config = CircuitBreakerConfig {
        min_requests: 1,
        reset_timeout: Duration::from_secs(1),
        ..CircuitBreakerConfig::default()
    };
    let (registry, clock, _) = registry(config);
    registry.report_outcome("p", false);
    clock.advance(Duration::from_secs(1));

    assert!(registry.before_call("p").is_proceed());
    assert!(!registry.before_call("p").is_proceed());
    registry.cancel_call("p");
    assert!(registry.before_call("p").is_proceed());
}

#[test]
fn group_overrides_apply_by_prefix() {
    let config = CircuitBreakerConfig { min_requests: 10, ..CircuitBreakerConfig::default() }
        .with_override(ServiceGroupOverride::new("payments-").min_requests(2).error_threshold(0.9));
    let (registry, _, _) = registry(config);

    registry.report_outcome("payments-eu", false);
    registry.report_outcome("payments-eu", false);
    registry.report_outcome("search", false);
    registry.report_outcome("search", false);

    assert_eq!(registry.state("payments-eu"), CircuitState::Open);
    assert_eq!(registry.state("search"), CircuitState::Closed);
}

#[test]
fn racing_failures_and_successes_open_at_most_once() {
    let config = CircuitBreakerConfig { min_requests: 20, ..CircuitBreakerConfig::default() };
    let (registry, _, sink) = registry(config);
    let registry = Arc::new(registry);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for n in 0..100 {
                    registry.report_outcome("shared", (i + n) % 4 == 0);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(registry.state("shared"), CircuitState::Open);
    assert_eq!(opened_count(&sink), 1);
}

#[test]
fn invalid_reset_timeout_is_rejected() {
    let config = CircuitBreakerConfig { reset_timeout: Duration::ZERO, ..CircuitBreakerConfig::default() };
    let err = CircuitBreakerRegistry::new(config).unwrap_err();
    assert!(err.to_string().contains("circuit_breaker.reset_timeout"));
}
