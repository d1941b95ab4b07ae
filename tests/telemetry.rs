use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use tollgate::telemetry::{
    AdmissionEvent, CircuitEvent, EventBus, MemorySink, MulticastSink, TelemetrySink,
};
use tollgate::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, ManualClock};
use tower::limit::ConcurrencyLimit;

fn registry(events: EventBus) -> CircuitBreakerRegistry {
    let config = CircuitBreakerConfig { min_requests: 1, ..CircuitBreakerConfig::default() };
    CircuitBreakerRegistry::new(config)
        .expect("valid config")
        .with_clock(Arc::new(ManualClock::new()))
        .with_events(events)
}

fn is_opened(event: &AdmissionEvent) -> bool {
    matches!(event, AdmissionEvent::Circuit(CircuitEvent::Opened { .. }))
}

#[test]
fn readiness_gated_sink_behind_multicast_receives_transitions() {
    let limited = MemorySink::new();
    let plain = MemorySink::new();
    let bus = EventBus::new(MulticastSink::new(
        ConcurrencyLimit::new(limited.clone(), 4),
        plain.clone(),
    ));
    let registry = registry(bus.clone());

    registry.report_outcome("db", false);

    assert_eq!(registry.state("db"), CircuitState::Open);
    assert_eq!(limited.events_matching(is_opened).len(), 1);
    assert_eq!(plain.events_matching(is_opened).len(), 1);
    assert_eq!(bus.dropped(), 0);
}

#[derive(Clone)]
struct Broken;

impl tower::Service<AdmissionEvent> for Broken {
    type Response = ();
    type Error = Infallible;
    type Future = std::future::Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: AdmissionEvent) -> Self::Future {
        panic!("broken sink");
    }
}

impl TelemetrySink for Broken {
    type SinkError = Infallible;
}

#[test]
fn panicking_sink_never_reaches_admission() {
    let bus = EventBus::new(Broken);
    let registry = registry(bus.clone());

    registry.report_outcome("db", false);
    assert!(!registry.before_call("db").is_proceed());

    assert_eq!(registry.state("db"), CircuitState::Open);
    assert_eq!(bus.dropped(), 1);
}
