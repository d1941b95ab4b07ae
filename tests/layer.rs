mod common;

use common::test_helpers::{harness, harness_with, TestError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tollgate::{
    AdmissionRequest, CallerIdentity, CircuitBreakerConfig, DispatchError, DispatchLayer,
    PolicyConfig, Priority, RateLimitPolicy, Routed, StaticFallback,
};
use tower::{service_fn, ServiceBuilder, ServiceExt};

#[derive(Debug, Clone)]
struct Lookup {
    tenant: &'static str,
    sku: u32,
}

impl AdmissionRequest for Lookup {
    fn caller(&self) -> CallerIdentity {
        CallerIdentity::new(self.tenant, Priority::High)
    }

    fn service(&self) -> &str {
        "inventory"
    }
}

#[tokio::test]
async fn custom_requests_flow_through_the_layer() {
    let h = harness(PolicyConfig::default());
    let dispatcher = Arc::new(h.dispatcher);
    let svc = ServiceBuilder::new()
        .layer(DispatchLayer::new(Arc::clone(&dispatcher)))
        .service(service_fn(|req: Lookup| async move {
            Ok::<_, TestError>(format!("sku {} for {}", req.sku, req.tenant))
        }));

    let response = svc.oneshot(Lookup { tenant: "acme", sku: 7 }).await.unwrap();
    assert_eq!(response, "sku 7 for acme");
    assert_eq!(dispatcher.breakers().circuit("inventory").map(|s| s.window.successes), Some(1));
}

#[tokio::test]
async fn layer_throttles_before_calling_inner() {
    let mut config = PolicyConfig::default();
    config.rate_limits = config
        .rate_limits
        .with_policy(Priority::Low, RateLimitPolicy::per_second(1.0, 1));
    let h = harness(config);
    let layer = DispatchLayer::new(Arc::new(h.dispatcher));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let inner = service_fn(move |_req: Routed<u8>| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, TestError>("ok".to_string()) }
    });
    let svc = ServiceBuilder::new().layer(layer).service(inner);
    let caller = CallerIdentity::new("bulk", Priority::Low);

    svc.clone().oneshot(Routed::new(caller.clone(), "export", 1)).await.unwrap();
    let err = svc.oneshot(Routed::new(caller, "export", 2)).await.unwrap_err();

    assert!(matches!(err, DispatchError::Throttled { .. }));
    assert!(err.retry_after().unwrap_or_default() > Duration::ZERO);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn open_circuit_behind_layer_serves_fallback() {
    let config = PolicyConfig {
        circuit_breaker: CircuitBreakerConfig { min_requests: 1, ..CircuitBreakerConfig::default() },
        ..PolicyConfig::default()
    };
    let h = harness_with(config, |b| b.degraded_fallback(StaticFallback::new("stale".to_string())));
    h.dispatcher.breakers().report_outcome("inventory", false);

    let svc = ServiceBuilder::new()
        .layer(DispatchLayer::new(Arc::new(h.dispatcher)))
        .service(service_fn(|_req: Lookup| async { Ok::<_, TestError>("fresh".to_string()) }));

    let response = svc.oneshot(Lookup { tenant: "acme", sku: 1 }).await.unwrap();
    assert_eq!(response, "stale");
}
