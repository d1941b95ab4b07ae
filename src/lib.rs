#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # tollgate
//!
//! Traffic admission and resilience core for services that call other services.
//!
//! ## Features
//!
//! - **Tiered rate limiting** over per-caller sliding windows, with a burst allowance per tier
//! - **Circuit breakers** per downstream service, with prefix-based group overrides
//! - **Adaptive throttling** driven by CPU, memory and I/O pressure, with staleness handling
//! - **Retry policies** (immediate, linear, exponential; capped and jittered) under a per-request
//!   time budget
//! - **Fallback chain**: cache, then degraded response, then an alternative endpoint
//! - **Telemetry events** for every transition, delivered without blocking the request path
//! - **Tower middleware** so any `tower::Service` can sit behind the dispatcher
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use tollgate::telemetry::{EventBus, MemorySink};
//! use tollgate::{CallerIdentity, Dispatcher, PolicyConfig, Priority, StaticFallback};
//!
//! #[tokio::main]
//! async fn main() {
//!     let sink = MemorySink::new();
//!     let dispatcher = Dispatcher::<String, std::io::Error>::builder(PolicyConfig::default())
//!         .events(EventBus::new(sink.clone()))
//!         .degraded_fallback(StaticFallback::new("cached price list".to_string()))
//!         .build()
//!         .expect("valid config");
//!
//!     // Feed resource pressure from your metrics collector.
//!     dispatcher.throttle().on_resource_sample(0.42, 0.55, 0.10);
//!
//!     let caller = CallerIdentity::new("tenant-42", Priority::Normal);
//!     let served = dispatcher
//!         .dispatch(&caller, "pricing", |service| {
//!             let service = service.to_string();
//!             async move { Ok(format!("fresh prices from {service}")) }
//!         })
//!         .await
//!         .expect("served");
//!     assert_eq!(served.value, "fresh prices from pricing");
//! }
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fallback;
pub mod jitter;
pub mod prelude;
pub mod rate_limit;
pub mod retry;
pub mod sleeper;
pub mod snapshot;
pub mod telemetry;
pub mod throttle;
pub mod window;

// Re-exports
pub use backoff::{RetryStrategy, MAX_BACKOFF};
pub use circuit_breaker::{
    CallPermission, CircuitBreakerConfig, CircuitSettings, CircuitSnapshot, CircuitState,
    OutcomeTally, ServiceGroupOverride,
};
pub use circuit_breaker_registry::CircuitBreakerRegistry;
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{PolicyConfig, DEFAULT_REQUEST_BUDGET};
pub use dispatch::{
    AdmissionRequest, DispatchLayer, DispatchService, Dispatcher, DispatcherBuilder, Routed,
    Served, ServedFrom,
};
pub use error::{ConfigError, DispatchError, ThrottleReason};
pub use fallback::{
    Fallback, FallbackChain, FallbackContext, FallbackKind, FallbackReason, FallbackToggles,
    ResponseCache, StaticFallback,
};
pub use jitter::Jitter;
pub use rate_limit::{
    Admission, CallerIdentity, EffectiveLimits, Priority, RateLimitConfig, RateLimitPolicy,
    RateLimiter,
};
pub use retry::{RetryOverride, RetryPolicy, RetryTable};
pub use sleeper::{InstantSleeper, ManualClockSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use snapshot::Published;
pub use throttle::{
    AdaptiveThrottle, CombineRule, LevelProfiles, LevelSource, ResourceSample, ResourceSampler,
    ResourceThresholds, ThrottleConfig, ThrottleLevel, ThrottleProfile, ThrottleSnapshot,
};
pub use window::{SlidingWindow, WindowAdmission, WindowCounter};
