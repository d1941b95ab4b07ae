//! Convenient re-exports for common tollgate types.
pub use crate::{
    fallback::{Fallback, FallbackContext, FallbackKind, ResponseCache, StaticFallback},
    rate_limit::{CallerIdentity, Priority},
    retry::{RetryPolicy, RetryTable},
    telemetry::{AdmissionEvent, EventBus, LogSink, MemorySink, TelemetrySink},
    throttle::{ResourceSample, ResourceSampler, ThrottleLevel},
    DispatchError, DispatchLayer, Dispatcher, Jitter, PolicyConfig, Routed, RetryStrategy, Served,
};
