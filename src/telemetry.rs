//! Telemetry and observability for the admission path.
//!
//! Every component reports its transitions as an [`AdmissionEvent`]. Events flow through
//! [`TelemetrySink`] implementations which can log, aggregate, or forward them to external
//! systems.
//!
//! # Event Types
//!
//! - **Circuit**: `Opened`, `HalfOpen`, `Closed`
//! - **Throttle**: `LevelChanged`
//! - **RateLimit**: `Throttled`, `ConcurrencyLimited`
//! - **Retry**: `Attempt`, `Exhausted`, `Abandoned`
//! - **Fallback**: `Served`, `Unavailable`
//!
//! # Telemetry Sinks
//!
//! The `TelemetrySink` trait is implemented as a `tower::Service<AdmissionEvent>` for
//! composability. Components never await a sink: they publish through an [`EventBus`], which
//! delivers each event without blocking and counts the ones it has to drop.
//!
//! ```rust
//! use tollgate::telemetry::{AdmissionEvent, CircuitEvent, EventBus, MemorySink};
//!
//! let sink = MemorySink::new();
//! let bus = EventBus::new(sink.clone());
//! bus.publish(AdmissionEvent::Circuit(CircuitEvent::Closed { service: "db".into() }));
//!
//! assert_eq!(sink.len(), 1);
//! assert_eq!(bus.dropped(), 0);
//! ```

pub mod events;
pub mod sinks;

pub use events::{
    AbandonReason, AdmissionEvent, CircuitEvent, FallbackEvent, RateLimitEvent, RetryEvent,
    ThrottleEvent,
};
#[cfg(feature = "telemetry-json")]
pub use events::event_to_json;
pub use sinks::{
    LogSink, MemorySink, MulticastSink, MulticastSinkError, NonBlockingSink, TelemetrySink,
};

use futures::FutureExt;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tower::ServiceExt;

/// Sink deliveries an [`EventBus`] lets run on the runtime at once.
pub const DEFAULT_MAX_PENDING: usize = 1024;

type Emit = dyn Fn(AdmissionEvent) -> bool + Send + Sync;

// Releases one pending-delivery slot when the spawned delivery ends.
struct PendingSlot(Arc<AtomicUsize>);

impl PendingSlot {
    fn try_acquire(pending: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| Self(Arc::clone(pending)))
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Fire-and-forget publisher shared by every component.
///
/// Wraps a [`TelemetrySink`]. `publish` polls the sink once: sinks that complete immediately
/// (memory, log, non-blocking) are delivered inline; a sink future that is still pending is
/// handed to the current tokio runtime, at most `max_pending` at a time. A sink that is not
/// ready, fails, panics, or has no runtime to run on loses the event, and the loss is counted.
/// For sinks that do I/O, put a [`NonBlockingSink`] in front.
#[derive(Clone)]
pub struct EventBus {
    emit: Option<Arc<Emit>>,
    dropped: Arc<AtomicU64>,
    pending: Arc<AtomicUsize>,
}

impl EventBus {
    /// Publish to `sink`, with up to [`DEFAULT_MAX_PENDING`] deliveries in flight.
    pub fn new<S>(sink: S) -> Self
    where
        S: TelemetrySink + Sync,
        S::Future: Send + 'static,
    {
        Self::with_max_pending(sink, DEFAULT_MAX_PENDING)
    }

    /// Publish to `sink`, dropping events once `max_pending` deliveries are still running.
    pub fn with_max_pending<S>(sink: S, max_pending: usize) -> Self
    where
        S: TelemetrySink + Sync,
        S::Future: Send + 'static,
    {
        let pending = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::clone(&pending);
        let deliver = move |event: AdmissionEvent| -> bool {
            let mut sink = sink.clone();
            match ServiceExt::<AdmissionEvent>::ready(&mut sink).now_or_never() {
                Some(Ok(_)) => {}
                _ => return false,
            }
            let mut call = Box::pin(sink.call(event));
            if let Some(result) = (&mut call).now_or_never() {
                return result.is_ok();
            }
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                return false;
            };
            let Some(slot) = PendingSlot::try_acquire(&in_flight, max_pending) else {
                return false;
            };
            handle.spawn(async move {
                let _slot = slot;
                if let Err(err) = call.await {
                    tracing::debug!(error = %err, "telemetry sink failed");
                }
            });
            true
        };
        let emit = move |event: AdmissionEvent| -> bool {
            catch_unwind(AssertUnwindSafe(|| deliver(event))).unwrap_or_else(|_| {
                tracing::warn!("telemetry sink panicked; event dropped");
                false
            })
        };
        Self { emit: Some(Arc::new(emit)), dropped: Arc::new(AtomicU64::new(0)), pending }
    }

    /// Bus that discards everything without counting.
    pub fn disabled() -> Self {
        Self {
            emit: None,
            dropped: Arc::new(AtomicU64::new(0)),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Deliver `event` without blocking.
    pub fn publish(&self, event: AdmissionEvent) {
        if let Some(emit) = &self.emit {
            if !emit(event) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("telemetry event dropped");
            }
        }
    }

    /// Events the sink could not take.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Deliveries still running on the runtime.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// True when events go somewhere.
    pub fn is_enabled(&self) -> bool {
        self.emit.is_some()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::disabled()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("enabled", &self.is_enabled())
            .field("dropped", &self.dropped())
            .field("pending", &self.pending())
            .finish()
    }
}
