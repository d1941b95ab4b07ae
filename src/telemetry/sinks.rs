//! Sinks: where admission events end up.
//!
//! Every sink is a `tower::Service<AdmissionEvent>` and honours the readiness contract, so tower
//! middleware (`ConcurrencyLimit`, `Buffer`, `RateLimit`) can wrap or be wrapped by them.

use super::events::{AdmissionEvent, CircuitEvent, FallbackEvent, ThrottleEvent};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tower::Service;

type SinkFuture<E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send>>;
type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A telemetry sink that consumes admission events.
pub trait TelemetrySink:
    tower::Service<AdmissionEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Logs events through `tracing`.
///
/// Events an operator should act on (a circuit opening, throttle escalation, a request left
/// without a fallback) are logged at `warn`, the rest at `info`.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl LogSink {
    fn needs_attention(event: &AdmissionEvent) -> bool {
        match event {
            AdmissionEvent::Circuit(CircuitEvent::Opened { .. }) => true,
            AdmissionEvent::Throttle(ThrottleEvent::LevelChanged { from, to, .. }) => to > from,
            AdmissionEvent::Fallback(FallbackEvent::Unavailable { .. }) => true,
            _ => false,
        }
    }
}

impl Service<AdmissionEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = std::future::Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        if Self::needs_attention(&event) {
            tracing::warn!(event = %event, "admission_event");
        } else {
            tracing::info!(event = %event, "admission_event");
        }
        std::future::ready(Ok(()))
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Keeps events in memory, oldest first.
///
/// Bounded: once `capacity` events are held, the oldest is evicted and counted.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<AdmissionEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Sink holding up to 10 000 events.
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// Sink holding up to `capacity` events (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    fn guard(&self) -> MutexGuard<'_, VecDeque<AdmissionEvent>> {
        self.events.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Stored events, oldest first.
    pub fn events(&self) -> Vec<AdmissionEvent> {
        self.guard().iter().cloned().collect()
    }

    /// Stored events accepted by `filter`.
    pub fn events_matching<F>(&self, filter: F) -> Vec<AdmissionEvent>
    where
        F: Fn(&AdmissionEvent) -> bool,
    {
        self.guard().iter().filter(|e| filter(e)).cloned().collect()
    }

    /// Drop every stored event.
    pub fn clear(&self) {
        self.guard().clear();
    }

    /// Number of stored events.
    pub fn len(&self) -> usize {
        self.guard().len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    /// Maximum stored events.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events evicted to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<AdmissionEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = std::future::Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        let mut guard = self.guard();
        if guard.len() >= self.capacity {
            guard.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(event);
        std::future::ready(Ok(()))
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// Hands events to a worker task over a bounded channel.
///
/// `call` never waits: when the channel is full the event is dropped and counted. The worker
/// awaits the inner sink's readiness before every delivery, so slow or I/O-bound sinks (a file,
/// a socket) never hold up the admission path. Must be constructed inside a tokio runtime.
#[derive(Clone)]
pub struct NonBlockingSink {
    tx: tokio::sync::mpsc::Sender<AdmissionEvent>,
    dropped: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl std::fmt::Debug for NonBlockingSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonBlockingSink")
            .field("capacity", &self.tx.max_capacity())
            .field("dropped", &self.dropped())
            .field("failed", &self.failed())
            .finish()
    }
}

impl NonBlockingSink {
    /// Forward events to `sink` from a worker task, buffering up to `capacity`.
    pub fn with_capacity<S>(sink: S, capacity: usize) -> Self
    where
        S: tower::Service<AdmissionEvent, Response = ()> + Send + 'static,
        S::Error: std::error::Error + Send + 'static,
        S::Future: Send + 'static,
    {
        let (tx, mut rx) = tokio::sync::mpsc::channel(capacity.max(1));
        let failed = Arc::new(AtomicU64::new(0));
        let failures = Arc::clone(&failed);
        let mut sink = sink;

        tokio::spawn(async move {
            use tower::ServiceExt;
            while let Some(event) = rx.recv().await {
                let delivered = match sink.ready().await {
                    Ok(ready) => ready.call(event).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = delivered {
                    failures.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(error = %err, "telemetry sink rejected event");
                }
            }
        });

        Self { tx, dropped: Arc::new(AtomicU64::new(0)), failed }
    }

    /// Events dropped because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Events the inner sink refused or failed to deliver.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

impl tower::Service<AdmissionEvent> for NonBlockingSink {
    type Response = ();
    type Error = Infallible;
    type Future = std::future::Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        std::future::ready(Ok(()))
    }
}

impl TelemetrySink for NonBlockingSink {
    type SinkError = Infallible;
}

/// Failure of one side of a [`MulticastSink`].
#[derive(Debug, thiserror::Error)]
pub enum MulticastSinkError {
    /// The primary sink failed; the secondary may still have received the event.
    #[error("primary telemetry sink failed: {0}")]
    Primary(#[source] BoxError),
    /// The secondary sink failed.
    #[error("secondary telemetry sink failed: {0}")]
    Secondary(#[source] BoxError),
}

/// Sends every event to both sinks.
///
/// Ready only when both sides are ready; a failure on one side does not stop delivery to the
/// other.
#[derive(Clone, Debug)]
pub struct MulticastSink<A, B> {
    primary: A,
    secondary: B,
}

impl<A, B> MulticastSink<A, B> {
    /// Fan out to `primary` and `secondary`.
    pub fn new(primary: A, secondary: B) -> Self {
        Self { primary, secondary }
    }
}

impl<A, B> Service<AdmissionEvent> for MulticastSink<A, B>
where
    A: tower::Service<AdmissionEvent, Response = ()> + Clone + Send + 'static,
    A::Error: Into<BoxError> + Send,
    A::Future: Send + 'static,
    B: tower::Service<AdmissionEvent, Response = ()> + Clone + Send + 'static,
    B::Error: Into<BoxError> + Send,
    B::Future: Send + 'static,
{
    type Response = ();
    type Error = MulticastSinkError;
    type Future = SinkFuture<MulticastSinkError>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Both sides are polled every time so each registers its waker.
        let primary = match self.primary.poll_ready(cx) {
            Poll::Ready(Ok(())) => true,
            Poll::Ready(Err(err)) => {
                return Poll::Ready(Err(MulticastSinkError::Primary(err.into())))
            }
            Poll::Pending => false,
        };
        let secondary = match self.secondary.poll_ready(cx) {
            Poll::Ready(Ok(())) => true,
            Poll::Ready(Err(err)) => {
                return Poll::Ready(Err(MulticastSinkError::Secondary(err.into())))
            }
            Poll::Pending => false,
        };
        if primary && secondary {
            Poll::Ready(Ok(()))
        } else {
            Poll::Pending
        }
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        let first = self.primary.call(event.clone());
        let second = self.secondary.call(event);

        Box::pin(async move {
            let (primary, secondary) = futures::join!(first, second);
            primary.map_err(|e| MulticastSinkError::Primary(e.into()))?;
            secondary.map_err(|e| MulticastSinkError::Secondary(e.into()))?;
            Ok(())
        })
    }
}

impl<A, B> TelemetrySink for MulticastSink<A, B>
where
    A: tower::Service<AdmissionEvent, Response = ()> + Clone + Send + 'static,
    A::Error: Into<BoxError> + Send,
    A::Future: Send + 'static,
    B: tower::Service<AdmissionEvent, Response = ()> + Clone + Send + 'static,
    B::Error: Into<BoxError> + Send,
    B::Future: Send + 'static,
{
    type SinkError = MulticastSinkError;
}
