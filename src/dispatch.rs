//! Request dispatch: admission, the downstream call, retries and fallbacks.
//!
//! [`Dispatcher::dispatch`] runs one request through, in order:
//! 1. the service's circuit breaker (open circuits fail fast or serve a fallback),
//! 2. the adaptive in-flight cap,
//! 3. the caller's rate tier,
//! 4. the downstream call under the remaining request budget, with retries per the service's
//!    [`RetryPolicy`](crate::RetryPolicy),
//! 5. the fallback chain when the downstream could not answer.
//!
//! Every outcome is reported to the breaker; throttled requests are not. The budget is measured
//! on the dispatcher's [`Clock`]: no retry sleep starts unless an attempt can still follow it.
//!
//! ```rust
//! use tollgate::{CallerIdentity, Dispatcher, PolicyConfig, Priority};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let dispatcher = Dispatcher::<&str, std::io::Error>::builder(PolicyConfig::default())
//!     .build()
//!     .unwrap();
//! let caller = CallerIdentity::new("tenant-7", Priority::High);
//!
//! let served = dispatcher
//!     .dispatch(&caller, "inventory", |_service| async { Ok("12 in stock") })
//!     .await
//!     .unwrap();
//! assert_eq!(served.value, "12 in stock");
//! assert_eq!(served.attempts, 1);
//! # }
//! ```

pub mod layer;

pub use layer::{AdmissionRequest, DispatchLayer, DispatchService, Routed};

use crate::circuit_breaker::CallPermission;
use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::clock::{duration_millis, Clock, MonotonicClock};
use crate::config::PolicyConfig;
use crate::error::{ConfigError, DispatchError, ThrottleReason};
use crate::fallback::{Fallback, FallbackChain, FallbackContext, FallbackKind, FallbackReason};
use crate::rate_limit::{Admission, CallerIdentity, RateLimiter};
use crate::retry::RetryTable;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{
    AbandonReason, AdmissionEvent, EventBus, FallbackEvent, RateLimitEvent, RetryEvent,
};
use crate::throttle::{AdaptiveThrottle, ResourceSampler};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Retry hint returned when the in-flight cap is reached.
pub const CONCURRENCY_RETRY_AFTER: Duration = Duration::from_millis(100);

type RetryPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedFrom {
    /// The downstream service answered.
    Downstream,
    /// A fallback answered.
    Fallback(FallbackKind),
}

/// A successful dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Served<T> {
    /// The response.
    pub value: T,
    /// Who produced it.
    pub source: ServedFrom,
    /// Downstream attempts made (0 when the circuit was open).
    pub attempts: u32,
}

impl<T> Served<T> {
    /// True when a fallback produced the value.
    pub fn is_fallback(&self) -> bool {
        matches!(self.source, ServedFrom::Fallback(_))
    }

    /// Drop the metadata.
    pub fn into_value(self) -> T {
        self.value
    }
}

// Holds one in-flight slot until dropped.
struct InFlightSlot(Arc<AtomicUsize>);

impl InFlightSlot {
    fn try_acquire(counter: &Arc<AtomicUsize>, max: usize) -> Result<Self, usize> {
        let mut current = counter.load(Ordering::Acquire);
        loop {
            if current >= max {
                return Err(current);
            }
            match counter.compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(Self(Arc::clone(counter))),
                Err(actual) => current = actual,
            }
        }
    }
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

// Why the attempt loop stopped without a response.
enum Failure<E> {
    Downstream { attempts: u32, source: E },
    Timeout { elapsed: Duration, attempts: u32 },
}

/// Builder for [`Dispatcher`].
pub struct DispatcherBuilder<T, E> {
    config: PolicyConfig,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    events: EventBus,
    should_retry: Option<RetryPredicate<E>>,
    fallbacks: Vec<(FallbackKind, Arc<dyn Fallback<T>>)>,
}

impl<T, E> fmt::Debug for DispatcherBuilder<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherBuilder")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("sleeper", &self.sleeper)
            .field("events", &self.events)
            .field("fallbacks", &self.fallbacks.iter().map(|(kind, _)| *kind).collect::<Vec<_>>())
            .finish()
    }
}

impl<T, E> DispatcherBuilder<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn new(config: PolicyConfig) -> Self {
        Self {
            config,
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
            events: EventBus::disabled(),
            should_retry: None,
            fallbacks: Vec::new(),
        }
    }

    /// Time source for windows, breakers, staleness and the request budget.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// How retry delays are waited out.
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Where every component publishes its events.
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Only retry failures for which `predicate` returns true.
    pub fn should_retry<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    /// Register the fallback for `kind`.
    pub fn fallback(mut self, kind: FallbackKind, fallback: impl Fallback<T> + 'static) -> Self {
        self.fallbacks.push((kind, Arc::new(fallback)));
        self
    }

    /// Shorthand for the cache stage.
    pub fn cache_fallback(self, fallback: impl Fallback<T> + 'static) -> Self {
        self.fallback(FallbackKind::Cache, fallback)
    }

    /// Shorthand for the degraded stage.
    pub fn degraded_fallback(self, fallback: impl Fallback<T> + 'static) -> Self {
        self.fallback(FallbackKind::Degraded, fallback)
    }

    /// Shorthand for the alternative endpoint stage.
    pub fn alternative_endpoint(self, fallback: impl Fallback<T> + 'static) -> Self {
        self.fallback(FallbackKind::AlternativeEndpoint, fallback)
    }

    /// Validate the configuration and wire the components together.
    ///
    /// The throttle, the rate limiter and the breaker registry share one published throttle
    /// snapshot, so a level change reaches all of them atomically.
    pub fn build(self) -> Result<Dispatcher<T, E>, ConfigError> {
        let config = self.config;
        config.validate()?;

        let throttle = AdaptiveThrottle::new(config.throttle)?
            .with_clock(Arc::clone(&self.clock))
            .with_events(self.events.clone());
        let published = throttle.published();
        let limiter = RateLimiter::new(config.rate_limits)?.with_throttle(published.clone());
        let breakers = CircuitBreakerRegistry::new(config.circuit_breaker)?
            .with_clock(Arc::clone(&self.clock))
            .with_throttle(published)
            .with_events(self.events.clone());

        let mut fallbacks = FallbackChain::new(config.fallback);
        for (kind, fallback) in self.fallbacks {
            fallbacks.register(kind, fallback);
        }

        Ok(Dispatcher {
            limiter: Arc::new(limiter),
            breakers: Arc::new(breakers),
            throttle: Arc::new(throttle),
            retry: config.retry,
            fallbacks,
            budget: config.request_budget,
            clock: self.clock,
            sleeper: self.sleeper,
            events: self.events,
            should_retry: self.should_retry.unwrap_or_else(|| Arc::new(|_: &E| true)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }
}

/// Admission and resilience policy in front of downstream services returning `Result<T, E>`.
pub struct Dispatcher<T, E> {
    limiter: Arc<RateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
    throttle: Arc<AdaptiveThrottle>,
    retry: RetryTable,
    fallbacks: FallbackChain<T>,
    budget: Duration,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    events: EventBus,
    should_retry: RetryPredicate<E>,
    in_flight: Arc<AtomicUsize>,
}

impl<T, E> fmt::Debug for Dispatcher<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("limiter", &self.limiter)
            .field("breakers", &self.breakers)
            .field("throttle", &self.throttle)
            .field("retry", &self.retry)
            .field("fallbacks", &self.fallbacks)
            .field("budget", &self.budget)
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T, E> Dispatcher<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Start building from `config`.
    pub fn builder(config: PolicyConfig) -> DispatcherBuilder<T, E> {
        DispatcherBuilder::new(config)
    }

    /// Per-caller rate limiter.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Per-service circuit breakers.
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Adaptive throttle; feed it resource samples.
    pub fn throttle(&self) -> &Arc<AdaptiveThrottle> {
        &self.throttle
    }

    /// Retry policies in use.
    pub fn retry_table(&self) -> &RetryTable {
        &self.retry
    }

    /// Per-request budget.
    pub fn request_budget(&self) -> Duration {
        self.budget
    }

    /// Downstream calls currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Events dropped by the sink so far.
    pub fn dropped_events(&self) -> u64 {
        self.events.dropped()
    }

    /// Run the throttle ticker, polling `sampler` if given and purging idle callers every tick.
    pub fn spawn_maintenance(&self, sampler: Option<Arc<dyn ResourceSampler>>) -> JoinHandle<()> {
        let limiter = Arc::clone(&self.limiter);
        self.throttle.spawn_ticker(sampler, move |now| {
            let purged = limiter.purge_idle(now);
            if purged > 0 {
                tracing::debug!(purged, "purged idle caller windows");
            }
        })
    }

    /// Admit `caller` to `service` and run `op` under the service's policies.
    ///
    /// `op` receives the service name and is called once per attempt.
    pub async fn dispatch<F, Fut>(
        &self,
        caller: &CallerIdentity,
        service: &str,
        mut op: F,
    ) -> Result<Served<T>, DispatchError<E>>
    where
        F: FnMut(&str) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = self.clock.now_millis();

        if let CallPermission::Reject { retry_after } = self.breakers.before_call(service) {
            tracing::debug!(service, caller = %caller, ?retry_after, "circuit open; failing fast");
            return match self.run_fallbacks(caller, service, FallbackReason::CircuitOpen).await {
                Some((kind, value)) => {
                    Ok(Served { value, source: ServedFrom::Fallback(kind), attempts: 0 })
                }
                None => Err(DispatchError::CircuitOpen { service: service.to_string(), retry_after }),
            };
        }

        let max_concurrent = self.throttle.current().profile.max_concurrent;
        let slot = match InFlightSlot::try_acquire(&self.in_flight, max_concurrent) {
            Ok(slot) => slot,
            Err(in_flight) => {
                self.breakers.cancel_call(service);
                tracing::debug!(service, in_flight, max_concurrent, "in-flight cap reached");
                self.events.publish(AdmissionEvent::RateLimit(RateLimitEvent::ConcurrencyLimited {
                    in_flight,
                    max_concurrent,
                }));
                return Err(DispatchError::Throttled {
                    retry_after: CONCURRENCY_RETRY_AFTER,
                    reason: ThrottleReason::Concurrency { in_flight, max: max_concurrent },
                });
            }
        };

        // Only requests holding a slot are charged to the caller's window.
        if let Admission::Throttle { retry_after, .. } = self.limiter.allow(caller, started) {
            drop(slot);
            self.breakers.cancel_call(service);
            self.events.publish(AdmissionEvent::RateLimit(RateLimitEvent::Throttled {
                caller: caller.key().to_string(),
                priority: caller.priority(),
                retry_after,
            }));
            return Err(DispatchError::Throttled {
                retry_after,
                reason: ThrottleReason::RateLimit { priority: caller.priority() },
            });
        }

        let outcome = self.attempt_loop(service, started, &mut op).await;
        drop(slot);
        let failure = match outcome {
            Ok((value, attempts)) => {
                return Ok(Served { value, source: ServedFrom::Downstream, attempts });
            }
            Err(failure) => failure,
        };

        let reason = match failure {
            Failure::Downstream { .. } => FallbackReason::RetriesExhausted,
            Failure::Timeout { .. } => FallbackReason::Timeout,
        };
        let attempts = match &failure {
            Failure::Downstream { attempts, .. } | Failure::Timeout { attempts, .. } => *attempts,
        };
        if let Some((kind, value)) = self.run_fallbacks(caller, service, reason).await {
            return Ok(Served { value, source: ServedFrom::Fallback(kind), attempts });
        }
        Err(match failure {
            Failure::Downstream { attempts, source } => DispatchError::Downstream { attempts, source },
            Failure::Timeout { elapsed, attempts } => {
                DispatchError::Timeout { elapsed, budget: self.budget, attempts }
            }
        })
    }

    // The breaker has already admitted the first attempt.
    async fn attempt_loop<F, Fut>(
        &self,
        service: &str,
        started: u64,
        op: &mut F,
    ) -> Result<(T, u32), Failure<E>>
    where
        F: FnMut(&str) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let deadline = started.saturating_add(duration_millis(self.budget));
        let policy = *self.retry.policy_for(service);
        let mut attempts = 0u32;

        loop {
            let now = self.clock.now_millis();
            let remaining = deadline.saturating_sub(now);
            if remaining == 0 {
                self.breakers.cancel_call(service);
                return Err(Failure::Timeout {
                    elapsed: Duration::from_millis(now.saturating_sub(started)),
                    attempts,
                });
            }

            attempts += 1;
            let error = match tokio::time::timeout(Duration::from_millis(remaining), op(service)).await {
                Ok(Ok(value)) => {
                    self.breakers.report_outcome(service, true);
                    return Ok((value, attempts));
                }
                Ok(Err(error)) => {
                    self.breakers.report_outcome(service, false);
                    error
                }
                Err(_) => {
                    self.breakers.report_outcome(service, false);
                    let elapsed = Duration::from_millis(self.clock.now_millis().saturating_sub(started));
                    tracing::debug!(service, attempts, "request budget exhausted mid-attempt");
                    return Err(Failure::Timeout { elapsed: elapsed.max(self.budget), attempts });
                }
            };

            if !(self.should_retry)(&error) {
                tracing::debug!(service, attempts, "failure is not retryable");
                return Err(Failure::Downstream { attempts, source: error });
            }
            if !policy.allows_another(attempts) {
                let total_duration =
                    Duration::from_millis(self.clock.now_millis().saturating_sub(started));
                tracing::debug!(service, attempts, ?total_duration, "retries exhausted");
                self.events.publish(AdmissionEvent::Retry(RetryEvent::Exhausted {
                    service: service.to_string(),
                    total_attempts: attempts,
                    total_duration,
                }));
                return Err(Failure::Downstream { attempts, source: error });
            }

            let delay = policy.delay_for(attempts);
            let now = self.clock.now_millis();
            if now.saturating_add(duration_millis(delay)) >= deadline {
                self.abandon(service, attempts, AbandonReason::Deadline);
                return Err(Failure::Downstream { attempts, source: error });
            }

            tracing::debug!(service, attempt = attempts + 1, ?delay, "retrying");
            self.events.publish(AdmissionEvent::Retry(RetryEvent::Attempt {
                service: service.to_string(),
                attempt: attempts + 1,
                delay,
            }));
            self.sleeper.sleep(delay).await;

            if !self.breakers.before_call(service).is_proceed() {
                self.abandon(service, attempts, AbandonReason::CircuitOpen);
                return Err(Failure::Downstream { attempts, source: error });
            }
        }
    }

    fn abandon(&self, service: &str, attempts: u32, reason: AbandonReason) {
        tracing::debug!(service, attempts, reason = reason.as_str(), "abandoning retries");
        self.events.publish(AdmissionEvent::Retry(RetryEvent::Abandoned {
            service: service.to_string(),
            attempts,
            reason,
        }));
    }

    async fn run_fallbacks(
        &self,
        caller: &CallerIdentity,
        service: &str,
        reason: FallbackReason,
    ) -> Option<(FallbackKind, T)> {
        if !self.fallbacks.is_armed() {
            return None;
        }
        let ctx = FallbackContext { service, caller, reason };
        let recovered = self.fallbacks.recover(&ctx).await;
        let event = match &recovered {
            Some((kind, _)) => {
                tracing::info!(service, kind = kind.as_str(), reason = reason.as_str(), "served fallback");
                FallbackEvent::Served { service: service.to_string(), kind: *kind, reason }
            }
            None => {
                tracing::warn!(service, reason = reason.as_str(), "no fallback available");
                FallbackEvent::Unavailable { service: service.to_string(), reason }
            }
        };
        self.events.publish(AdmissionEvent::Fallback(event));
        recovered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::RetryStrategy;
    use crate::clock::ManualClock;
    use crate::fallback::StaticFallback;
    use crate::rate_limit::{Priority, RateLimitPolicy};
    use crate::retry::RetryPolicy;
    use crate::sleeper::{InstantSleeper, TrackingSleeper};
    use crate::telemetry::MemorySink;
    use crate::throttle::ThrottleProfile;
    use std::sync::atomic::AtomicU32;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Boom;

    fn config() -> PolicyConfig {
        PolicyConfig {
            retry: RetryTable::new(RetryPolicy::new(
                RetryStrategy::linear(Duration::from_millis(10), Duration::from_millis(10)),
                3,
            )),
            ..PolicyConfig::default()
        }
    }

    fn caller() -> CallerIdentity {
        CallerIdentity::new("tenant", Priority::Normal)
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let dispatcher = Dispatcher::<u32, Boom>::builder(config())
            .sleeper(Arc::new(InstantSleeper))
            .build()
            .unwrap();
        let served = dispatcher.dispatch(&caller(), "svc", |_| async { Ok(7) }).await.unwrap();
        assert_eq!(served, Served { value: 7, source: ServedFrom::Downstream, attempts: 1 });
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let sleeper = TrackingSleeper::new();
        let dispatcher = Dispatcher::<u32, Boom>::builder(config())
            .sleeper(Arc::new(sleeper.clone()))
            .build()
            .unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let served = dispatcher
            .dispatch(&caller(), "svc", |_| {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Boom)
                    } else {
                        Ok(1)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(served.attempts, 3);
        assert_eq!(sleeper.calls(), vec![Duration::from_millis(10), Duration::from_millis(20)]);
    }

    #[tokio::test]
    async fn predicate_vetoes_retry() {
        let dispatcher = Dispatcher::<u32, Boom>::builder(config())
            .sleeper(Arc::new(InstantSleeper))
            .should_retry(|_| false)
            .build()
            .unwrap();
        let err = dispatcher.dispatch(&caller(), "svc", |_| async { Err(Boom) }).await.unwrap_err();
        assert!(matches!(err, DispatchError::Downstream { attempts: 1, source: Boom }));
    }

    #[tokio::test]
    async fn exhaustion_serves_fallback() {
        let sink = MemorySink::new();
        let dispatcher = Dispatcher::<u32, Boom>::builder(config())
            .sleeper(Arc::new(InstantSleeper))
            .events(EventBus::new(sink.clone()))
            .degraded_fallback(StaticFallback::new(0))
            .build()
            .unwrap();
        let served = dispatcher.dispatch(&caller(), "svc", |_| async { Err(Boom) }).await.unwrap();
        assert_eq!(served.source, ServedFrom::Fallback(FallbackKind::Degraded));
        assert_eq!(served.attempts, 3);
        assert!(sink.events().contains(&AdmissionEvent::Fallback(FallbackEvent::Served {
            service: "svc".into(),
            kind: FallbackKind::Degraded,
            reason: FallbackReason::RetriesExhausted,
        })));
    }

    #[tokio::test]
    async fn throttled_requests_skip_downstream_and_breaker() {
        let mut config = config();
        config.rate_limits = config
            .rate_limits
            .with_policy(Priority::Low, RateLimitPolicy::per_second(1.0, 1));
        let clock = ManualClock::new();
        let dispatcher = Dispatcher::<u32, Boom>::builder(config)
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap();
        let low = CallerIdentity::new("bulk", Priority::Low);
        let calls = Arc::new(AtomicU32::new(0));
        let op = |_: &str| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            }
        };

        assert!(dispatcher.dispatch(&low, "svc", op).await.is_ok());
        let err = dispatcher.dispatch(&low, "svc", op).await.unwrap_err();
        assert!(err.is_throttled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.breakers().circuit("svc").map(|s| s.window.total()), Some(1));
    }

    #[tokio::test]
    async fn concurrency_cap_rejects_when_saturated() {
        let mut config = config();
        config.throttle.profiles.none = ThrottleProfile::new(1.0, 1, 1.0);
        let dispatcher = Dispatcher::<u32, Boom>::builder(config).build().unwrap();
        let gate = Arc::new(tokio::sync::Notify::new());
        let caller = caller();

        let first = dispatcher.dispatch(&caller, "svc", |_| {
            let gate = Arc::clone(&gate);
            async move {
                gate.notified().await;
                Ok(1)
            }
        });
        let second = async {
            let result = dispatcher.dispatch(&caller, "svc", |_| async { Ok(2) }).await;
            gate.notify_one();
            result
        };
        let (first, second) = tokio::join!(first, second);

        assert_eq!(first.unwrap().value, 1);
        let err = second.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Throttled { reason: ThrottleReason::Concurrency { in_flight: 1, max: 1 }, .. }
        ));
        assert_eq!(err.retry_after(), Some(CONCURRENCY_RETRY_AFTER));
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn concurrency_refusal_leaves_rate_quota_untouched() {
        let mut config = config();
        config.throttle.profiles.none = ThrottleProfile::new(1.0, 1, 1.0);
        config.rate_limits = config
            .rate_limits
            .with_policy(Priority::Low, RateLimitPolicy::per_second(2.0, 2));
        let clock = ManualClock::new();
        let dispatcher = Dispatcher::<u32, Boom>::builder(config)
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap();
        let gate = Arc::new(tokio::sync::Notify::new());
        let low = CallerIdentity::new("bulk", Priority::Low);

        let first = dispatcher.dispatch(&low, "svc", |_| {
            let gate = Arc::clone(&gate);
            async move {
                gate.notified().await;
                Ok(1)
            }
        });
        let second = async {
            let result = dispatcher.dispatch(&low, "svc", |_| async { Ok(2) }).await;
            gate.notify_one();
            result
        };
        let (first, second) = tokio::join!(first, second);

        assert!(first.is_ok());
        assert!(matches!(
            second.unwrap_err(),
            DispatchError::Throttled { reason: ThrottleReason::Concurrency { .. }, .. }
        ));
        assert_eq!(dispatcher.limiter().usage(&low, clock.now_millis()), 1);

        let third = dispatcher.dispatch(&low, "svc", |_| async { Ok(3) }).await.unwrap();
        assert_eq!(third.value, 3);
        assert_eq!(dispatcher.limiter().usage(&low, clock.now_millis()), 2);
    }
}
