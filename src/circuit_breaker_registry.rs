//! Keyed table of per-service circuit breakers.
//!
//! Records live in a sharded `DashMap`; the shard lock is held only long enough to clone the
//! record's `Arc`, and every read or write of a record happens under that record's own mutex.
//! Distinct services never contend, and transitions of one service are serialized.

use crate::circuit_breaker::{
    CallPermission, CircuitBreakerConfig, CircuitSettings, CircuitSnapshot, CircuitState,
    ServiceCircuit, Transition,
};
use crate::clock::{Clock, MonotonicClock};
use crate::error::ConfigError;
use crate::snapshot::Published;
use crate::telemetry::{AdmissionEvent, CircuitEvent, EventBus};
use crate::throttle::ThrottleSnapshot;
use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard};

type Record = Arc<Mutex<ServiceCircuit>>;

fn lock(record: &Record) -> MutexGuard<'_, ServiceCircuit> {
    record.lock().unwrap_or_else(|p| p.into_inner())
}

/// Circuit breakers for every downstream service, created on first outcome report.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    circuits: DashMap<String, Record>,
    clock: Arc<dyn Clock>,
    throttle: Published<ThrottleSnapshot>,
    events: EventBus,
}

impl CircuitBreakerRegistry {
    /// Validate `config` and start with no records.
    pub fn new(config: CircuitBreakerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            circuits: DashMap::new(),
            clock: Arc::new(MonotonicClock::default()),
            throttle: Published::new(ThrottleSnapshot::default()),
            events: EventBus::disabled(),
        })
    }

    /// Read time from `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Scale `min_requests` by the profile published through `throttle`.
    pub fn with_throttle(mut self, throttle: Published<ThrottleSnapshot>) -> Self {
        self.throttle = throttle;
        self
    }

    /// Publish transitions to `events`.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Settings in use.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Settings resolved for `service`.
    pub fn settings_for(&self, service: &str) -> CircuitSettings {
        self.config.settings_for(service)
    }

    fn min_requests(&self, settings: &CircuitSettings) -> u32 {
        settings.scaled_min_requests(self.throttle.load().profile.min_requests_scale)
    }

    fn existing(&self, service: &str) -> Option<Record> {
        self.circuits.get(service).map(|entry| Arc::clone(entry.value()))
    }

    fn record(&self, service: &str) -> Record {
        if let Some(record) = self.existing(service) {
            return record;
        }
        let settings = self.config.settings_for(service);
        let now = self.clock.now_millis();
        let entry = self.circuits.entry(service.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(ServiceCircuit::new(settings, &self.config, now)))
        });
        Arc::clone(entry.value())
    }

    /// May a call to `service` go ahead? Services never reported on always proceed.
    pub fn before_call(&self, service: &str) -> CallPermission {
        let Some(record) = self.existing(service) else {
            return CallPermission::Proceed;
        };
        let now = self.clock.now_millis();
        let (permission, transition) = {
            let mut circuit = lock(&record);
            let min = self.min_requests(&self.config.settings_for(service));
            circuit.before_call(now, min)
        };
        if let Some(transition) = transition {
            self.announce(service, transition);
        }
        permission
    }

    /// Report how a permitted call ended.
    pub fn report_outcome(&self, service: &str, success: bool) {
        let record = self.record(service);
        let now = self.clock.now_millis();
        let transition = {
            let mut circuit = lock(&record);
            let min = self.min_requests(&self.config.settings_for(service));
            circuit.on_outcome(success, now, min)
        };
        if let Some(transition) = transition {
            self.announce(service, transition);
        }
    }

    /// Give back a permission that was granted but not used.
    pub fn cancel_call(&self, service: &str) {
        if let Some(record) = self.existing(service) {
            lock(&record).cancel();
        }
    }

    /// Current state; unknown services are closed.
    pub fn state(&self, service: &str) -> CircuitState {
        self.existing(service).map_or(CircuitState::Closed, |record| lock(&record).state())
    }

    /// Snapshot of one service's record.
    pub fn circuit(&self, service: &str) -> Option<CircuitSnapshot> {
        let record = self.existing(service)?;
        let now = self.clock.now_millis();
        let snapshot = lock(&record).snapshot(now);
        Some(snapshot)
    }

    /// Snapshot every record, sorted by service name.
    pub fn snapshot(&self) -> Vec<(String, CircuitSnapshot)> {
        let records: Vec<(String, Record)> = self
            .circuits
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        let now = self.clock.now_millis();
        let mut out: Vec<(String, CircuitSnapshot)> =
            records.into_iter().map(|(name, record)| (name, lock(&record).snapshot(now))).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Force `service` closed and clear its counters. Returns `false` for unknown services.
    pub fn reset(&self, service: &str) -> bool {
        let Some(record) = self.existing(service) else {
            return false;
        };
        let now = self.clock.now_millis();
        let transition = lock(&record).force_close(now);
        if let Some(transition) = transition {
            self.announce(service, transition);
        }
        true
    }

    /// Services with a record.
    pub fn len(&self) -> usize {
        self.circuits.len()
    }

    /// True when no service has been reported on.
    pub fn is_empty(&self) -> bool {
        self.circuits.is_empty()
    }

    fn announce(&self, service: &str, transition: Transition) {
        let event = match transition {
            Transition::Opened { failure_count, request_count } => {
                tracing::error!(
                    service,
                    failure_count,
                    request_count,
                    "circuit opened"
                );
                CircuitEvent::Opened { service: service.to_string(), failure_count, request_count }
            }
            Transition::HalfOpened => {
                tracing::info!(service, "circuit half-open; probing");
                CircuitEvent::HalfOpen { service: service.to_string() }
            }
            Transition::Closed => {
                tracing::info!(service, "circuit closed");
                CircuitEvent::Closed { service: service.to_string() }
            }
        };
        self.events.publish(AdmissionEvent::Circuit(event));
    }
}
