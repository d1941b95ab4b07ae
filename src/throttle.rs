//! Adaptive throttle: resource pressure → throttle level → published profile.
//!
//! The throttle takes periodic resource samples (CPU, memory, I/O, each a utilisation in
//! `[0, 1]`), maps them to a [`ThrottleLevel`], and publishes the matching [`ThrottleProfile`]
//! through a [`Published`] snapshot. The rate limiter scales its limits by the profile's
//! `rate_multiplier`, the dispatcher caps in-flight calls at `max_concurrent`, and circuit
//! breakers scale `min_requests` by `min_requests_scale`. Nothing on the request path ever waits
//! for the throttle.
//!
//! Levels are recomputed from each sample, never accumulated. When samples stop arriving the
//! level degrades on a schedule: within `stale_grace` the last level stands, after it the level
//! falls back to `grace_level`, and after `stale_after` it moves to `stale_level`.

use crate::clock::{duration_millis, Clock, MonotonicClock};
use crate::error::ConfigError;
use crate::snapshot::Published;
use crate::telemetry::{AdmissionEvent, EventBus, ThrottleEvent};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Ordered pressure level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ThrottleLevel {
    /// No pressure.
    #[default]
    None,
    /// Light pressure.
    Low,
    /// Moderate pressure.
    Medium,
    /// Heavy pressure.
    High,
    /// Saturation.
    Critical,
}

impl ThrottleLevel {
    /// Every level, lowest first.
    pub const ALL: [ThrottleLevel; 5] = [
        ThrottleLevel::None,
        ThrottleLevel::Low,
        ThrottleLevel::Medium,
        ThrottleLevel::High,
        ThrottleLevel::Critical,
    ];

    /// Lowercase level name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ThrottleLevel::None => "none",
            ThrottleLevel::Low => "low",
            ThrottleLevel::Medium => "medium",
            ThrottleLevel::High => "high",
            ThrottleLevel::Critical => "critical",
        }
    }

    fn ordinal(self) -> usize {
        self as usize
    }

    fn from_ordinal(ordinal: usize) -> Self {
        Self::ALL[ordinal.min(Self::ALL.len() - 1)]
    }
}

impl fmt::Display for ThrottleLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What produced the currently published level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LevelSource {
    /// No sample yet; the configured starting level.
    #[default]
    Initial,
    /// Computed from a fresh sample.
    Sampled,
    /// Samples stopped longer than `stale_grace` ago.
    StaleGrace,
    /// Samples stopped longer than `stale_after` ago.
    Stale,
}

impl LevelSource {
    /// Snake-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            LevelSource::Initial => "initial",
            LevelSource::Sampled => "sampled",
            LevelSource::StaleGrace => "stale_grace",
            LevelSource::Stale => "stale",
        }
    }
}

impl fmt::Display for LevelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ascending utilisation thresholds for one metric.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ResourceThresholds {
    /// Reaching this is `Low`.
    pub low: f64,
    /// Reaching this is `Medium`.
    pub medium: f64,
    /// Reaching this is `High`.
    pub high: f64,
    /// Reaching this is `Critical`.
    pub critical: f64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self { low: 0.6, medium: 0.75, high: 0.85, critical: 0.9 }
    }
}

impl ResourceThresholds {
    /// Highest level whose threshold `value` reaches.
    pub fn level_for(&self, value: f64) -> ThrottleLevel {
        if value >= self.critical {
            ThrottleLevel::Critical
        } else if value >= self.high {
            ThrottleLevel::High
        } else if value >= self.medium {
            ThrottleLevel::Medium
        } else if value >= self.low {
            ThrottleLevel::Low
        } else {
            ThrottleLevel::None
        }
    }

    fn validate(&self, field: &str) -> Result<(), ConfigError> {
        for (name, value) in
            [("low", self.low), ("medium", self.medium), ("high", self.high), ("critical", self.critical)]
        {
            ConfigError::unit_interval(format!("{field}.{name}"), value)?;
        }
        if self.low < self.medium && self.medium < self.high && self.high < self.critical {
            Ok(())
        } else {
            Err(ConfigError::NotAscending {
                field: field.to_string(),
                low: self.low,
                medium: self.medium,
                high: self.high,
                critical: self.critical,
            })
        }
    }
}

/// Runtime limits published for a level.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ThrottleProfile {
    /// Scale applied to every tier's rate and burst.
    pub rate_multiplier: f64,
    /// Cap on concurrent downstream calls.
    pub max_concurrent: usize,
    /// Scale applied to circuit breaker `min_requests`.
    pub min_requests_scale: f64,
}

impl ThrottleProfile {
    /// Profile that leaves every limit untouched.
    pub const UNRESTRICTED: ThrottleProfile =
        ThrottleProfile { rate_multiplier: 1.0, max_concurrent: usize::MAX, min_requests_scale: 1.0 };

    /// Convenience constructor.
    pub const fn new(rate_multiplier: f64, max_concurrent: usize, min_requests_scale: f64) -> Self {
        Self { rate_multiplier, max_concurrent, min_requests_scale }
    }

    fn validate(&self, field: &str) -> Result<(), ConfigError> {
        ConfigError::positive(format!("{field}.rate_multiplier"), self.rate_multiplier)?;
        ConfigError::count(format!("{field}.max_concurrent"), self.max_concurrent as u64)?;
        ConfigError::positive(format!("{field}.min_requests_scale"), self.min_requests_scale)
    }
}

impl Default for ThrottleProfile {
    fn default() -> Self {
        Self::UNRESTRICTED
    }
}

/// One profile per level.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LevelProfiles {
    /// Profile at `None`.
    pub none: ThrottleProfile,
    /// Profile at `Low`.
    pub low: ThrottleProfile,
    /// Profile at `Medium`.
    pub medium: ThrottleProfile,
    /// Profile at `High`.
    pub high: ThrottleProfile,
    /// Profile at `Critical`.
    pub critical: ThrottleProfile,
}

impl Default for LevelProfiles {
    fn default() -> Self {
        Self {
            none: ThrottleProfile::UNRESTRICTED,
            low: ThrottleProfile::new(0.8, 512, 1.0),
            medium: ThrottleProfile::new(0.6, 256, 0.8),
            high: ThrottleProfile::new(0.4, 128, 0.6),
            critical: ThrottleProfile::new(0.2, 64, 0.4),
        }
    }
}

impl LevelProfiles {
    /// Profile for `level`.
    pub fn get(&self, level: ThrottleLevel) -> ThrottleProfile {
        match level {
            ThrottleLevel::None => self.none,
            ThrottleLevel::Low => self.low,
            ThrottleLevel::Medium => self.medium,
            ThrottleLevel::High => self.high,
            ThrottleLevel::Critical => self.critical,
        }
    }
}

/// How per-metric levels combine into one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum CombineRule {
    /// Worst metric wins.
    #[default]
    Max,
    /// Floor of the mean level.
    Mean,
}

impl CombineRule {
    /// Combine per-metric levels.
    pub fn combine(&self, levels: [ThrottleLevel; 3]) -> ThrottleLevel {
        match self {
            CombineRule::Max => levels.into_iter().max().unwrap_or_default(),
            CombineRule::Mean => {
                let sum: usize = levels.iter().map(|l| l.ordinal()).sum();
                ThrottleLevel::from_ordinal(sum / levels.len())
            }
        }
    }
}

/// Adaptive throttle settings.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ThrottleConfig {
    /// CPU thresholds.
    pub cpu: ResourceThresholds,
    /// Memory thresholds.
    pub memory: ResourceThresholds,
    /// I/O thresholds.
    pub io: ResourceThresholds,
    /// Published profiles.
    pub profiles: LevelProfiles,
    /// Metric combination rule.
    pub combine: CombineRule,
    /// How long the last sampled level stands without a new sample.
    pub stale_grace: Duration,
    /// Silence after which `stale_level` applies.
    pub stale_after: Duration,
    /// Level after `stale_grace`.
    pub grace_level: ThrottleLevel,
    /// Level after `stale_after`.
    pub stale_level: ThrottleLevel,
    /// Ticker cadence.
    pub tick_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            cpu: ResourceThresholds::default(),
            memory: ResourceThresholds::default(),
            io: ResourceThresholds::default(),
            profiles: LevelProfiles::default(),
            combine: CombineRule::Max,
            stale_grace: Duration::from_secs(10),
            stale_after: Duration::from_secs(60),
            grace_level: ThrottleLevel::None,
            stale_level: ThrottleLevel::High,
            tick_interval: Duration::from_secs(1),
        }
    }
}

impl ThrottleConfig {
    /// Check thresholds, profiles and the staleness schedule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cpu.validate("throttle.cpu")?;
        self.memory.validate("throttle.memory")?;
        self.io.validate("throttle.io")?;
        for level in ThrottleLevel::ALL {
            self.profiles.get(level).validate(&format!("throttle.profiles.{level}"))?;
        }
        ConfigError::non_zero("throttle.stale_grace", self.stale_grace)?;
        ConfigError::non_zero("throttle.tick_interval", self.tick_interval)?;
        if self.stale_after < self.stale_grace {
            return Err(ConfigError::Invalid {
                field: "throttle.stale_after".into(),
                reason: format!(
                    "must not be shorter than stale_grace ({:?} < {:?})",
                    self.stale_after, self.stale_grace
                ),
            });
        }
        Ok(())
    }
}

/// One resource reading. Values are utilisations in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSample {
    /// CPU utilisation.
    pub cpu: f64,
    /// Memory utilisation.
    pub memory: f64,
    /// I/O utilisation.
    pub io: f64,
}

impl ResourceSample {
    /// Reading of all three metrics.
    pub fn new(cpu: f64, memory: f64, io: f64) -> Self {
        Self { cpu, memory, io }
    }
}

fn sanitize(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// What the request path reads.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ThrottleSnapshot {
    /// Current level.
    pub level: ThrottleLevel,
    /// Limits for `level`.
    pub profile: ThrottleProfile,
    /// What produced `level`.
    pub source: LevelSource,
}

/// Source of resource readings polled by the ticker.
#[async_trait::async_trait]
pub trait ResourceSampler: Send + Sync {
    /// Current reading, or `None` when the sampler has nothing fresh.
    async fn sample(&self) -> Option<ResourceSample>;
}

#[derive(Debug)]
struct ThrottleState {
    last_sample_millis: u64,
    sampled_level: ThrottleLevel,
    sampled: bool,
}

/// Resource-pressure driven throttle.
#[derive(Debug)]
pub struct AdaptiveThrottle {
    config: ThrottleConfig,
    published: Published<ThrottleSnapshot>,
    state: Mutex<ThrottleState>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl AdaptiveThrottle {
    /// Validate `config` and start at `None`.
    pub fn new(config: ThrottleConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        let initial = ThrottleSnapshot {
            level: ThrottleLevel::None,
            profile: config.profiles.get(ThrottleLevel::None),
            source: LevelSource::Initial,
        };
        Ok(Self {
            state: Mutex::new(ThrottleState {
                last_sample_millis: clock.now_millis(),
                sampled_level: ThrottleLevel::None,
                sampled: false,
            }),
            published: Published::new(initial),
            config,
            clock,
            events: EventBus::disabled(),
        })
    }

    /// Use `clock` for staleness; construction counts as the last sample.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.lock_state().last_sample_millis = clock.now_millis();
        self.clock = clock;
        self
    }

    /// Publish level changes to `events`.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Publish into an existing handle (e.g. one already shared with limiters).
    pub fn with_published(self, published: Published<ThrottleSnapshot>) -> Self {
        published.store(*self.published.load());
        Self { published, ..self }
    }

    fn lock_state(&self) -> MutexGuard<'_, ThrottleState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Handle the request path reads from.
    pub fn published(&self) -> Published<ThrottleSnapshot> {
        self.published.clone()
    }

    /// Current snapshot.
    pub fn current(&self) -> Arc<ThrottleSnapshot> {
        self.published.load()
    }

    /// Current level.
    pub fn level(&self) -> ThrottleLevel {
        self.published.load().level
    }

    /// Settings in use.
    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Level a sample maps to, without publishing it.
    pub fn classify(&self, sample: ResourceSample) -> ThrottleLevel {
        self.config.combine.combine([
            self.config.cpu.level_for(sanitize(sample.cpu)),
            self.config.memory.level_for(sanitize(sample.memory)),
            self.config.io.level_for(sanitize(sample.io)),
        ])
    }

    /// Feed one reading of the three metrics.
    pub fn on_resource_sample(&self, cpu: f64, memory: f64, io: f64) -> ThrottleLevel {
        self.on_sample(ResourceSample::new(cpu, memory, io))
    }

    /// Feed one reading and publish the resulting level.
    pub fn on_sample(&self, sample: ResourceSample) -> ThrottleLevel {
        let level = self.classify(sample);
        let mut state = self.lock_state();
        state.last_sample_millis = self.clock.now_millis();
        state.sampled_level = level;
        state.sampled = true;
        self.publish(level, LevelSource::Sampled);
        level
    }

    /// Re-evaluate staleness now.
    pub fn tick(&self) -> ThrottleLevel {
        self.tick_at(self.clock.now_millis())
    }

    /// Re-evaluate staleness at `now_millis`.
    pub fn tick_at(&self, now_millis: u64) -> ThrottleLevel {
        let state = self.lock_state();
        let silent = now_millis.saturating_sub(state.last_sample_millis);
        let (level, source) = if silent >= duration_millis(self.config.stale_after) {
            (self.config.stale_level, LevelSource::Stale)
        } else if silent >= duration_millis(self.config.stale_grace) {
            (self.config.grace_level, LevelSource::StaleGrace)
        } else if state.sampled {
            (state.sampled_level, LevelSource::Sampled)
        } else {
            (state.sampled_level, LevelSource::Initial)
        };

        let previous = self.published.load().source;
        if source != previous && matches!(source, LevelSource::StaleGrace | LevelSource::Stale) {
            tracing::warn!(
                silent_ms = silent,
                level = %level,
                source = %source,
                "resource samples are stale"
            );
        }
        self.publish(level, source);
        level
    }

    // Caller holds the state lock, so publications are serialized.
    fn publish(&self, level: ThrottleLevel, source: LevelSource) {
        let current = self.published.load();
        if current.level == level && current.source == source {
            return;
        }
        let next = ThrottleSnapshot { level, profile: self.config.profiles.get(level), source };
        let previous = self.published.replace(next);
        if previous.level == level {
            return;
        }

        if level > previous.level {
            tracing::warn!(
                from = %previous.level,
                to = %level,
                source = %source,
                rate_multiplier = next.profile.rate_multiplier,
                max_concurrent = next.profile.max_concurrent,
                "throttle level escalated"
            );
        } else {
            tracing::info!(from = %previous.level, to = %level, source = %source, "throttle level relaxed");
        }
        self.events.publish(AdmissionEvent::Throttle(ThrottleEvent::LevelChanged {
            from: previous.level,
            to: level,
            source,
        }));
    }

    /// Poll `sampler` once and feed the reading, if any.
    pub async fn sample_from(&self, sampler: &dyn ResourceSampler) -> Option<ThrottleLevel> {
        let sample = sampler.sample().await?;
        Some(self.on_sample(sample))
    }

    /// Run the tick on `tick_interval`: poll `sampler` (if any), re-evaluate staleness, then call
    /// `maintenance` with the current time. Requires a tokio runtime.
    pub fn spawn_ticker<F>(
        self: &Arc<Self>,
        sampler: Option<Arc<dyn ResourceSampler>>,
        maintenance: F,
    ) -> JoinHandle<()>
    where
        F: Fn(u64) + Send + 'static,
    {
        let throttle = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(throttle.config.tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Some(sampler) = &sampler {
                    throttle.sample_from(sampler.as_ref()).await;
                }
                let now = throttle.clock.now_millis();
                throttle.tick_at(now);
                maintenance(now);
            }
        })
    }
}
