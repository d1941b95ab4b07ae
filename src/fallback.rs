//! Fallback chain: what to serve when the downstream cannot.
//!
//! Fallbacks run in a fixed order (cache, then degraded response, then an alternative endpoint);
//! the first one that returns `Some` answers the request. Each stage can be switched off in
//! configuration without unregistering it.

use crate::error::ConfigError;
use crate::rate_limit::CallerIdentity;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;

/// Which fallback produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FallbackKind {
    /// A cached response.
    Cache,
    /// A reduced-functionality response.
    Degraded,
    /// The same call against another endpoint.
    AlternativeEndpoint,
}

impl FallbackKind {
    /// Chain order.
    pub const ORDER: [FallbackKind; 3] =
        [FallbackKind::Cache, FallbackKind::Degraded, FallbackKind::AlternativeEndpoint];

    /// Snake-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackKind::Cache => "cache",
            FallbackKind::Degraded => "degraded",
            FallbackKind::AlternativeEndpoint => "alternative_endpoint",
        }
    }
}

impl fmt::Display for FallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the chain ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FallbackReason {
    /// The service's circuit is open.
    CircuitOpen,
    /// Every retry failed.
    RetriesExhausted,
    /// The request budget ran out.
    Timeout,
}

impl FallbackReason {
    /// Snake-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::CircuitOpen => "circuit_open",
            FallbackReason::RetriesExhausted => "retries_exhausted",
            FallbackReason::Timeout => "timeout",
        }
    }
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a fallback is told about the failed request.
#[derive(Debug, Clone, Copy)]
pub struct FallbackContext<'a> {
    /// Downstream service name.
    pub service: &'a str,
    /// Who asked.
    pub caller: &'a CallerIdentity,
    /// Why the chain ran.
    pub reason: FallbackReason,
}

/// A source of substitute responses.
#[async_trait::async_trait]
pub trait Fallback<T>: Send + Sync {
    /// A response for `ctx`, or `None` to defer to the next stage.
    async fn recover(&self, ctx: &FallbackContext<'_>) -> Option<T>;
}

/// Serves the same value every time.
#[derive(Debug, Clone)]
pub struct StaticFallback<T> {
    value: T,
}

impl<T> StaticFallback<T> {
    /// Always answer `value`.
    pub fn new(value: T) -> Self {
        Self { value }
    }
}

#[async_trait::async_trait]
impl<T: Clone + Send + Sync> Fallback<T> for StaticFallback<T> {
    async fn recover(&self, _ctx: &FallbackContext<'_>) -> Option<T> {
        Some(self.value.clone())
    }
}

/// Last known good response per service.
///
/// Clones share storage, so the application can `store` responses while the dispatcher serves
/// them as the cache stage.
#[derive(Debug, Clone)]
pub struct ResponseCache<T> {
    entries: Arc<DashMap<String, T>>,
}

impl<T> Default for ResponseCache<T> {
    fn default() -> Self {
        Self { entries: Arc::new(DashMap::new()) }
    }
}

impl<T: Clone> ResponseCache<T> {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `value` as the latest response of `service`.
    pub fn store(&self, service: impl Into<String>, value: T) {
        self.entries.insert(service.into(), value);
    }

    /// Latest response of `service`.
    pub fn get(&self, service: &str) -> Option<T> {
        self.entries.get(service).map(|entry| entry.value().clone())
    }

    /// Forget `service`.
    pub fn invalidate(&self, service: &str) -> Option<T> {
        self.entries.remove(service).map(|(_, value)| value)
    }

    /// Services cached.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait::async_trait]
impl<T: Clone + Send + Sync> Fallback<T> for ResponseCache<T> {
    async fn recover(&self, ctx: &FallbackContext<'_>) -> Option<T> {
        self.get(ctx.service)
    }
}

/// Which fallback stages may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct FallbackToggles {
    /// Cache stage enabled.
    pub cache: bool,
    /// Degraded stage enabled.
    pub degraded: bool,
    /// Alternative endpoint stage enabled.
    pub alternative_endpoint: bool,
}

impl Default for FallbackToggles {
    fn default() -> Self {
        Self { cache: true, degraded: true, alternative_endpoint: true }
    }
}

impl FallbackToggles {
    /// Every stage off.
    pub fn none() -> Self {
        Self { cache: false, degraded: false, alternative_endpoint: false }
    }

    /// Is `kind` switched on?
    pub fn enabled(&self, kind: FallbackKind) -> bool {
        match kind {
            FallbackKind::Cache => self.cache,
            FallbackKind::Degraded => self.degraded,
            FallbackKind::AlternativeEndpoint => self.alternative_endpoint,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }
}

/// Registered fallbacks, tried in [`FallbackKind::ORDER`].
pub struct FallbackChain<T> {
    toggles: FallbackToggles,
    cache: Option<Arc<dyn Fallback<T>>>,
    degraded: Option<Arc<dyn Fallback<T>>>,
    alternative_endpoint: Option<Arc<dyn Fallback<T>>>,
}

impl<T> Clone for FallbackChain<T> {
    fn clone(&self) -> Self {
        Self {
            toggles: self.toggles,
            cache: self.cache.clone(),
            degraded: self.degraded.clone(),
            alternative_endpoint: self.alternative_endpoint.clone(),
        }
    }
}

impl<T> fmt::Debug for FallbackChain<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackChain")
            .field("toggles", &self.toggles)
            .field("cache", &self.cache.is_some())
            .field("degraded", &self.degraded.is_some())
            .field("alternative_endpoint", &self.alternative_endpoint.is_some())
            .finish()
    }
}

impl<T: Send + 'static> FallbackChain<T> {
    /// Empty chain honouring `toggles`.
    pub fn new(toggles: FallbackToggles) -> Self {
        Self { toggles, cache: None, degraded: None, alternative_endpoint: None }
    }

    /// Register the stage for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: FallbackKind, fallback: Arc<dyn Fallback<T>>) {
        let slot = match kind {
            FallbackKind::Cache => &mut self.cache,
            FallbackKind::Degraded => &mut self.degraded,
            FallbackKind::AlternativeEndpoint => &mut self.alternative_endpoint,
        };
        *slot = Some(fallback);
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, kind: FallbackKind, fallback: impl Fallback<T> + 'static) -> Self {
        self.register(kind, Arc::new(fallback));
        self
    }

    fn stage(&self, kind: FallbackKind) -> Option<&Arc<dyn Fallback<T>>> {
        if !self.toggles.enabled(kind) {
            return None;
        }
        match kind {
            FallbackKind::Cache => self.cache.as_ref(),
            FallbackKind::Degraded => self.degraded.as_ref(),
            FallbackKind::AlternativeEndpoint => self.alternative_endpoint.as_ref(),
        }
    }

    /// True when at least one enabled stage is registered.
    pub fn is_armed(&self) -> bool {
        FallbackKind::ORDER.iter().any(|kind| self.stage(*kind).is_some())
    }

    /// First response from an enabled stage, in chain order.
    pub async fn recover(&self, ctx: &FallbackContext<'_>) -> Option<(FallbackKind, T)> {
        for kind in FallbackKind::ORDER {
            let Some(stage) = self.stage(kind) else {
                continue;
            };
            if let Some(value) = stage.recover(ctx).await {
                return Some((kind, value));
            }
        }
        None
    }
}
