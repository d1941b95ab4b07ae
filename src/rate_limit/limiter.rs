//! Sliding-window rate limiter with per-tier windows and a burst allowance.

use super::{Admission, CallerIdentity, Priority, RateLimitConfig, RateLimitPolicy};
use crate::error::ConfigError;
use crate::snapshot::Published;
use crate::throttle::ThrottleSnapshot;
use crate::window::{WindowAdmission, WindowCounter};
use std::time::Duration;

// Guards against `15 × 0.2 = 3.0000000000000004` rounding up a whole request.
const SCALE_EPSILON: f64 = 1e-9;

/// The burst counter looks back over this fraction of the tier window.
pub const BURST_WINDOW_DIVISOR: u32 = 10;

fn burst_window(window: Duration) -> Duration {
    (window / BURST_WINDOW_DIVISOR).max(Duration::from_millis(1))
}

/// Limits in force for a tier after the throttle multiplier is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveLimits {
    /// Requests per window admitted without touching the burst allowance.
    pub steady: u64,
    /// Scaled burst capacity.
    pub burst: u64,
}

impl EffectiveLimits {
    /// Hard per-window cap.
    pub fn limit(&self) -> u64 {
        self.steady.max(self.burst)
    }

    fn scaled(policy: &RateLimitPolicy, multiplier: f64) -> Self {
        let rate = policy.base_rate * multiplier;
        let steady = (rate * policy.window.as_secs_f64() + SCALE_EPSILON).floor().max(1.0) as u64;
        let burst =
            (f64::from(policy.burst_capacity) * multiplier - SCALE_EPSILON).ceil().max(1.0) as u64;
        Self { steady, burst }
    }
}

#[derive(Debug)]
struct Tier {
    policy: RateLimitPolicy,
    window: WindowCounter,
    burst: WindowCounter,
}

/// Per-caller admission over independent priority tiers.
///
/// `allow` never fails and never blocks on anything wider than the caller's own entry.
#[derive(Debug)]
pub struct RateLimiter {
    tiers: [Tier; 4],
    throttle: Published<ThrottleSnapshot>,
}

impl RateLimiter {
    /// Validate `config` and build one window per tier.
    pub fn new(config: RateLimitConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let tier = |priority: Priority| {
            let policy = *config.policy(priority);
            Tier {
                policy,
                window: WindowCounter::with_buckets(policy.window, config.buckets_per_window),
                burst: WindowCounter::with_buckets(
                    burst_window(policy.window),
                    config.buckets_per_window,
                ),
            }
        };
        Ok(Self {
            tiers: Priority::ALL.map(tier),
            throttle: Published::new(ThrottleSnapshot::default()),
        })
    }

    /// Scale limits by the profile published through `throttle`.
    pub fn with_throttle(mut self, throttle: Published<ThrottleSnapshot>) -> Self {
        self.throttle = throttle;
        self
    }

    fn tier(&self, priority: Priority) -> &Tier {
        &self.tiers[priority.index()]
    }

    /// Configured policy of a tier.
    pub fn policy(&self, priority: Priority) -> &RateLimitPolicy {
        &self.tier(priority).policy
    }

    /// Limits in force for a tier right now.
    pub fn effective_limits(&self, priority: Priority) -> EffectiveLimits {
        let multiplier = self.throttle.load().profile.rate_multiplier;
        EffectiveLimits::scaled(self.policy(priority), multiplier)
    }

    /// Decide whether `caller` may proceed at `now_millis`; admitted requests are counted.
    pub fn allow(&self, caller: &CallerIdentity, now_millis: u64) -> Admission {
        let tier = self.tier(caller.priority());
        let limits = self.effective_limits(caller.priority());
        let limit = limits.limit();

        match tier.window.admit(caller.key(), now_millis, limit) {
            WindowAdmission::Counted { count } => {
                let burst = count > limits.steady;
                if burst {
                    tier.burst.record(caller.key(), now_millis);
                }
                Admission::Admit { count, remaining: limit.saturating_sub(count), burst }
            }
            WindowAdmission::Full { count, retry_after } => {
                tracing::debug!(
                    caller = caller.key(),
                    priority = %caller.priority(),
                    count,
                    limit,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "rate limit reached"
                );
                Admission::Throttle { retry_after, count, limit }
            }
        }
    }

    /// In-window count for `caller` without recording anything.
    pub fn usage(&self, caller: &CallerIdentity, now_millis: u64) -> u64 {
        self.tier(caller.priority()).window.count(caller.key(), now_millis)
    }

    /// Admissions taken from the burst allowance within the last tenth of the window.
    pub fn burst_usage(&self, caller: &CallerIdentity, now_millis: u64) -> u64 {
        self.tier(caller.priority()).burst.count(caller.key(), now_millis)
    }

    /// Drop callers idle for longer than their tier window. Returns entries removed.
    pub fn purge_idle(&self, now_millis: u64) -> usize {
        self.tiers
            .iter()
            .map(|tier| tier.window.purge_idle(now_millis) + tier.burst.purge_idle(now_millis))
            .sum()
    }

    /// Callers currently tracked across tiers.
    pub fn tracked_callers(&self) -> usize {
        self.tiers.iter().map(|tier| tier.window.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::{LevelSource, ThrottleLevel, ThrottleProfile};
    use std::time::Duration;

    fn limiter(priority: Priority, policy: RateLimitPolicy) -> RateLimiter {
        RateLimiter::new(RateLimitConfig::default().with_policy(priority, policy)).unwrap()
    }

    #[test]
    fn steady_then_burst_then_throttle() {
        let limiter = limiter(Priority::Normal, RateLimitPolicy::per_second(10.0, 15));
        let caller = CallerIdentity::new("k", Priority::Normal);

        for i in 1..=10 {
            assert_eq!(
                limiter.allow(&caller, 0),
                Admission::Admit { count: i, remaining: 15 - i, burst: false }
            );
        }
        for _ in 11..=15 {
            assert!(limiter.allow(&caller, 0).is_burst());
        }
        assert_eq!(limiter.burst_usage(&caller, 0), 5);

        match limiter.allow(&caller, 0) {
            Admission::Throttle { retry_after, count, limit } => {
                assert!(retry_after > Duration::ZERO);
                assert_eq!(count, 15);
                assert_eq!(limit, 15);
            }
            other => panic!("expected throttle, got {other:?}"),
        }
    }

    #[test]
    fn burst_usage_ages_out_before_the_window() {
        let limiter = limiter(Priority::Normal, RateLimitPolicy::per_second(2.0, 4));
        let caller = CallerIdentity::new("k", Priority::Normal);
        for _ in 0..4 {
            assert!(limiter.allow(&caller, 0).is_admitted());
        }
        assert_eq!(limiter.burst_usage(&caller, 0), 2);
        assert_eq!(limiter.burst_usage(&caller, 99), 2);

        assert_eq!(limiter.burst_usage(&caller, 150), 0);
        assert_eq!(limiter.usage(&caller, 150), 4);
        assert!(!limiter.allow(&caller, 150).is_admitted());
    }

    #[test]
    fn throttled_requests_are_not_counted() {
        let limiter = limiter(Priority::Low, RateLimitPolicy::per_second(2.0, 2));
        let caller = CallerIdentity::new("k", Priority::Low);
        limiter.allow(&caller, 0);
        limiter.allow(&caller, 0);
        for _ in 0..10 {
            assert!(!limiter.allow(&caller, 500).is_admitted());
        }
        assert_eq!(limiter.usage(&caller, 500), 2);
        assert!(limiter.allow(&caller, 1_000).is_admitted());
    }

    #[test]
    fn multiplier_scales_rate_and_burst() {
        let shared = Published::new(ThrottleSnapshot::default());
        let limiter =
            limiter(Priority::Normal, RateLimitPolicy::per_second(10.0, 15)).with_throttle(shared.clone());
        assert_eq!(limiter.effective_limits(Priority::Normal), EffectiveLimits { steady: 10, burst: 15 });

        shared.store(ThrottleSnapshot {
            level: ThrottleLevel::Critical,
            profile: ThrottleProfile::new(0.2, 64, 0.4),
            source: LevelSource::Sampled,
        });
        assert_eq!(limiter.effective_limits(Priority::Normal), EffectiveLimits { steady: 2, burst: 3 });

        let caller = CallerIdentity::new("k", Priority::Normal);
        let admitted = (0..10).filter(|_| limiter.allow(&caller, 0).is_admitted()).count();
        assert_eq!(admitted, 3);
    }

    #[test]
    fn scaled_limits_never_drop_below_one() {
        let policy = RateLimitPolicy::per_second(0.5, 1);
        let limits = EffectiveLimits::scaled(&policy, 0.2);
        assert_eq!(limits, EffectiveLimits { steady: 1, burst: 1 });
    }

    #[test]
    fn construction_rejects_bad_policy() {
        let config = RateLimitConfig::default()
            .with_policy(Priority::Critical, RateLimitPolicy::per_second(10.0, 0));
        assert!(matches!(RateLimiter::new(config), Err(ConfigError::ZeroCount { .. })));
    }

    #[test]
    fn purge_drops_idle_callers() {
        let limiter = RateLimiter::new(RateLimitConfig::default()).unwrap();
        limiter.allow(&CallerIdentity::new("a", Priority::High), 0);
        limiter.allow(&CallerIdentity::new("b", Priority::Low), 0);
        assert_eq!(limiter.tracked_callers(), 2);
        assert_eq!(limiter.purge_idle(5_000), 2);
        assert_eq!(limiter.tracked_callers(), 0);
    }
}
