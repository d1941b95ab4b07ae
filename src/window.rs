//! Time-bucketed sliding windows.
//!
//! A window of length `W` is cut into `buckets_per_window` sub-windows of `W / buckets_per_window`
//! milliseconds (at least 1 ms). Recording a hit increments the bucket containing `now`; buckets
//! whose start lies at or before `now - W` are dropped from the front of the ring before every read,
//! so an expired bucket is never counted and pruning is O(1) amortized.
//!
//! [`SlidingWindow<C>`] is the bucket ring itself and is generic over what a bucket tallies (a plain
//! `u64` for the rate limiter, success/failure pairs for the circuit breaker).
//! [`WindowCounter`] keys one ring per caller in a sharded table with a mutex per entry.

use crate::clock::duration_millis;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default number of sub-windows per window.
pub const DEFAULT_BUCKETS_PER_WINDOW: u32 = 10;

/// One sub-window: where it starts and what it has tallied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowBucket<C = u64> {
    /// Start of the sub-window, in clock milliseconds.
    pub start_millis: u64,
    /// Tally for the sub-window.
    pub count: C,
}

/// Ordered, capped ring of [`WindowBucket`]s covering the most recent window.
#[derive(Debug, Clone)]
pub struct SlidingWindow<C> {
    window_millis: u64,
    bucket_millis: u64,
    buckets: VecDeque<WindowBucket<C>>,
}

impl<C: Copy + Default> SlidingWindow<C> {
    /// Create an empty window. `window` is clamped to at least 1 ms and `buckets_per_window` to at
    /// least 1; configuration validation rejects zero values before they reach here.
    pub fn new(window: Duration, buckets_per_window: u32) -> Self {
        let window_millis = duration_millis(window).max(1);
        let bucket_millis = (window_millis / u64::from(buckets_per_window.max(1))).max(1);
        let capacity = usize::try_from(window_millis / bucket_millis + 1).unwrap_or(usize::MAX);
        Self {
            window_millis,
            bucket_millis,
            buckets: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_millis)
    }

    /// Sub-window length.
    pub fn bucket_width(&self) -> Duration {
        Duration::from_millis(self.bucket_millis)
    }

    fn is_expired(&self, start_millis: u64, now: u64) -> bool {
        start_millis.saturating_add(self.window_millis) <= now
    }

    /// Drop every bucket that no longer overlaps `(now - window, now]`.
    pub fn prune(&mut self, now: u64) {
        while let Some(front) = self.buckets.front() {
            if self.is_expired(front.start_millis, now) {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    /// Apply `f` to the bucket containing `now`, creating it if needed.
    ///
    /// A `now` earlier than the newest bucket (caller-supplied clocks can step backwards) is
    /// folded into the newest bucket so the ring stays ordered.
    pub fn bump<F>(&mut self, now: u64, f: F)
    where
        F: FnOnce(&mut C),
    {
        self.prune(now);
        let start = now - now % self.bucket_millis;
        match self.buckets.back_mut() {
            Some(back) if back.start_millis >= start => f(&mut back.count),
            _ => {
                let mut count = C::default();
                f(&mut count);
                self.buckets.push_back(WindowBucket { start_millis: start, count });
            }
        }
    }

    /// Fold over the live buckets at `now`, oldest first.
    pub fn fold<A, F>(&mut self, now: u64, init: A, f: F) -> A
    where
        F: FnMut(A, &C) -> A,
    {
        self.prune(now);
        self.buckets.iter().map(|b| &b.count).fold(init, f)
    }

    /// Time until the oldest live bucket expires, at least 1 ms. `None` when nothing is live.
    pub fn oldest_expiry(&mut self, now: u64) -> Option<Duration> {
        self.prune(now);
        self.buckets.front().map(|oldest| {
            let expires_at = oldest.start_millis.saturating_add(self.window_millis);
            Duration::from_millis(expires_at.saturating_sub(now).max(1))
        })
    }

    /// True when every bucket has expired at `now`.
    pub fn is_idle(&self, now: u64) -> bool {
        self.buckets.back().map_or(true, |newest| self.is_expired(newest.start_millis, now))
    }

    /// Live buckets at `now`, oldest first.
    pub fn buckets(&mut self, now: u64) -> Vec<WindowBucket<C>> {
        self.prune(now);
        self.buckets.iter().copied().collect()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.buckets.clear();
    }
}

impl SlidingWindow<u64> {
    /// Sum of the live buckets at `now`.
    pub fn total(&mut self, now: u64) -> u64 {
        self.fold(now, 0u64, |acc, c| acc.saturating_add(*c))
    }
}

/// Outcome of [`WindowCounter::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowAdmission {
    /// The hit was recorded; `count` includes it.
    Counted {
        /// In-window total after recording.
        count: u64,
    },
    /// Recording would exceed the limit; nothing was recorded.
    Full {
        /// In-window total.
        count: u64,
        /// Time until the oldest live bucket expires.
        retry_after: Duration,
    },
}

#[derive(Debug)]
struct CallerWindow {
    ring: SlidingWindow<u64>,
    retired: bool,
}

/// Per-caller sliding-window hit counters.
///
/// Entries are created lazily on a caller's first hit and removed by [`WindowCounter::purge_idle`]
/// once idle for longer than the window. Each entry has its own mutex, so contention is limited to
/// hits sharing a caller key.
#[derive(Debug)]
pub struct WindowCounter {
    window: Duration,
    buckets_per_window: u32,
    callers: DashMap<String, Arc<Mutex<CallerWindow>>>,
}

impl WindowCounter {
    /// Counter over `window`, split into [`DEFAULT_BUCKETS_PER_WINDOW`] sub-windows.
    pub fn new(window: Duration) -> Self {
        Self::with_buckets(window, DEFAULT_BUCKETS_PER_WINDOW)
    }

    /// Counter over `window`, split into `buckets_per_window` sub-windows.
    pub fn with_buckets(window: Duration, buckets_per_window: u32) -> Self {
        Self { window, buckets_per_window, callers: DashMap::new() }
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record one hit for `caller_key` at `now` and return the in-window total including it.
    pub fn record(&self, caller_key: &str, now: u64) -> u64 {
        self.with_entry(caller_key, |ring| {
            ring.bump(now, |c| *c = c.saturating_add(1));
            ring.total(now)
        })
    }

    /// Record one hit only if the in-window total stays within `limit`.
    pub fn admit(&self, caller_key: &str, now: u64, limit: u64) -> WindowAdmission {
        self.with_entry(caller_key, |ring| {
            let current = ring.total(now);
            if current < limit {
                ring.bump(now, |c| *c = c.saturating_add(1));
                WindowAdmission::Counted { count: current + 1 }
            } else {
                let retry_after = ring.oldest_expiry(now).unwrap_or_else(|| ring.bucket_width());
                WindowAdmission::Full { count: current, retry_after }
            }
        })
    }

    /// In-window total without recording. Unknown callers count zero and are not created.
    pub fn count(&self, caller_key: &str, now: u64) -> u64 {
        let Some(entry) = self.callers.get(caller_key).map(|e| e.value().clone()) else {
            return 0;
        };
        let mut guard = entry.lock().unwrap_or_else(|p| p.into_inner());
        if guard.retired {
            0
        } else {
            guard.ring.total(now)
        }
    }

    /// Live buckets for `caller_key` at `now`, oldest first.
    pub fn buckets(&self, caller_key: &str, now: u64) -> Vec<WindowBucket> {
        let Some(entry) = self.callers.get(caller_key).map(|e| e.value().clone()) else {
            return Vec::new();
        };
        let mut guard = entry.lock().unwrap_or_else(|p| p.into_inner());
        guard.ring.buckets(now)
    }

    /// Remove callers whose newest bucket has expired. Returns how many were removed.
    pub fn purge_idle(&self, now: u64) -> usize {
        let mut removed = 0;
        self.callers.retain(|_, entry| {
            let mut guard = entry.lock().unwrap_or_else(|p| p.into_inner());
            if guard.ring.is_idle(now) {
                guard.retired = true;
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Number of tracked callers.
    pub fn len(&self) -> usize {
        self.callers.len()
    }

    /// True when no caller is tracked.
    pub fn is_empty(&self) -> bool {
        self.callers.is_empty()
    }

    fn entry(&self, caller_key: &str) -> Arc<Mutex<CallerWindow>> {
        if let Some(existing) = self.callers.get(caller_key) {
            return existing.value().clone();
        }
        self.callers
            .entry(caller_key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(CallerWindow {
                    ring: SlidingWindow::new(self.window, self.buckets_per_window),
                    retired: false,
                }))
            })
            .value()
            .clone()
    }

    fn with_entry<R, F>(&self, caller_key: &str, mut f: F) -> R
    where
        F: FnMut(&mut SlidingWindow<u64>) -> R,
    {
        loop {
            let entry = self.entry(caller_key);
            let mut guard = entry.lock().unwrap_or_else(|p| p.into_inner());
            // Purged between lookup and lock; the table already holds (or will get) a fresh entry.
            if guard.retired {
                continue;
            }
            return f(&mut guard.ring);
        }
    }
}
