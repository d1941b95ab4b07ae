//! Atomically published values.
//!
//! [`Published<T>`] is the single pathway through which runtime policy changes reach the request
//! path: the adaptive throttle stores a fresh [`crate::throttle::ThrottleSnapshot`] each tick and
//! the rate limiter, circuit breakers and dispatcher load it without blocking. Backed by
//! `ArcSwap`, so a reader sees either the old or the new value, never a mix.

use arc_swap::ArcSwap;
use std::sync::Arc;

/// Shared, lock-free, atomically swapped value.
#[derive(Debug)]
pub struct Published<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for Published<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> Published<T> {
    /// Publish an initial value.
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value (cheap clone of Arc).
    pub fn load(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the value, returning the one it replaced.
    pub fn replace(&self, value: T) -> Arc<T> {
        self.inner.swap(Arc::new(value))
    }

    /// Replace the value entirely.
    pub fn store(&self, value: T) {
        self.inner.store(Arc::new(value));
    }
}

impl<T: Default> Default for Published<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
