//! Process-local sequence generator.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;

use crate::error::Result;
use crate::SequenceGenerator;

/// Returns the value after `current`, wrapping from `i64::MAX` to zero.
#[inline]
pub(crate) const fn successor(current: i64) -> i64 {
    if current == i64::MAX {
        0
    } else {
        current + 1
    }
}

/// Sequence generator backed by an atomic counter.
///
/// Every value is handed out exactly once, including across the wrap: of two
/// callers racing at `i64::MAX - 1`, one receives `i64::MAX` and the other `0`.
#[derive(Debug, Default)]
pub struct LocalSequence {
    value: AtomicI64,
}

impl LocalSequence {
    /// Creates a generator whose first `increment_and_get` returns `start + 1`.
    #[must_use]
    pub const fn new(start: i64) -> Self {
        Self { value: AtomicI64::new(start) }
    }

    /// Returns the last value handed out.
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// Resets the counter. Only meant for first-time setup.
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Release);
    }

    /// Advances the counter and returns the new value.
    pub fn next(&self) -> i64 {
        let mut current = self.value.load(Ordering::Acquire);
        loop {
            let next = successor(current);
            match self.value.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

#[async_trait]
impl SequenceGenerator for LocalSequence {
    async fn current(&self) -> Result<i64> {
        Ok(self.get())
    }

    async fn initialize(&self, start: i64) -> Result<()> {
        self.set(start);
        Ok(())
    }

    async fn increment_and_get(&self) -> Result<i64> {
        Ok(self.next())
    }
}
