//! Cluster-shared sequence generator.
//!
//! The counter lives in an external store reached through [`CounterStore`].
//! Stores increment with a plain wrapping 64-bit add, so the wrap-at-max rule
//! is applied cooperatively by the clients:
//!
//! 1. The client that receives `i64::MAX` keeps it and tries
//!    `compare_and_set(MAX, -1)`, so the next increment yields `0`.
//! 2. A client that receives a negative value was too quick: the counter went
//!    past `MAX` before the reset landed. It discards that value, resets the
//!    store with `compare_and_set(value, -1)` and increments again.
//!
//! At most one reset wins for any given store value, and a discarded negative
//! value is never returned, so no value is issued twice.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use redolog_core::SequenceConfig;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Result, SequenceError};
use crate::SequenceGenerator;

/// Store value that makes the next increment return zero.
const RESET_BASELINE: i64 = -1;

/// An external store offering atomic operations on named 64-bit counters.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Returns the counter value (zero if the counter does not exist).
    async fn get(&self, key: &str) -> Result<i64>;

    /// Overwrites the counter.
    async fn set(&self, key: &str, value: i64) -> Result<()>;

    /// Adds one (wrapping) and returns the new value.
    async fn increment_and_get(&self, key: &str) -> Result<i64>;

    /// Replaces the value with `new` if it currently equals `expect`.
    async fn compare_and_set(&self, key: &str, expect: i64, new: i64) -> Result<bool>;
}

/// In-process [`CounterStore`].
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: DashMap<String, i64>,
}

impl MemoryCounterStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> Result<i64> {
        Ok(self.counters.get(key).map_or(0, |v| *v))
    }

    async fn set(&self, key: &str, value: i64) -> Result<()> {
        self.counters.insert(key.to_string(), value);
        Ok(())
    }

    async fn increment_and_get(&self, key: &str) -> Result<i64> {
        let mut entry = self.counters.entry(key.to_string()).or_insert(0);
        *entry = entry.wrapping_add(1);
        Ok(*entry)
    }

    async fn compare_and_set(&self, key: &str, expect: i64, new: i64) -> Result<bool> {
        let mut entry = self.counters.entry(key.to_string()).or_insert(0);
        if *entry == expect {
            *entry = new;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

/// Sequence generator backed by a shared [`CounterStore`].
pub struct DistributedSequence {
    store: Arc<dyn CounterStore>,
    key: String,
    timeout: Duration,
    max_reset_attempts: u32,
}

impl DistributedSequence {
    /// Creates a generator for the counter named in `config`.
    pub fn new(store: Arc<dyn CounterStore>, config: &SequenceConfig) -> Self {
        Self {
            store,
            key: config.key.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            max_reset_attempts: config.max_reset_attempts,
        }
    }

    /// Returns the counter key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Runs one store call under the configured timeout.
    async fn bounded<T: Send>(&self, call: impl Future<Output = Result<T>> + Send) -> Result<T> {
        match timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(SequenceError::Timeout {
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

impl std::fmt::Debug for DistributedSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedSequence")
            .field("key", &self.key)
            .field("timeout", &self.timeout)
            .field("max_reset_attempts", &self.max_reset_attempts)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SequenceGenerator for DistributedSequence {
    async fn current(&self) -> Result<i64> {
        self.bounded(self.store.get(&self.key)).await
    }

    async fn initialize(&self, start: i64) -> Result<()> {
        self.bounded(self.store.set(&self.key, start)).await
    }

    async fn increment_and_get(&self) -> Result<i64> {
        let mut resets = 0u32;
        loop {
            let value = self.bounded(self.store.increment_and_get(&self.key)).await?;

            if value == i64::MAX {
                let reset = self.store.compare_and_set(&self.key, i64::MAX, RESET_BASELINE);
                match self.bounded(reset).await {
                    Ok(true) => debug!(key = %self.key, "Sequence wrapped, counter reset"),
                    Ok(false) => debug!(key = %self.key, "Sequence wrap already handled by a peer"),
                    // The next caller sees a negative value and resets instead.
                    Err(e) => {
                        warn!(key = %self.key, error = %e, "Failed to reset wrapped sequence");
                    }
                }
                return Ok(value);
            }

            if value < 0 {
                if resets >= self.max_reset_attempts {
                    return Err(SequenceError::Conflict { attempts: resets });
                }
                resets += 1;
                let won = self
                    .bounded(self.store.compare_and_set(&self.key, value, RESET_BASELINE))
                    .await?;
                debug!(key = %self.key, value, won, "Discarded value past wrap, retrying");
                continue;
            }

            return Ok(value);
        }
    }
}
