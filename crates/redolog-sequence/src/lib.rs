//! Sequence generators for the redo log.
//!
//! A sequence generator hands out monotonically increasing 64-bit numbers: the
//! log sequence number of each segment and the first component of every
//! commit id. Two implementations share one contract:
//!
//! - [`LocalSequence`]: an atomic counter owned by one process
//! - [`DistributedSequence`]: a counter shared through a [`CounterStore`]
//!
//! Both wrap from `i64::MAX` to `0` and never issue a value twice.
//!
//! # Example
//!
//! ```
//! use redolog_sequence::{LocalSequence, SequenceGenerator};
//!
//! # tokio_test_block(async {
//! let seq = LocalSequence::new(i64::MAX);
//! assert_eq!(seq.increment_and_get().await.unwrap(), 0);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use async_trait::async_trait;
use redolog_core::{SequenceConfig, SequenceKind};

mod distributed;
mod error;
mod local;

pub use distributed::{CounterStore, DistributedSequence, MemoryCounterStore};
pub use error::{Result, SequenceError};
pub use local::LocalSequence;

/// Source of log sequence numbers.
#[async_trait]
pub trait SequenceGenerator: Send + Sync {
    /// Returns the last value handed out without changing it.
    async fn current(&self) -> Result<i64>;

    /// Resets the counter so the next increment returns `start + 1`.
    ///
    /// Used for first-time setup only, never during normal operation.
    async fn initialize(&self, start: i64) -> Result<()>;

    /// Advances the counter and returns the new value.
    async fn increment_and_get(&self) -> Result<i64>;
}

/// Builds the generator selected by `config`.
///
/// # Errors
///
/// Returns [`SequenceError::Internal`] if a distributed generator is requested
/// without a counter store.
pub fn from_config(
    config: &SequenceConfig,
    store: Option<Arc<dyn CounterStore>>,
) -> Result<Arc<dyn SequenceGenerator>> {
    match config.kind {
        SequenceKind::Local => Ok(Arc::new(LocalSequence::default())),
        SequenceKind::Distributed => {
            let store = store.ok_or_else(|| {
                SequenceError::Internal("distributed sequence requires a counter store".into())
            })?;
            Ok(Arc::new(DistributedSequence::new(store, config)))
        }
    }
}
