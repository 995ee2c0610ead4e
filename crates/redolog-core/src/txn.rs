//! Transaction identifiers.
//!
//! A [`TransactionId`] is a `(time, counter)` pair. Identifiers order first by
//! `time`, then by `counter`, and encode to the external string form
//! `"<time>-<counter>"` exchanged with replicas and tooling.
//!
//! # Example
//!
//! ```
//! use redolog_core::txn::{TransactionId, TxnIdGenerator};
//!
//! let generator = TxnIdGenerator::new();
//! let a = generator.next_id();
//! let b = generator.next_id();
//! assert!(a < b);
//!
//! let decoded: TransactionId = a.to_string().parse().unwrap();
//! assert_eq!(decoded, a);
//! ```

use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Identifies one logical operation attempt.
///
/// Field order matters: the derived `Ord` compares `time` before `counter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId {
    time: i64,
    counter: i32,
}

impl TransactionId {
    /// Creates a transaction id from its parts.
    #[must_use]
    pub const fn new(time: i64, counter: i32) -> Self {
        Self { time, counter }
    }

    /// Returns the time component (seconds since the Unix epoch for generated ids).
    #[must_use]
    pub const fn time(&self) -> i64 {
        self.time
    }

    /// Returns the counter component.
    #[must_use]
    pub const fn counter(&self) -> i32 {
        self.counter
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.time, self.counter)
    }
}

impl FromStr for TransactionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || Error::InvalidTransactionId(s.to_string());
        let parts = parse_dashed(s, 2).ok_or_else(bad)?;
        let counter = i32::try_from(parts[1]).map_err(|_| bad())?;
        Ok(Self::new(parts[0], counter))
    }
}

/// Parses exactly `count` signed integers joined by `-`.
///
/// Each number is `-?[0-9]+`, so negative components stay unambiguous:
/// `"5--3"` is `[5, -3]`. Anything else (signs, spaces, extra parts) fails.
pub(crate) fn parse_dashed(s: &str, count: usize) -> Option<Vec<i64>> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(count);
    let mut pos = 0;

    while out.len() < count {
        if !out.is_empty() {
            if bytes.get(pos) != Some(&b'-') {
                return None;
            }
            pos += 1;
        }
        let start = pos;
        if bytes.get(pos) == Some(&b'-') {
            pos += 1;
        }
        let digits = pos;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            pos += 1;
        }
        if pos == digits {
            return None;
        }
        out.push(s[start..pos].parse().ok()?);
    }

    (pos == bytes.len()).then_some(out)
}

#[derive(Debug)]
struct GeneratorState {
    time: i64,
    counter: i32,
}

/// Issues strictly increasing transaction ids for one manager instance.
///
/// The counter is separate from the log sequence counter. When it reaches
/// `i32::MAX` the generator moves to a later time and restarts at 1, so ids
/// keep increasing even if the wall clock has not advanced.
#[derive(Debug)]
pub struct TxnIdGenerator {
    state: Mutex<GeneratorState>,
}

impl TxnIdGenerator {
    /// Creates a generator starting at the current second.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(now_secs(), 1)
    }

    /// Creates a generator whose first id is `(time, counter)`.
    #[must_use]
    pub fn starting_at(time: i64, counter: i32) -> Self {
        Self { state: Mutex::new(GeneratorState { time, counter }) }
    }

    /// Returns the next transaction id.
    pub fn next_id(&self) -> TransactionId {
        let mut state = self.state.lock();
        let id = TransactionId::new(state.time, state.counter);
        if state.counter < i32::MAX {
            state.counter += 1;
        } else {
            state.time = now_secs().max(state.time + 1);
            state.counter = 1;
        }
        id
    }

    /// Makes sure every future id compares greater than `seen`.
    ///
    /// Called with the largest id found in the log on startup, so ids keep
    /// increasing across restarts that happen within the same second.
    pub fn observe(&self, seen: TransactionId) {
        let mut state = self.state.lock();
        let next = TransactionId::new(state.time, state.counter);
        if seen < next {
            return;
        }
        if seen.counter() < i32::MAX {
            state.time = seen.time();
            state.counter = seen.counter() + 1;
        } else {
            state.time = seen.time() + 1;
            state.counter = 1;
        }
    }
}

impl Default for TxnIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
