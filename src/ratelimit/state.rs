//! Persisted limiting state.
//!
//! A [`State`] is the unit of progress for one (limiting key, algorithm)
//! pair. Algorithms consume a state by value and return a new one, so the
//! storage layer always deals with distinct snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LimitError;

/// Token bucket progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketParams {
    /// Tokens left in the bucket
    pub tokens: f64,
    /// When the bucket was last refilled
    pub last_update: DateTime<Utc>,
}

/// Fixed window progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedWindowParams {
    /// Epoch-aligned start of the current window
    pub window_start: DateTime<Utc>,
    /// Requests admitted in the current window
    pub count: u32,
}

/// Sliding window log progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlidingLogParams {
    /// Admitted request instants, oldest first
    pub logs: Vec<DateTime<Utc>>,
}

/// Sliding window counter progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlidingCounterParams {
    /// Request count per sub-window
    pub buckets: Vec<i64>,
    /// Start of the sub-window each bucket covers; `None` for an unused slot
    pub bucket_times: Vec<Option<DateTime<Utc>>>,
    /// Most recently claimed slot
    pub current_index: usize,
}

/// Algorithm-specific limiting state.
///
/// The variant tag travels with the payload, so a state written by one
/// algorithm is recognised (and rejected) when read back by another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", content = "params", rename_all = "snake_case")]
pub enum State {
    /// See [`crate::ratelimit::TokenBucket`]
    TokenBucket(TokenBucketParams),
    /// See [`crate::ratelimit::FixedWindow`]
    FixedWindow(FixedWindowParams),
    /// See [`crate::ratelimit::SlidingWindowLog`]
    SlidingWindowLog(SlidingLogParams),
    /// See [`crate::ratelimit::SlidingWindowCounter`]
    SlidingWindowCounter(SlidingCounterParams),
}

impl State {
    /// Name of the algorithm this state belongs to.
    pub fn algorithm(&self) -> &'static str {
        match self {
            State::TokenBucket(_) => "token_bucket",
            State::FixedWindow(_) => "fixed_window",
            State::SlidingWindowLog(_) => "sliding_window_log",
            State::SlidingWindowCounter(_) => "sliding_window_counter",
        }
    }

    /// Serialize the state to its storage representation.
    pub fn encode(&self) -> Result<Vec<u8>, LimitError> {
        serde_json::to_vec(self).map_err(LimitError::Encode)
    }

    /// Restore a state from its storage representation.
    pub fn decode(bytes: &[u8]) -> Result<Self, LimitError> {
        serde_json::from_slice(bytes).map_err(LimitError::Decode)
    }

    pub(crate) fn mismatch(self, expected: &'static str) -> LimitError {
        LimitError::InvalidState {
            expected,
            found: self.algorithm().to_string(),
        }
    }
}
