//! The limiting algorithm contract and the closed set of implementations.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::config::AlgorithmSettings;
use crate::error::LimitError;

use super::fixed_window::FixedWindow;
use super::sliding_counter::SlidingWindowCounter;
use super::sliding_log::SlidingWindowLog;
use super::state::State;
use super::token_bucket::TokenBucket;

/// Result of one algorithm step.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// Whether the request is admitted
    pub allowed: bool,
    /// State to persist for the next request
    pub state: State,
}

/// A pure admission function over persisted state.
///
/// Implementations receive "now" from the caller, which reads the clock
/// exactly once per decision, and never suspend.
pub trait RateLimitAlgorithm: Send + Sync {
    /// Logical name, used as part of the storage key.
    fn name(&self) -> &'static str;

    /// State for a key that has no recorded activity.
    ///
    /// Fails only when `now` cannot be placed on the algorithm's window grid.
    fn first_state(&self, now: DateTime<Utc>) -> Result<State, LimitError>;

    /// Decide on one request and produce the state that reflects it.
    ///
    /// Fails with [`LimitError::InvalidState`] if `state` was not produced
    /// by this algorithm.
    fn action(&self, state: State, now: DateTime<Utc>) -> Result<Outcome, LimitError>;
}

/// One of the four supported algorithms, resolved from configuration.
#[derive(Debug, Clone)]
pub enum Algorithm {
    /// Continuous refill up to a burst capacity
    TokenBucket(TokenBucket),
    /// Counting per epoch-aligned window
    FixedWindow(FixedWindow),
    /// Exact log of admitted instants
    SlidingWindowLog(SlidingWindowLog),
    /// Ring of sub-window counters
    SlidingWindowCounter(SlidingWindowCounter),
}

impl Algorithm {
    /// Build the configured algorithm.
    pub fn from_settings(settings: &AlgorithmSettings) -> Result<Self, LimitError> {
        let algorithm = match settings {
            AlgorithmSettings::TokenBucket(s) => {
                Algorithm::TokenBucket(TokenBucket::new(s.capacity, s.rate)?)
            }
            AlgorithmSettings::FixedWindow(s) => {
                Algorithm::FixedWindow(FixedWindow::new(s.limit, s.window)?)
            }
            AlgorithmSettings::SlidingWindowLog(s) => {
                Algorithm::SlidingWindowLog(SlidingWindowLog::new(s.limit, s.window)?)
            }
            AlgorithmSettings::SlidingWindowCounter(s) => Algorithm::SlidingWindowCounter(
                SlidingWindowCounter::new(s.limit, s.window, s.buckets)?,
            ),
        };
        Ok(algorithm)
    }

    fn inner(&self) -> &dyn RateLimitAlgorithm {
        match self {
            Algorithm::TokenBucket(a) => a,
            Algorithm::FixedWindow(a) => a,
            Algorithm::SlidingWindowLog(a) => a,
            Algorithm::SlidingWindowCounter(a) => a,
        }
    }
}

/// Convert a configured window into a non-empty `TimeDelta`.
pub(crate) fn window_delta(window: Duration, what: &str) -> Result<TimeDelta, LimitError> {
    let delta = TimeDelta::from_std(window)
        .map_err(|_| LimitError::InvalidConfig(format!("{what} window {window:?} is too large")))?;
    if delta <= TimeDelta::zero() {
        return Err(LimitError::InvalidConfig(format!("{what} window must be positive")));
    }
    Ok(delta)
}

/// Reject spans whose nanosecond count overflows, which cannot be used to
/// truncate instants onto the epoch grid.
pub(crate) fn grid_span(span: TimeDelta, what: &str) -> Result<TimeDelta, LimitError> {
    match span.num_nanoseconds() {
        Some(_) => Ok(span),
        None => Err(LimitError::InvalidConfig(format!(
            "{what} span {span} is too long to align to the epoch"
        ))),
    }
}

/// Oldest instant still inside the trailing `window` that ends at `now`.
pub(crate) fn window_cutoff(now: DateTime<Utc>, window: TimeDelta) -> Result<DateTime<Utc>, LimitError> {
    now.checked_sub_signed(window).ok_or_else(|| {
        LimitError::InvalidConfig(format!("window {window} reaches before the earliest representable instant"))
    })
}

impl RateLimitAlgorithm for Algorithm {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn first_state(&self, now: DateTime<Utc>) -> Result<State, LimitError> {
        self.inner().first_state(now)
    }

    fn action(&self, state: State, now: DateTime<Utc>) -> Result<Outcome, LimitError> {
        self.inner().action(state, now)
    }
}
