//! Sliding window counter: a ring of sub-window counts approximating a
//! trailing window in constant memory.

use std::time::Duration;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};

use crate::error::LimitError;

use super::algorithm::{grid_span, window_cutoff, window_delta, Outcome, RateLimitAlgorithm};
use super::state::{SlidingCounterParams, State};

const NAME: &str = "sliding_window_counter";

/// Splits the window into `buckets` epoch-aligned sub-windows and admits a
/// request while the live sub-windows hold fewer than `limit` requests.
#[derive(Debug, Clone)]
pub struct SlidingWindowCounter {
    limit: i64,
    window: TimeDelta,
    bucket_size: TimeDelta,
    buckets: usize,
}

impl SlidingWindowCounter {
    /// Create a counter admitting about `limit` requests per `window`,
    /// tracked in `buckets` sub-windows.
    pub fn new(limit: u64, window: Duration, buckets: u32) -> Result<Self, LimitError> {
        let limit = i64::try_from(limit)
            .ok()
            .filter(|limit| *limit > 0)
            .ok_or_else(|| {
                LimitError::InvalidConfig(format!("sliding counter limit {limit} is out of range"))
            })?;
        let count = i32::try_from(buckets)
            .ok()
            .filter(|count| *count > 0)
            .ok_or_else(|| {
                LimitError::InvalidConfig(format!("sliding counter bucket count {buckets} is out of range"))
            })?;

        let window = window_delta(window, NAME)?;
        let bucket_size = window / count;
        if bucket_size <= TimeDelta::zero() {
            return Err(LimitError::InvalidConfig(format!(
                "sliding counter window is too short for {buckets} buckets"
            )));
        }
        let bucket_size = grid_span(bucket_size, NAME)?;

        Ok(Self {
            limit,
            window,
            bucket_size,
            buckets: count as usize,
        })
    }

    fn check_shape(&self, params: &SlidingCounterParams) -> Result<(), LimitError> {
        if params.buckets.len() != self.buckets
            || params.bucket_times.len() != self.buckets
            || params.current_index >= self.buckets
        {
            return Err(LimitError::InvalidState {
                expected: NAME,
                found: format!(
                    "{} buckets, {} bucket times, index {} (configured for {})",
                    params.buckets.len(),
                    params.bucket_times.len(),
                    params.current_index,
                    self.buckets
                ),
            });
        }
        Ok(())
    }
}

impl RateLimitAlgorithm for SlidingWindowCounter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn first_state(&self, _now: DateTime<Utc>) -> Result<State, LimitError> {
        Ok(State::SlidingWindowCounter(SlidingCounterParams {
            buckets: vec![0; self.buckets],
            bucket_times: vec![None; self.buckets],
            current_index: 0,
        }))
    }

    fn action(&self, state: State, now: DateTime<Utc>) -> Result<Outcome, LimitError> {
        let mut params = match state {
            State::SlidingWindowCounter(params) => params,
            other => return Err(other.mismatch(NAME)),
        };
        self.check_shape(&params)?;

        let current_start = now.duration_trunc(self.bucket_size)?;
        let target = match params
            .bucket_times
            .iter()
            .position(|t| *t == Some(current_start))
        {
            Some(index) => index,
            None => {
                // Claim the next slot in the ring for this sub-window.
                let index = (params.current_index + 1) % self.buckets;
                params.current_index = index;
                params.buckets[index] = 0;
                params.bucket_times[index] = Some(current_start);
                index
            }
        };

        let cutoff = window_cutoff(now, self.window)?;
        for (count, time) in params.buckets.iter_mut().zip(params.bucket_times.iter_mut()) {
            if matches!(time, Some(t) if *t < cutoff) {
                *count = 0;
                *time = None;
            }
        }

        let total: i64 = params
            .buckets
            .iter()
            .zip(&params.bucket_times)
            .filter(|(_, time)| match time {
                // A sub-window ending past the calendar is still live.
                Some(t) => t.checked_add_signed(self.bucket_size).map_or(true, |end| end > cutoff),
                None => false,
            })
            .map(|(count, _)| *count)
            .sum();

        let allowed = total < self.limit;
        if allowed {
            params.buckets[target] += 1;
        }

        Ok(Outcome {
            allowed,
            state: State::SlidingWindowCounter(params),
        })
    }
}
