//! Token bucket: a continuously refilling pool bounded by a capacity.

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::LimitError;

use super::algorithm::{Outcome, RateLimitAlgorithm};
use super::state::{State, TokenBucketParams};

const NAME: &str = "token_bucket";

/// Admits a request when at least one whole token is available.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    /// Tokens added per second
    rate: f64,
}

impl TokenBucket {
    /// Create a bucket holding at most `capacity` tokens, refilled at `rate`
    /// tokens per second.
    pub fn new(capacity: u32, rate: f64) -> Result<Self, LimitError> {
        if capacity == 0 {
            return Err(LimitError::InvalidConfig("token bucket capacity must be positive".into()));
        }
        if !rate.is_finite() || rate <= 0.0 {
            return Err(LimitError::InvalidConfig(format!(
                "token bucket rate must be a positive number, got {rate}"
            )));
        }
        Ok(Self {
            capacity: f64::from(capacity),
            rate,
        })
    }
}

impl RateLimitAlgorithm for TokenBucket {
    fn name(&self) -> &'static str {
        NAME
    }

    fn first_state(&self, now: DateTime<Utc>) -> Result<State, LimitError> {
        Ok(State::TokenBucket(TokenBucketParams {
            tokens: self.capacity,
            last_update: now,
        }))
    }

    fn action(&self, state: State, now: DateTime<Utc>) -> Result<Outcome, LimitError> {
        let mut params = match state {
            State::TokenBucket(params) => params,
            other => return Err(other.mismatch(NAME)),
        };

        // Another replica may have written with a clock slightly ahead of ours.
        let elapsed = (now - params.last_update).max(TimeDelta::zero());
        let elapsed_secs = elapsed.num_seconds() as f64 + f64::from(elapsed.subsec_nanos()) / 1e9;

        params.tokens = (params.tokens + elapsed_secs * self.rate).min(self.capacity);
        params.last_update = now;

        let allowed = params.tokens >= 1.0;
        if allowed {
            params.tokens -= 1.0;
        }

        Ok(Outcome {
            allowed,
            state: State::TokenBucket(params),
        })
    }
}
