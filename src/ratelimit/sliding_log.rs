//! Sliding window log: exact counting over a trailing window.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::LimitError;

use super::algorithm::{window_cutoff, window_delta, Outcome, RateLimitAlgorithm};
use super::state::{SlidingLogParams, State};

const NAME: &str = "sliding_window_log";

/// Records the instant of every admitted request and admits a new one while
/// fewer than `limit` fall inside the trailing window.
///
/// Memory per key grows with `limit`.
#[derive(Debug, Clone)]
pub struct SlidingWindowLog {
    limit: u32,
    window: TimeDelta,
}

impl SlidingWindowLog {
    /// Create a log admitting `limit` requests in any trailing `window`.
    pub fn new(limit: u32, window: Duration) -> Result<Self, LimitError> {
        if limit == 0 {
            return Err(LimitError::InvalidConfig("sliding log limit must be positive".into()));
        }
        Ok(Self {
            limit,
            window: window_delta(window, NAME)?,
        })
    }
}

impl RateLimitAlgorithm for SlidingWindowLog {
    fn name(&self) -> &'static str {
        NAME
    }

    fn first_state(&self, _now: DateTime<Utc>) -> Result<State, LimitError> {
        Ok(State::SlidingWindowLog(SlidingLogParams { logs: Vec::new() }))
    }

    fn action(&self, state: State, now: DateTime<Utc>) -> Result<Outcome, LimitError> {
        let mut params = match state {
            State::SlidingWindowLog(params) => params,
            other => return Err(other.mismatch(NAME)),
        };

        let window_start = window_cutoff(now, self.window)?;
        let expired = params.logs.partition_point(|t| *t <= window_start);
        params.logs.drain(..expired);

        let allowed = params.logs.len() < self.limit as usize;
        if allowed {
            // Usually appends; a lagging clock lands the entry further back.
            let at = params.logs.partition_point(|t| *t <= now);
            params.logs.insert(at, now);
        }

        Ok(Outcome {
            allowed,
            state: State::SlidingWindowLog(params),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn logs(state: &State) -> &[DateTime<Utc>] {
        match state {
            State::SlidingWindowLog(p) => &p.logs,
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn test_first_state_is_empty() {
        let log = SlidingWindowLog::new(3, Duration::from_secs(10)).unwrap();
        assert!(logs(&log.first_state(start()).unwrap()).is_empty());
    }

    #[test]
    fn test_exact_trailing_window() {
        let log = SlidingWindowLog::new(3, Duration::from_secs(10)).unwrap();
        let t0 = start();
        let mut state = log.first_state(t0).unwrap();

        for secs in 0..3 {
            let outcome = log.action(state, t0 + TimeDelta::seconds(secs)).unwrap();
            assert!(outcome.allowed);
            state = outcome.state;
        }

        let outcome = log.action(state, t0 + TimeDelta::seconds(5)).unwrap();
        assert!(!outcome.allowed);
        assert_eq!(logs(&outcome.state).len(), 3, "denied requests are not logged");

        let outcome = log
            .action(outcome.state, t0 + TimeDelta::milliseconds(9_999))
            .unwrap();
        assert!(!outcome.allowed);

        let outcome = log.action(outcome.state, t0 + TimeDelta::seconds(10)).unwrap();
        assert!(outcome.allowed);
        assert_eq!(
            logs(&outcome.state),
            &[
                t0 + TimeDelta::seconds(1),
                t0 + TimeDelta::seconds(2),
                t0 + TimeDelta::seconds(10)
            ]
        );
    }

    #[test]
    fn test_everything_expires_after_idle_window() {
        let log = SlidingWindowLog::new(2, Duration::from_secs(1)).unwrap();
        let t0 = start();
        let mut state = log.first_state(t0).unwrap();
        for _ in 0..2 {
            state = log.action(state, t0).unwrap().state;
        }

        let outcome = log.action(state, t0 + TimeDelta::minutes(5)).unwrap();

        assert!(outcome.allowed);
        assert_eq!(logs(&outcome.state), &[t0 + TimeDelta::minutes(5)]);
    }

    #[test]
    fn test_lagging_clock_keeps_log_sorted() {
        let log = SlidingWindowLog::new(5, Duration::from_secs(10)).unwrap();
        let t0 = start();
        let mut state = log.first_state(t0).unwrap();

        for offset in [0, 4_000, 2_000, 3_000] {
            state = log
                .action(state, t0 + TimeDelta::milliseconds(offset))
                .unwrap()
                .state;
        }

        let entries = logs(&state);
        assert!(entries.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(entries.len(), 4);
    }

    #[test]
    fn test_window_reaching_before_calendar_is_an_error() {
        // Longer than the whole representable calendar.
        let log = SlidingWindowLog::new(10, Duration::from_secs(2_400_000_000 * 3600)).unwrap();
        let now = start();

        let err = log.action(log.first_state(now).unwrap(), now).unwrap_err();
        assert!(matches!(err, LimitError::InvalidConfig(_)));
    }
}
