//! Fixed window: discrete, epoch-aligned counting windows.

use std::time::Duration;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};

use crate::error::LimitError;

use super::algorithm::{grid_span, window_delta, Outcome, RateLimitAlgorithm};
use super::state::{FixedWindowParams, State};

const NAME: &str = "fixed_window";

/// Admits up to `limit` requests per window.
///
/// Windows are aligned to a grid anchored at the Unix epoch, so every key
/// with the same window length resets at the same instant regardless of
/// when it was first seen.
#[derive(Debug, Clone)]
pub struct FixedWindow {
    limit: u32,
    window: TimeDelta,
}

impl FixedWindow {
    /// Create a window admitting `limit` requests per `window`.
    pub fn new(limit: u32, window: Duration) -> Result<Self, LimitError> {
        if limit == 0 {
            return Err(LimitError::InvalidConfig("fixed window limit must be positive".into()));
        }
        let window = grid_span(window_delta(window, NAME)?, NAME)?;
        Ok(Self { limit, window })
    }

    /// Start of the epoch-aligned window containing `now`.
    fn window_start(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, LimitError> {
        Ok(now.duration_trunc(self.window)?)
    }
}

impl RateLimitAlgorithm for FixedWindow {
    fn name(&self) -> &'static str {
        NAME
    }

    fn first_state(&self, now: DateTime<Utc>) -> Result<State, LimitError> {
        Ok(State::FixedWindow(FixedWindowParams {
            window_start: self.window_start(now)?,
            count: 0,
        }))
    }

    fn action(&self, state: State, now: DateTime<Utc>) -> Result<Outcome, LimitError> {
        let mut params = match state {
            State::FixedWindow(params) => params,
            other => return Err(other.mismatch(NAME)),
        };

        if now - params.window_start >= self.window {
            params.window_start = self.window_start(now)?;
            params.count = 0;
        }

        let allowed = params.count < self.limit;
        if allowed {
            params.count += 1;
        }

        Ok(Outcome {
            allowed,
            state: State::FixedWindow(params),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// An instant on a whole-second boundary.
    fn aligned() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn window_of(state: &State) -> (DateTime<Utc>, u32) {
        match state {
            State::FixedWindow(p) => (p.window_start, p.count),
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn test_limit_then_next_window() {
        let algorithm = FixedWindow::new(2, Duration::from_secs(1)).unwrap();
        let t0 = aligned();
        let mut state = algorithm.first_state(t0).unwrap();

        let mut decisions = Vec::new();
        for _ in 0..2 {
            let outcome = algorithm.action(state, t0).unwrap();
            decisions.push(outcome.allowed);
            state = outcome.state;
        }
        assert_eq!(decisions, vec![true, true]);

        let outcome = algorithm.action(state, t0 + TimeDelta::milliseconds(100)).unwrap();
        assert!(!outcome.allowed);

        let outcome = algorithm
            .action(outcome.state, t0 + TimeDelta::milliseconds(1100))
            .unwrap();
        assert!(outcome.allowed);
        assert_eq!(window_of(&outcome.state), (t0 + TimeDelta::seconds(1), 1));
    }

    #[test]
    fn test_requests_straddling_boundary() {
        let algorithm = FixedWindow::new(10, Duration::from_secs(1)).unwrap();
        let t0 = aligned();
        let mut state = algorithm.first_state(t0).unwrap();

        for offset in [100, 500, 900] {
            state = algorithm
                .action(state, t0 + TimeDelta::milliseconds(offset))
                .unwrap()
                .state;
        }
        assert_eq!(window_of(&state).1, 3);

        let outcome = algorithm.action(state, t0 + TimeDelta::milliseconds(1050)).unwrap();
        assert_eq!(window_of(&outcome.state), (t0 + TimeDelta::seconds(1), 1));
    }

    #[test]
    fn test_keys_reset_in_lockstep() {
        let algorithm = FixedWindow::new(100, Duration::from_secs(10)).unwrap();
        let t0 = aligned();

        let first_seen_a = t0 + TimeDelta::milliseconds(1_200);
        let first_seen_b = t0 + TimeDelta::milliseconds(7_900);

        let a = algorithm
            .action(algorithm.first_state(first_seen_a).unwrap(), first_seen_a)
            .unwrap()
            .state;
        let b = algorithm
            .action(algorithm.first_state(first_seen_b).unwrap(), first_seen_b)
            .unwrap()
            .state;
        assert_eq!(window_of(&a).0, window_of(&b).0);

        let after = t0 + TimeDelta::milliseconds(10_001);
        let a = algorithm.action(a, after).unwrap().state;
        let b = algorithm.action(b, after).unwrap().state;

        assert_eq!(window_of(&a), (t0 + TimeDelta::seconds(10), 1));
        assert_eq!(window_of(&b), (t0 + TimeDelta::seconds(10), 1));
    }

    #[test]
    fn test_unaligned_state_realigns_on_reset() {
        let algorithm = FixedWindow::new(5, Duration::from_secs(1)).unwrap();
        let t0 = aligned();
        let legacy = State::FixedWindow(FixedWindowParams {
            window_start: t0 + TimeDelta::milliseconds(300),
            count: 5,
        });

        let outcome = algorithm.action(legacy, t0 + TimeDelta::milliseconds(2_400)).unwrap();

        assert!(outcome.allowed);
        assert_eq!(window_of(&outcome.state), (t0 + TimeDelta::seconds(2), 1));
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(FixedWindow::new(0, Duration::from_secs(1)).is_err());
        assert!(FixedWindow::new(1, Duration::ZERO).is_err());
    }

    #[test]
    fn test_window_too_long_to_align_is_rejected() {
        let three_centuries = Duration::from_secs(300 * 365 * 24 * 3600);
        let err = FixedWindow::new(1, three_centuries).unwrap_err();
        assert!(matches!(err, LimitError::InvalidConfig(_)));
    }

    #[test]
    fn test_first_state_and_reset_fail_alike_off_grid() {
        let algorithm = FixedWindow::new(5, Duration::from_secs(1)).unwrap();
        // Past the last instant with a nanosecond timestamp.
        let far = DateTime::from_timestamp(10_000_000_000, 0).unwrap();

        assert!(matches!(algorithm.first_state(far), Err(LimitError::Time(_))));

        let stale = algorithm.first_state(aligned()).unwrap();
        assert!(matches!(algorithm.action(stale, far), Err(LimitError::Time(_))));
    }
}
