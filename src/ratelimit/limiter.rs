//! The limiter: one algorithm bound to one storage backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::config::LimiterConfig;
use crate::error::LimitError;
use crate::storage::{self, StateStorage};

use super::algorithm::{Algorithm, RateLimitAlgorithm};
use super::backend::RateLimiterBackend;
use super::clock::{Clock, SystemClock};
use super::metrics::{DecisionRecorder, NoopRecorder};
use super::state::State;

/// Storage deadline used when none is configured.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Makes admission decisions for arbitrary keys.
///
/// Holds no per-key state of its own: every decision re-reads the storage,
/// which may be shared with other gateway replicas.
pub struct Limiter {
    /// Label reported to the decision recorder
    name: String,
    algorithm: Algorithm,
    storage: Arc<dyn StateStorage>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    recorder: Arc<dyn DecisionRecorder>,
}

impl Limiter {
    /// Create a limiter using the system clock and no decision recorder.
    pub fn new(name: impl Into<String>, algorithm: Algorithm, storage: Arc<dyn StateStorage>) -> Self {
        Self {
            name: name.into(),
            algorithm,
            storage,
            clock: Arc::new(SystemClock),
            timeout: DEFAULT_TIMEOUT,
            recorder: Arc::new(NoopRecorder),
        }
    }

    /// Build the algorithm and connect the storage described by `config`.
    pub async fn from_config(
        name: impl Into<String>,
        config: &LimiterConfig,
        recorder: Arc<dyn DecisionRecorder>,
    ) -> Result<Self, LimitError> {
        let name = name.into();
        let algorithm = Algorithm::from_settings(&config.algorithm)?;
        let storage = storage::connect(&config.storage, config.ttl).await?;

        debug!(
            limiter = %name,
            algorithm = algorithm.name(),
            ttl = ?config.ttl,
            timeout = ?config.timeout,
            "Limiter ready"
        );

        Ok(Self::new(name, algorithm, storage)
            .with_timeout(config.timeout)
            .with_recorder(recorder))
    }

    /// Read "now" from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Deadline for one decision, storage round-trips included.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Report every decision to `recorder`.
    pub fn with_recorder(mut self, recorder: Arc<dyn DecisionRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn algorithm(&self) -> &Algorithm {
        &self.algorithm
    }

    /// Decide whether one more request for `key` is admitted.
    ///
    /// Errors are never turned into a decision here; the caller chooses
    /// whether to fail open or closed.
    pub async fn allow(&self, key: &str) -> Result<bool, LimitError> {
        let algorithm = &self.algorithm;
        let clock = &self.clock;
        let mut decision = None;

        // Runs once per storage attempt, each time with a fresh clock read.
        let mut apply = |current: Option<State>| -> Result<State, LimitError> {
            let now = clock.now();
            let state = match current {
                Some(state) => state,
                None => algorithm.first_state(now)?,
            };
            let outcome = algorithm.action(state, now)?;
            decision = Some(outcome.allowed);
            Ok(outcome.state)
        };

        let update = self.storage.update(key, algorithm.name(), &mut apply);
        match tokio::time::timeout(self.timeout, update).await {
            Ok(result) => result?,
            Err(_) => return Err(LimitError::Timeout(self.timeout)),
        }

        let allowed = decision.ok_or_else(|| {
            LimitError::StorageUnavailable("storage reported success without applying the update".into())
        })?;

        trace!(limiter = %self.name, key, allowed, algorithm = algorithm.name(), "Limit decision");
        self.recorder.record(&self.name, key, allowed);
        Ok(allowed)
    }
}

#[async_trait]
impl RateLimiterBackend for Limiter {
    async fn allow(&self, key: &str) -> Result<bool, LimitError> {
        Limiter::allow(self, key).await
    }
}
