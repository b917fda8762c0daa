//! Persistence of limiting state.
//!
//! Every backend offers one operation, [`StateStorage::update`], which runs
//! a read-compute-write cycle on a single key such that concurrent updates
//! of the same key can never lose each other's writes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::StorageConfig;
use crate::error::LimitError;
use crate::ratelimit::State;

pub mod memory;
mod pool;
pub mod redis;

pub use memory::MemoryStorage;
pub use redis::RedisStorage;

/// Computes the next state from the current one (`None` when the key holds
/// nothing).
///
/// May be called more than once per update when an optimistic backend
/// detects a conflicting write and retries.
pub type UpdateFn<'a> = dyn FnMut(Option<State>) -> Result<State, LimitError> + Send + 'a;

/// Durable, concurrency-safe state storage.
#[async_trait]
pub trait StateStorage: Send + Sync {
    /// Atomically replace the state stored for `(key, algorithm)` with the
    /// result of `apply`.
    ///
    /// Nothing is written if `apply` fails, and its error is returned as is.
    async fn update(
        &self,
        key: &str,
        algorithm: &str,
        apply: &mut UpdateFn<'_>,
    ) -> Result<(), LimitError>;
}

/// Storage key for one limiting key and algorithm.
pub fn storage_key(key: &str, algorithm: &str) -> String {
    format!("state:{key}:{algorithm}")
}

/// Interval between sweeps of expired in-memory state.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Create the configured storage backend.
///
/// Redis connectivity is checked before returning. The in-memory backend
/// gets a background task dropping expired state, which stops once the
/// storage is dropped.
pub async fn connect(config: &StorageConfig, ttl: Duration) -> Result<Arc<dyn StateStorage>, LimitError> {
    match config {
        StorageConfig::Memory => {
            let storage = Arc::new(MemoryStorage::new(ttl));
            storage.spawn_sweeper(SWEEP_INTERVAL);
            Ok(storage)
        }
        StorageConfig::Redis(redis) => Ok(Arc::new(RedisStorage::connect(redis, ttl).await?)),
    }
}
