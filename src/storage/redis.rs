//! Redis-backed state storage shared by every gateway replica.
//!
//! Updates use optimistic concurrency: the key is `WATCH`ed before it is
//! read, and the write is committed in a `MULTI`/`EXEC` block that Redis
//! aborts if anyone else wrote the key in between.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::RedisError;
use tracing::{debug, info, warn};

use crate::config::RedisConfig;
use crate::error::LimitError;
use crate::ratelimit::State;

use super::pool::{create_pool, Pool};
use super::{storage_key, StateStorage, UpdateFn};

/// Redis state storage.
pub struct RedisStorage {
    pool: Pool,
    ttl_ms: u64,
    max_retries: u32,
}

impl RedisStorage {
    /// Build the connection pool and check the server answers.
    pub async fn connect(config: &RedisConfig, ttl: Duration) -> Result<Self, LimitError> {
        let pool = create_pool(&config.url, &config.pool).map_err(unavailable)?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| LimitError::StorageUnavailable(format!("cannot connect to Redis: {e}")))?;
        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(unavailable)?;

        info!(url = %config.url, max_size = config.pool.max_size, "Connected to Redis");

        Ok(Self {
            pool,
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1),
            max_retries: config.max_retries.max(1),
        })
    }

    /// One optimistic attempt. `Ok(false)` means another writer won.
    async fn attempt(
        &self,
        conn: &mut MultiplexedConnection,
        key: &str,
        apply: &mut UpdateFn<'_>,
    ) -> Result<bool, LimitError> {
        redis::cmd("WATCH")
            .arg(key)
            .query_async::<()>(conn)
            .await
            .map_err(unavailable)?;

        let stored: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(conn)
            .await
            .map_err(unavailable)?;

        let next = match compute(stored, apply) {
            Ok(bytes) => bytes,
            Err(e) => {
                // Leave the connection clean for its next user.
                if let Err(unwatch) = redis::cmd("UNWATCH").query_async::<()>(conn).await {
                    warn!(error = %unwatch, "UNWATCH failed after a rejected update");
                }
                return Err(e);
            }
        };

        let committed: Option<()> = redis::pipe()
            .atomic()
            .pset_ex(key, next, self.ttl_ms)
            .ignore()
            .query_async(conn)
            .await
            .map_err(unavailable)?;

        Ok(committed.is_some())
    }
}

fn compute(stored: Option<Vec<u8>>, apply: &mut UpdateFn<'_>) -> Result<Vec<u8>, LimitError> {
    let current = stored.as_deref().map(State::decode).transpose()?;
    apply(current)?.encode()
}

fn unavailable(e: RedisError) -> LimitError {
    LimitError::StorageUnavailable(e.to_string())
}

#[async_trait]
impl StateStorage for RedisStorage {
    async fn update(
        &self,
        key: &str,
        algorithm: &str,
        apply: &mut UpdateFn<'_>,
    ) -> Result<(), LimitError> {
        let storage_key = storage_key(key, algorithm);
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| LimitError::StorageUnavailable(format!("no Redis connection available: {e}")))?;

        for attempt in 1..=self.max_retries {
            if self.attempt(&mut conn, &storage_key, apply).await? {
                return Ok(());
            }
            debug!(key = %storage_key, attempt, "Concurrent write detected, retrying");
        }

        warn!(key = %storage_key, attempts = self.max_retries, "Giving up on contended key");
        Err(LimitError::Contention {
            attempts: self.max_retries,
        })
    }
}
