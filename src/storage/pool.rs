//! Pooled Redis connections for optimistic transactions.

use deadpool::managed::{self, Metrics, RecycleError, RecycleResult};
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, RedisResult};
use tracing::debug;

use crate::config::RedisPoolConfig;

pub(crate) type Pool = managed::Pool<Manager>;

/// Hands out one dedicated connection per checkout.
///
/// A `WATCH` applies to the whole connection, so transactions need a
/// connection nobody else is writing to while they run.
#[derive(Debug)]
pub(crate) struct Manager {
    client: Client,
}

impl managed::Manager for Manager {
    type Type = MultiplexedConnection;
    type Error = RedisError;

    async fn create(&self) -> Result<MultiplexedConnection, RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    /// A transaction abandoned mid-flight leaves its keys watched, and the
    /// next borrower would see spurious conflicts. `UNWATCH` clears that and
    /// its reply doubles as a liveness check.
    async fn recycle(&self, conn: &mut MultiplexedConnection, metrics: &Metrics) -> RecycleResult<RedisError> {
        let reply: String = redis::cmd("UNWATCH").query_async(conn).await?;
        if reply != "OK" {
            debug!(reply = %reply, recycled = metrics.recycle_count, "Dropping Redis connection");
            return Err(RecycleError::message(format!("UNWATCH answered `{reply}`")));
        }
        Ok(())
    }
}

pub(crate) fn create_pool(url: &str, config: &RedisPoolConfig) -> RedisResult<Pool> {
    let manager = Manager {
        client: Client::open(url)?,
    };

    let mut pool_config = managed::PoolConfig::new(config.max_size);
    pool_config.timeouts.wait = Some(config.timeout_wait);
    pool_config.timeouts.create = Some(config.timeout_create);

    Pool::builder(manager)
        .config(pool_config)
        .runtime(deadpool::Runtime::Tokio1)
        .build()
        .map_err(|e| RedisError::from((redis::ErrorKind::IoError, "cannot build connection pool", e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    #[tokio::test]
    async fn test_pool_is_built_lazily() {
        let config = RedisPoolConfig {
            max_size: 3,
            timeout_wait: Duration::from_millis(50),
            timeout_create: Duration::from_millis(50),
        };
        let pool = create_pool("redis://127.0.0.1:1", &config).unwrap();

        assert_eq!(pool.status().max_size, 3);
        assert_eq!(pool.status().size, 0);
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(create_pool("not a url", &RedisPoolConfig::default()).is_err());
    }

    #[tokio::test]
    #[ignore = "requires a Redis server"]
    async fn test_returned_connection_forgets_watches() {
        let config = RedisPoolConfig {
            max_size: 1,
            ..RedisPoolConfig::default()
        };
        let pool = create_pool(&redis_url(), &config).unwrap();
        let key = "floodgate:test:pool:watch";

        {
            let mut conn = pool.get().await.unwrap();
            let _: () = redis::cmd("WATCH").arg(key).query_async(&mut *conn).await.unwrap();
        }

        let mut other = Client::open(redis_url())
            .unwrap()
            .get_multiplexed_async_connection()
            .await
            .unwrap();
        let _: () = redis::cmd("SET").arg(key).arg("changed").query_async(&mut other).await.unwrap();

        let mut conn = pool.get().await.unwrap();
        let committed: Option<()> = redis::pipe()
            .atomic()
            .set(key, "mine")
            .ignore()
            .query_async(&mut *conn)
            .await
            .unwrap();
        assert!(committed.is_some());

        let _: () = redis::cmd("DEL").arg(key).query_async(&mut other).await.unwrap();
    }
}
