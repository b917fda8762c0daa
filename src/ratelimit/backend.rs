//! Limiter trait for abstracting over concrete limiters.

use async_trait::async_trait;

use crate::error::LimitError;

/// Trait for rate limiter implementations.
///
/// The gateway's guards only see this trait, so the failure policy can be
/// exercised against a limiter that fails on demand.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Decide whether one more request for `key` is admitted.
    async fn allow(&self, key: &str) -> Result<bool, LimitError>;
}
