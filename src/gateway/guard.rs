//! Enforcement of limiter decisions on HTTP requests.

use std::net::IpAddr;
use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use tracing::{debug, error, warn};

use crate::config::{FailurePolicy, KeySource};
use crate::ratelimit::RateLimiterBackend;

/// Key used when every request shares one limit.
pub const GLOBAL_KEY: &str = "global";

/// What to do with a request after consulting the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardOutcome {
    Proceed,
    Reject(StatusCode),
}

/// Applies one limiter to requests: derives the limiting key and turns the
/// limiter's answer, or its failure, into an outcome.
pub struct LimitGuard {
    /// Label used in logs
    name: &'static str,
    limiter: Arc<dyn RateLimiterBackend>,
    key_source: KeySource,
    policy: FailurePolicy,
}

impl LimitGuard {
    pub fn new(
        name: &'static str,
        limiter: Arc<dyn RateLimiterBackend>,
        key_source: KeySource,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            name,
            limiter,
            key_source,
            policy,
        }
    }

    /// Limiting key for a request from `client` routed to `upstream`.
    pub fn key(&self, client: IpAddr, upstream: Option<&str>) -> String {
        match self.key_source {
            KeySource::Ip => client.to_string(),
            KeySource::Global => GLOBAL_KEY.to_string(),
            KeySource::Upstream => upstream.unwrap_or(GLOBAL_KEY).to_string(),
        }
    }

    pub async fn check(&self, key: &str) -> GuardOutcome {
        match self.limiter.allow(key).await {
            Ok(true) => GuardOutcome::Proceed,
            Ok(false) => {
                debug!(guard = self.name, key, "Request rate limited");
                GuardOutcome::Reject(StatusCode::TOO_MANY_REQUESTS)
            }
            Err(e) => match self.policy {
                FailurePolicy::FailOpen => {
                    warn!(guard = self.name, key, error = %e, "Limiter failed, letting request through");
                    GuardOutcome::Proceed
                }
                FailurePolicy::FailClosed => {
                    error!(guard = self.name, key, error = %e, "Limiter failed, rejecting request");
                    GuardOutcome::Reject(StatusCode::SERVICE_UNAVAILABLE)
                }
            },
        }
    }
}

/// Client address as seen by the gateway: the first `X-Forwarded-For`
/// entry, then `X-Real-IP`, then the peer address.
pub fn client_ip(headers: &HeaderMap, peer: IpAddr) -> IpAddr {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse().ok());

    forwarded
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse().ok())
        })
        .unwrap_or(peer)
}
