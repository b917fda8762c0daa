//! Configuration management for Floodgate.
//!
//! The gateway reads one YAML file. Durations are written as human strings
//! such as `"500ms"` or `"1h"`.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use duration_str::deserialize_duration;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{FloodgateError, Result};
use crate::ratelimit::Algorithm;

/// Paths served by the gateway itself, never proxied.
pub const RESERVED_PATHS: [&str; 2] = ["/health", "/metrics"];

/// Main configuration for the Floodgate service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FloodgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Limiter applied to every proxied request
    pub edge_limiter: GuardConfig,

    /// Upstreams and routing
    pub proxy: ProxyConfig,

    /// Metrics endpoint configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address the gateway listens on
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Deadline for one forwarded request
    #[serde(default = "default_upstream_timeout", deserialize_with = "deserialize_duration")]
    pub upstream_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            upstream_timeout: default_upstream_timeout(),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_upstream_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Where a guard takes its limiting key from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    /// The client IP address
    Ip,
    /// One shared key for all requests
    Global,
    /// The name of the upstream the request is routed to
    Upstream,
}

/// What a guard does when the limiter cannot reach a decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Let the request through
    FailOpen,
    /// Reject the request with 503
    #[default]
    FailClosed,
}

/// A limiter together with the policy of the guard enforcing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GuardConfig {
    /// Key source; `ip` at the edge and `upstream` in the proxy when unset
    pub key: Option<KeySource>,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    pub limiter: LimiterConfig,
}

/// One limiter instance: an algorithm and the storage holding its state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimiterConfig {
    pub algorithm: AlgorithmSettings,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Lifetime of state after its last write
    #[serde(default = "default_ttl", deserialize_with = "deserialize_duration")]
    pub ttl: Duration,

    /// Deadline for one storage round-trip
    #[serde(default = "default_storage_timeout", deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
}

fn default_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_storage_timeout() -> Duration {
    Duration::from_secs(1)
}

/// Algorithm selection and parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlgorithmSettings {
    TokenBucket(TokenBucketSettings),
    FixedWindow(FixedWindowSettings),
    SlidingWindowLog(SlidingLogSettings),
    SlidingWindowCounter(SlidingCounterSettings),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketSettings {
    /// Maximum burst
    pub capacity: u32,
    /// Tokens added per second
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedWindowSettings {
    pub limit: u32,
    #[serde(deserialize_with = "deserialize_duration")]
    pub window: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlidingLogSettings {
    pub limit: u32,
    #[serde(deserialize_with = "deserialize_duration")]
    pub window: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlidingCounterSettings {
    pub limit: u64,
    #[serde(deserialize_with = "deserialize_duration")]
    pub window: Duration,
    /// Number of sub-windows the window is split into
    pub buckets: u32,
}

/// Storage backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Process-local storage (default)
    #[default]
    Memory,
    /// Redis shared by every gateway replica
    Redis(Box<RedisConfig>),
}

/// Redis storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisConfig {
    /// Connection URL (`redis://` or `rediss://`)
    pub url: String,

    #[serde(default)]
    pub pool: RedisPoolConfig,

    /// Optimistic transaction attempts before giving up on a hot key
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    16
}

/// Redis connection pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisPoolConfig {
    #[serde(default = "default_pool_size")]
    pub max_size: usize,

    #[serde(default = "default_pool_timeout", deserialize_with = "deserialize_duration")]
    pub timeout_wait: Duration,

    #[serde(default = "default_pool_timeout", deserialize_with = "deserialize_duration")]
    pub timeout_create: Duration,
}

impl Default for RedisPoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_pool_size(),
            timeout_wait: default_pool_timeout(),
            timeout_create: default_pool_timeout(),
        }
    }
}

fn default_pool_size() -> usize {
    16
}

fn default_pool_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Upstreams, routes and the optional per-upstream limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// Upstream name to base URL
    pub upstreams: HashMap<String, String>,

    #[serde(default)]
    pub routes: Vec<HostRoute>,

    /// Upstream for requests no route matches
    pub default: Option<String>,

    /// Limiter keyed by upstream name, applied after routing
    pub limiter: Option<GuardConfig>,
}

/// Routes for one virtual host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostRoute {
    /// Host name, matched without the port
    pub host: String,

    #[serde(default)]
    pub paths: Vec<PathRoute>,

    /// Upstream for this host when no path matches
    pub default: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathRoute {
    pub path: String,
    pub upstream: String,
}

/// Metrics endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Client IPs allowed to scrape `/metrics`
    #[serde(default = "default_allowed_hosts")]
    pub allowed_hosts: Vec<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: default_allowed_hosts(),
        }
    }
}

fn default_allowed_hosts() -> Vec<String> {
    vec!["127.0.0.1".to_string(), "::1".to_string()]
}

impl FloodgateConfig {
    /// Load and validate configuration from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: FloodgateConfig =
            serde_yaml::from_str(contents).map_err(|e| FloodgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross references and limiter parameters.
    pub fn validate(&self) -> Result<()> {
        match self.edge_limiter.key {
            None | Some(KeySource::Ip) | Some(KeySource::Global) => {}
            Some(KeySource::Upstream) => {
                return Err(config_error("edge_limiter.key cannot be `upstream`"));
            }
        }
        self.edge_limiter.limiter.validate("edge_limiter")?;

        if let Some(guard) = &self.proxy.limiter {
            if !matches!(guard.key, None | Some(KeySource::Upstream)) {
                return Err(config_error("proxy.limiter.key must be `upstream`"));
            }
            guard.limiter.validate("proxy.limiter")?;
        }

        for (name, target) in &self.proxy.upstreams {
            let url = Url::parse(target)
                .map_err(|e| config_error(format!("upstream `{name}` has invalid URL `{target}`: {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(config_error(format!(
                    "upstream `{name}` must use http or https, got `{}`",
                    url.scheme()
                )));
            }
        }

        if let Some(default) = &self.proxy.default {
            self.check_upstream("proxy.default", default)?;
        }

        for route in &self.proxy.routes {
            if route.host.is_empty() {
                return Err(config_error("route host cannot be empty"));
            }
            if let Some(default) = &route.default {
                self.check_upstream(&format!("default of host `{}`", route.host), default)?;
            }
            for path in &route.paths {
                if !path.path.starts_with('/') {
                    return Err(config_error(format!(
                        "route path `{}` on host `{}` must start with `/`",
                        path.path, route.host
                    )));
                }
                let trimmed = path.path.trim_end_matches('/');
                if RESERVED_PATHS.contains(&trimmed) {
                    return Err(config_error(format!(
                        "route path `{}` on host `{}` is reserved",
                        path.path, route.host
                    )));
                }
                self.check_upstream(&format!("route `{}{}`", route.host, path.path), &path.upstream)?;
            }
        }

        for host in &self.metrics.allowed_hosts {
            if host.parse::<IpAddr>().is_err() {
                return Err(config_error(format!(
                    "metrics.allowed_hosts entry `{host}` is not an IP address"
                )));
            }
        }

        Ok(())
    }

    fn check_upstream(&self, context: &str, name: &str) -> Result<()> {
        if self.proxy.upstreams.contains_key(name) {
            Ok(())
        } else {
            Err(config_error(format!("{context} names unknown upstream `{name}`")))
        }
    }
}

impl LimiterConfig {
    fn validate(&self, context: &str) -> Result<()> {
        Algorithm::from_settings(&self.algorithm)
            .map_err(|e| config_error(format!("{context}: {e}")))?;
        if self.ttl.is_zero() {
            return Err(config_error(format!("{context}: ttl must be positive")));
        }
        if self.timeout.is_zero() {
            return Err(config_error(format!("{context}: timeout must be positive")));
        }
        if let StorageConfig::Redis(redis) = &self.storage {
            if redis.max_retries == 0 {
                return Err(config_error(format!("{context}: max_retries must be positive")));
            }
            if redis.pool.max_size == 0 {
                return Err(config_error(format!("{context}: pool.max_size must be positive")));
            }
        }
        Ok(())
    }
}

fn config_error(message: impl Into<String>) -> FloodgateError {
    FloodgateError::Config(message.into())
}
