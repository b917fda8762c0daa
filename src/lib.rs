//! Floodgate - Rate Limiting HTTP Gateway
//!
//! This crate implements a reverse proxy that routes requests to upstreams by
//! host and path prefix and guards them with rate limiters. Limiter state is
//! kept in process memory or in Redis so that several gateway replicas can
//! share one budget.

pub mod config;
pub mod error;
pub mod gateway;
pub mod ratelimit;
pub mod storage;
