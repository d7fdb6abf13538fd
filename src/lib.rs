//! Resource Governor Library
//!
//! Request admission, connection pooling and query caching for services
//! sharing a limited backend budget. Exposed as a library for embedding and
//! for the integration tests.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{GovernorError, GovernorStatus, ResourceGovernor};
pub use config::{load_config, Config, ConfigError, PoolSettings};
pub use domain::ports::{BackendError, Connection, Connector, KeyValueBackend};
pub use domain::{EvictionStrategy, HandleState, PoolKind};
pub use infrastructure::{
    CacheConfig, CacheError, ConnectionPoolManager, PoolConfig, PoolError, PooledHandle,
    QueryCache, RateLimitConfig, RateLimitDecision, RateLimiter, ShutdownController,
};
