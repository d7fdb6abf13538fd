//! Infrastructure Layer
//!
//! The governance services and the cross-cutting pieces they share.

pub mod backend_gate;
pub mod connection_pool;
pub mod health_checker;
pub mod query_cache;
pub mod rate_limiter;
pub mod shutdown;

pub use backend_gate::{BackendGate, BackendGateConfig, GateState};
pub use connection_pool::{
    ConnectionHandle, ConnectionPoolManager, PoolConfig, PoolError, PoolStats, PooledHandle,
};
pub use health_checker::{HealthCheckConfig, HealthCheckResult, HealthChecker, HealthStatus};
pub use query_cache::{CacheConfig, CacheEntry, CacheError, CacheStats, QueryCache};
pub use rate_limiter::{RateLimitConfig, RateLimitDecision, RateLimiter};
pub use shutdown::{shutdown_signal, ShutdownController};
