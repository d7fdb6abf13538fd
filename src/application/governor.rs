//! Resource Governor - composition of the governance services
//!
//! Wires the rate limiter, connection pools and query cache together and
//! exposes the canonical read path: admission check, cache lookup, and on a
//! miss a computation that runs with a pooled database handle.

use crate::adapters::outbound::{HttpConnector, HttpStore, TcpConnector};
use crate::config::{Config, ConfigError};
use crate::domain::ports::{Connector, KeyValueBackend};
use crate::domain::PoolKind;
use crate::infrastructure::{
    CacheError, CacheStats, ConnectionPoolManager, HealthStatus, PoolError, PoolStats,
    PooledHandle, QueryCache, RateLimitDecision, RateLimiter, ShutdownController,
};
use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// How long `shutdown` waits for the periodic tasks to stop.
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Failure of a governed operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GovernorError {
    #[error("rate limit exceeded, retry after {}s", .0.retry_after_secs())]
    RateLimited(RateLimitDecision),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Cache(CacheError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl GovernorError {
    /// HTTP status this error maps to.
    pub fn status_code(&self) -> u16 {
        match self {
            GovernorError::RateLimited(_) => 429,
            GovernorError::Pool(_) => 503,
            GovernorError::Cache(_) | GovernorError::Config(_) => 500,
        }
    }
}

impl From<CacheError> for GovernorError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Pool(e) => GovernorError::Pool(e),
            other => GovernorError::Cache(other),
        }
    }
}

/// Health and stats of one pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub health: HealthStatus,
    pub stats: PoolStats,
}

/// Rate limiter summary.
#[derive(Debug, Clone, Serialize)]
pub struct LimiterStatus {
    pub degraded: bool,
    pub tracked_keys: usize,
}

/// Aggregated view served by `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct GovernorStatus {
    pub version: &'static str,
    /// All pools healthy
    pub healthy: bool,
    pub pools: BTreeMap<String, PoolStatus>,
    pub cache: CacheStats,
    pub rate_limiter: LimiterStatus,
}

/// Owns the three governance services and their background tasks.
pub struct ResourceGovernor {
    limiter: Arc<RateLimiter>,
    pools: Arc<ConnectionPoolManager>,
    cache: Arc<QueryCache>,
    shutdown: ShutdownController,
}

impl ResourceGovernor {
    /// Assemble a governor from already built services.
    ///
    /// Background tasks are not started; see `start_background_tasks`.
    pub fn new(
        limiter: Arc<RateLimiter>,
        pools: Arc<ConnectionPoolManager>,
        cache: Arc<QueryCache>,
    ) -> Self {
        Self {
            limiter,
            pools,
            cache,
            shutdown: ShutdownController::new(),
        }
    }

    /// Build every service from `config`, open the configured pools and
    /// start the periodic tasks.
    pub async fn init(config: &Config) -> Result<Self, GovernorError> {
        config.validate()?;

        let backend: Option<Arc<dyn KeyValueBackend>> = match &config.backend_url {
            Some(url) => {
                let store = HttpStore::new(url, config.backend_timeout)
                    .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;
                tracing::info!(backend = %url, store = store.name(), "using shared key/value backend");
                Some(Arc::new(store))
            }
            None => {
                tracing::info!("no shared backend configured, using process-local state");
                None
            }
        };

        let limiter = match &backend {
            Some(b) => RateLimiter::with_backend(config.rate_limit.clone(), b.clone()),
            None => RateLimiter::new(config.rate_limit.clone()),
        };
        let cache = match &backend {
            Some(b) => QueryCache::with_backend(config.cache.clone(), b.clone()),
            None => QueryCache::new(config.cache.clone()),
        };

        let pools = ConnectionPoolManager::new(config.health.clone());
        for settings in &config.pools {
            let connector: Arc<dyn Connector> = match settings.kind {
                PoolKind::Http => Arc::new(
                    HttpConnector::new(
                        settings.addr.as_str(),
                        config.http_health_path.as_str(),
                        settings.config.acquire_timeout,
                    )
                    .map_err(ConfigError::InvalidConfig)?,
                ),
                PoolKind::Database | PoolKind::CacheStore => Arc::new(TcpConnector::new(
                    settings.addr.as_str(),
                    settings.config.acquire_timeout,
                )),
            };
            pools
                .initialize(settings.kind, settings.config.clone(), connector)
                .await?;
        }

        let governor = Self::new(Arc::new(limiter), Arc::new(pools), Arc::new(cache));
        governor.start_background_tasks();

        tracing::info!(
            pools = config.pools.len(),
            shared_backend = backend.is_some(),
            "resource governor initialized"
        );
        Ok(governor)
    }

    /// Start the limiter sweep, cache sweep and pool maintenance tasks.
    pub fn start_background_tasks(&self) {
        self.limiter.start_sweeper(&self.shutdown);
        self.cache.start_sweeper(&self.shutdown);
        self.pools.start_maintenance(&self.shutdown);
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn pools(&self) -> &Arc<ConnectionPoolManager> {
        &self.pools
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn shutdown_controller(&self) -> &ShutdownController {
        &self.shutdown
    }

    /// Admission check for `client`.
    pub async fn admit(&self, client: &str) -> Result<RateLimitDecision, GovernorError> {
        let decision = self.limiter.allow(client).await;
        if decision.allowed {
            Ok(decision)
        } else {
            tracing::debug!(client, retry_after_secs = decision.retry_after_secs(), "request rate limited");
            Err(GovernorError::RateLimited(decision))
        }
    }

    /// Admit `client`, then serve `key` from cache or compute it.
    ///
    /// On a miss `compute` receives a database handle that returns to its
    /// pool when dropped. Concurrent misses on the same key share a single
    /// computation.
    pub async fn guarded_fetch<F, Fut, E>(
        &self,
        client: &str,
        key: &str,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<Bytes, GovernorError>
    where
        F: FnOnce(PooledHandle) -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        self.admit(client).await?;

        let pools = &self.pools;
        let value = self
            .cache
            .get_or_compute(key, ttl, move || async move {
                let handle = pools.acquire_scoped(PoolKind::Database, None).await?;
                compute(handle)
                    .await
                    .map_err(|e| CacheError::Factory(e.to_string()))
            })
            .await?;
        Ok(value)
    }

    /// Aggregate pool health, cache stats and limiter state.
    pub async fn status(&self) -> GovernorStatus {
        let mut health = self.pools.health_status().await;
        let pools: BTreeMap<String, PoolStatus> = self
            .pools
            .all_stats()
            .into_iter()
            .map(|(kind, stats)| {
                let status = PoolStatus {
                    health: health.remove(&kind).unwrap_or_default(),
                    stats,
                };
                (kind.as_str().to_string(), status)
            })
            .collect();

        GovernorStatus {
            version: env!("CARGO_PKG_VERSION"),
            healthy: pools.values().all(|p| p.health.healthy),
            pools,
            cache: self.cache.stats(),
            rate_limiter: LimiterStatus {
                degraded: self.limiter.is_degraded(),
                tracked_keys: self.limiter.tracked_keys(),
            },
        }
    }

    /// Whether every pool is healthy.
    pub async fn is_ready(&self) -> bool {
        self.pools.health_status().await.values().all(|s| s.healthy)
    }

    /// Stop the periodic tasks, then drain every pool.
    pub async fn shutdown(&self) -> Result<(), GovernorError> {
        if !self.shutdown.shutdown_and_wait(TASK_STOP_TIMEOUT).await {
            tracing::warn!("some background tasks were aborted");
        }
        self.pools.shutdown().await?;
        tracing::info!("resource governor stopped");
        Ok(())
    }
}
