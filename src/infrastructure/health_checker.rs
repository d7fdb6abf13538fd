//! Pool Health Checker
//!
//! Tracks probe results per pool kind and applies the consecutive
//! success/failure thresholds that flip a pool between healthy and
//! unhealthy.

use crate::domain::ports::Connector;
use crate::domain::PoolKind;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Health check configuration.
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Number of consecutive failures before marking unhealthy
    pub unhealthy_threshold: u32,
    /// Number of consecutive successes before marking healthy
    pub healthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            unhealthy_threshold: 3,
            healthy_threshold: 2,
        }
    }
}

/// Health status for a pool.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Whether the pool is healthy
    pub healthy: bool,
    /// Last check timestamp
    #[serde(skip)]
    pub last_check: Option<Instant>,
    /// Last check latency
    pub latency_ms: Option<u64>,
    /// Consecutive failures
    pub consecutive_failures: u32,
    /// Consecutive successes
    pub consecutive_successes: u32,
    /// Last error message
    pub last_error: Option<String>,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            healthy: true,
            last_check: None,
            latency_ms: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_error: None,
        }
    }
}

/// Result of a health check.
#[derive(Debug, Clone)]
pub enum HealthCheckResult {
    Success { latency_ms: u64 },
    Failure { error: String, latency_ms: u64 },
}

impl HealthCheckResult {
    pub fn is_success(&self) -> bool {
        matches!(self, HealthCheckResult::Success { .. })
    }
}

/// Health bookkeeping for every registered pool.
pub struct HealthChecker {
    config: HealthCheckConfig,
    /// Health status per pool kind
    status: RwLock<HashMap<PoolKind, HealthStatus>>,
}

impl HealthChecker {
    /// Create a new health checker.
    pub fn new(config: HealthCheckConfig) -> Self {
        Self {
            config,
            status: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// Get health status for a pool.
    pub async fn get_status(&self, kind: PoolKind) -> Option<HealthStatus> {
        self.status.read().await.get(&kind).cloned()
    }

    /// Check if a pool is healthy.
    pub async fn is_healthy(&self, kind: PoolKind) -> bool {
        self.status
            .read()
            .await
            .get(&kind)
            .map(|s| s.healthy)
            .unwrap_or(true) // Default to healthy if not checked yet
    }

    /// Get all health statuses.
    pub async fn all_statuses(&self) -> HashMap<PoolKind, HealthStatus> {
        self.status.read().await.clone()
    }

    /// Register a pool with a fresh healthy status.
    pub async fn register(&self, kind: PoolKind) {
        self.status.write().await.entry(kind).or_default();
    }

    /// Probe a backend through its connector, bounded by `timeout`.
    pub async fn probe(&self, connector: &dyn Connector, timeout: Duration) -> HealthCheckResult {
        let start = Instant::now();

        let result = match tokio::time::timeout(timeout, connector.probe()).await {
            Ok(result) => result,
            Err(_) => Err("probe timeout".to_string()),
        };

        let latency = start.elapsed().as_millis() as u64;

        match result {
            Ok(_) => HealthCheckResult::Success { latency_ms: latency },
            Err(e) => HealthCheckResult::Failure {
                error: e,
                latency_ms: latency,
            },
        }
    }

    /// Update health status based on a check result.
    ///
    /// Returns the new health flag when the pool changed state.
    pub async fn update_status(&self, kind: PoolKind, result: HealthCheckResult) -> Option<bool> {
        let mut statuses = self.status.write().await;
        let entry = statuses.entry(kind).or_default();

        let was_healthy = entry.healthy;

        match result {
            HealthCheckResult::Success { latency_ms } => {
                entry.consecutive_successes += 1;
                entry.consecutive_failures = 0;
                entry.latency_ms = Some(latency_ms);
                entry.last_error = None;

                if !entry.healthy && entry.consecutive_successes >= self.config.healthy_threshold {
                    entry.healthy = true;
                    tracing::info!(pool = %kind, "pool is now healthy");
                }
            }
            HealthCheckResult::Failure { error, latency_ms } => {
                entry.consecutive_failures += 1;
                entry.consecutive_successes = 0;
                entry.latency_ms = Some(latency_ms);
                entry.last_error = Some(error.clone());

                if entry.healthy && entry.consecutive_failures >= self.config.unhealthy_threshold {
                    entry.healthy = false;
                    tracing::warn!(pool = %kind, error = %error, "pool is now unhealthy");
                }
            }
        }

        entry.last_check = Some(Instant::now());

        (was_healthy != entry.healthy).then_some(entry.healthy)
    }
}
