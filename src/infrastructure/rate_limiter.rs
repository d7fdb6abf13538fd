//! Rate Limiter
//!
//! Token bucket rate limiting per client key, with penalty escalation for
//! repeat offenders. Bucket state is shared across processes through the
//! key/value backend when it is reachable and kept process-local otherwise.

use crate::domain::ports::KeyValueBackend;
use crate::infrastructure::backend_gate::{BackendGate, BackendGateConfig};
use crate::infrastructure::shutdown::ShutdownController;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum burst size (token bucket capacity)
    pub capacity: u32,
    /// Tokens added per second
    pub refill_rate: f64,
    /// Denials before the penalty multiplier kicks in
    pub penalty_threshold: u32,
    /// Factor applied to `retry_after` while the penalty is active
    pub penalty_multiplier: f64,
    /// Buckets not touched for this long are purged
    pub idle_ttl: Duration,
    /// How often the idle sweep runs
    pub sweep_interval: Duration,
    /// Prefix for bucket keys in the shared backend
    pub key_prefix: String,
    /// Degrade behaviour when the shared backend fails
    pub backend_gate: BackendGateConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 60,
            refill_rate: 1.0,
            penalty_threshold: 10,
            penalty_multiplier: 2.0,
            idle_ttl: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
            key_prefix: "ratelimit:".to_string(),
            backend_gate: BackendGateConfig::default(),
        }
    }
}

/// Outcome of a single admission check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Whole tokens left after this call
    pub remaining: u64,
    /// How long to wait before retrying (zero when allowed)
    pub retry_after: Duration,
    /// Whether the key is currently penalised
    pub penalty_active: bool,
}

impl RateLimitDecision {
    /// `retry_after` rounded up to whole seconds, for the `Retry-After` header.
    pub fn retry_after_secs(&self) -> u64 {
        if self.allowed {
            return 0;
        }
        (self.retry_after.as_secs_f64().ceil() as u64).max(1)
    }
}

/// Bucket state as stored in the shared backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BucketSnapshot {
    tokens: f64,
    violations: u32,
    penalty_active: bool,
    /// Wall clock of the last refill, ms since UNIX epoch
    updated_at_ms: u64,
}

fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Per-key token bucket.
#[derive(Debug, Clone)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
    violation_count: u32,
    penalty_active: bool,
    last_seen: Instant,
}

impl TokenBucket {
    fn new(config: &RateLimitConfig, now: Instant) -> Self {
        Self {
            capacity: config.capacity as f64,
            tokens: config.capacity as f64,
            refill_rate: config.refill_rate,
            last_refill: now,
            violation_count: 0,
            penalty_active: false,
            last_seen: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= self.capacity {
            self.violation_count = 0;
            self.penalty_active = false;
        }
    }

    fn tokens_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.refill_rate).min(self.capacity)
    }

    fn try_consume(&mut self, now: Instant, cost: f64, config: &RateLimitConfig) -> RateLimitDecision {
        self.refill(now);
        self.last_seen = now;

        if self.tokens >= cost {
            self.tokens -= cost;
            return RateLimitDecision {
                allowed: true,
                remaining: self.tokens.floor() as u64,
                retry_after: Duration::ZERO,
                penalty_active: self.penalty_active,
            };
        }

        self.violation_count = self.violation_count.saturating_add(1);
        let mut retry_secs = (cost - self.tokens) / self.refill_rate;
        if self.violation_count >= config.penalty_threshold {
            if !self.penalty_active {
                tracing::debug!(
                    violations = self.violation_count,
                    "rate limit penalty activated"
                );
            }
            self.penalty_active = true;
            retry_secs *= config.penalty_multiplier;
        }

        RateLimitDecision {
            allowed: false,
            remaining: self.tokens.floor() as u64,
            // Saturates when an extreme multiplier pushes the wait past Duration::MAX.
            retry_after: Duration::try_from_secs_f64(retry_secs.max(0.0)).unwrap_or(Duration::MAX),
            penalty_active: self.penalty_active,
        }
    }

    fn snapshot(&self) -> BucketSnapshot {
        BucketSnapshot {
            tokens: self.tokens,
            violations: self.violation_count,
            penalty_active: self.penalty_active,
            updated_at_ms: unix_now_ms(),
        }
    }

    /// Adopt state written by another process.
    fn restore(&mut self, snapshot: &BucketSnapshot, now: Instant) {
        let age = Duration::from_millis(unix_now_ms().saturating_sub(snapshot.updated_at_ms));
        self.tokens = snapshot.tokens.clamp(0.0, self.capacity);
        self.violation_count = snapshot.violations;
        self.penalty_active = snapshot.penalty_active;
        self.last_refill = now.checked_sub(age).unwrap_or(now);
    }
}

/// Token bucket rate limiter.
///
/// Tracks request rates per client key (user ID, client IP, API key).
/// `allow` never fails: backend trouble only weakens the limit to a
/// per-process one.
pub struct RateLimiter {
    config: RateLimitConfig,
    /// Per-client state; DashMap shards give per-key locking
    buckets: DashMap<String, TokenBucket>,
    /// Shared store, primary source of bucket state when reachable
    backend: Option<Arc<dyn KeyValueBackend>>,
    gate: BackendGate,
}

impl RateLimiter {
    /// Create a process-local rate limiter.
    pub fn new(config: RateLimitConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a rate limiter that shares bucket state through `backend`.
    pub fn with_backend(config: RateLimitConfig, backend: Arc<dyn KeyValueBackend>) -> Self {
        Self::build(config, Some(backend))
    }

    fn build(config: RateLimitConfig, backend: Option<Arc<dyn KeyValueBackend>>) -> Self {
        let gate = BackendGate::new("rate_limiter", config.backend_gate.clone());
        Self {
            config,
            buckets: DashMap::new(),
            backend,
            gate,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    /// Check if an operation for this key is allowed, consuming one token.
    pub async fn allow(&self, key: &str) -> RateLimitDecision {
        self.allow_with_cost(key, 1).await
    }

    /// Check if an operation is allowed with a specific token cost.
    ///
    /// Used for budgets where one call is worth more than one unit, such as
    /// outbound LLM requests weighted by size.
    pub async fn allow_with_cost(&self, key: &str, cost: u32) -> RateLimitDecision {
        let storage_key = self.storage_key(key);

        // None: no backend or gate closed. Some(None): reachable, no shared state yet.
        let shared = match &self.backend {
            Some(backend) => self.gate.call(|| backend.get(&storage_key)).await,
            None => None,
        };

        let now = Instant::now();
        let (decision, snapshot) = {
            let mut bucket = self
                .buckets
                .entry(key.to_string())
                .or_insert_with(|| TokenBucket::new(&self.config, now));

            if let Some(Some(raw)) = &shared {
                match serde_json::from_slice::<BucketSnapshot>(raw) {
                    Ok(snapshot) => bucket.restore(&snapshot, now),
                    Err(e) => tracing::debug!(key, error = %e, "ignoring malformed shared bucket"),
                }
            }

            let decision = bucket.try_consume(now, cost as f64, &self.config);
            (decision, bucket.snapshot())
        };

        if shared.is_some() {
            if let (Some(backend), Ok(raw)) = (&self.backend, serde_json::to_vec(&snapshot)) {
                let ttl = Some(self.config.idle_ttl);
                self.gate
                    .call(|| backend.set(&storage_key, Bytes::from(raw), ttl))
                    .await;
            }
        }

        if !decision.allowed {
            tracing::debug!(
                key,
                retry_after_ms = decision.retry_after.as_millis() as u64,
                penalty = decision.penalty_active,
                "rate limited"
            );
        }

        decision
    }

    /// Get remaining whole tokens for a key without consuming any.
    pub fn remaining(&self, key: &str) -> u64 {
        self.buckets
            .get(key)
            .map(|b| b.tokens_at(Instant::now()).floor() as u64)
            .unwrap_or(self.config.capacity as u64)
    }

    /// Clear rate limit state for a key.
    pub async fn reset(&self, key: &str) {
        self.buckets.remove(key);
        if let Some(backend) = &self.backend {
            let storage_key = self.storage_key(key);
            self.gate.call(|| backend.delete(&storage_key)).await;
        }
    }

    /// Clear all local rate limit state.
    pub fn clear(&self) {
        self.buckets.clear();
    }

    /// Get the number of tracked keys.
    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }

    /// True while running on process-local state only.
    pub fn is_degraded(&self) -> bool {
        self.backend.is_some() && self.gate.is_degraded()
    }

    /// Whether a shared backend is configured at all.
    pub fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    /// Remove buckets that have not been seen within `idle_ttl`.
    pub fn purge_idle(&self) -> usize {
        let now = Instant::now();
        let idle_ttl = self.config.idle_ttl;

        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_seen) < idle_ttl);
        before.saturating_sub(self.buckets.len())
    }

    /// Start the periodic idle sweep, stopped by `controller`. Each pass
    /// also pings a degraded backend.
    pub fn start_sweeper(self: &Arc<Self>, controller: &ShutdownController) {
        let limiter = Arc::clone(self);
        controller.spawn_periodic("rate_limiter_sweep", self.config.sweep_interval, move || {
            let limiter = limiter.clone();
            async move {
                let removed = limiter.purge_idle();
                if removed > 0 {
                    tracing::debug!(removed, "rate limiter sweep removed idle buckets");
                }
                if let Some(backend) = &limiter.backend {
                    limiter.gate.check_recovery(backend.as_ref()).await;
                }
            }
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
