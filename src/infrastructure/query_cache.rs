//! Query Cache
//!
//! Cache-aside layer in front of expensive lookups. The bounded local map is
//! authoritative for this process; an optional shared backend mirrors writes
//! and deletes and serves local misses. Concurrent misses on one key are
//! coalesced into a single factory call.

use crate::domain::ports::KeyValueBackend;
use crate::domain::EvictionStrategy;
use crate::infrastructure::backend_gate::{BackendGate, BackendGateConfig};
use crate::infrastructure::connection_pool::PoolError;
use crate::infrastructure::shutdown::ShutdownController;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::time::Instant;

/// Query cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Entry count limit
    pub max_entries: usize,
    /// Memory budget for keys, values and tags
    pub max_memory_bytes: usize,
    pub strategy: EvictionStrategy,
    /// TTL applied when `set` is called without one (None: no expiry)
    pub default_ttl: Option<Duration>,
    /// How often expired entries are swept
    pub sweep_interval: Duration,
    /// Prefix for entry keys in the shared backend
    pub key_prefix: String,
    /// Share of entries removed per eviction pass
    pub eviction_fraction: f64,
    pub backend_gate: BackendGateConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_memory_bytes: 64 * 1024 * 1024,
            strategy: EvictionStrategy::Lru,
            default_ttl: Some(Duration::from_secs(300)),
            sweep_interval: Duration::from_secs(60),
            key_prefix: "cache:".to_string(),
            eviction_fraction: 0.1,
            backend_gate: BackendGateConfig::default(),
        }
    }
}

/// Cache errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CacheError {
    #[error("entry of {size} bytes exceeds the cache memory budget of {budget} bytes")]
    EntryTooLarge { size: usize, budget: usize },

    #[error("invalid invalidation pattern: {0}")]
    InvalidPattern(String),

    #[error("value computation failed: {0}")]
    Factory(String),

    /// No pooled connection for the computation; kept typed so every caller
    /// sharing the flight sees the same pool failure.
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A cached value with its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Bytes,
    pub created_at: Instant,
    pub expires_at: Option<Instant>,
    pub last_accessed: Instant,
    pub access_count: u64,
    pub tags: HashSet<String>,
    pub size_bytes: usize,
    /// Global access order, breaks ties between strategies
    access_seq: u64,
}

impl CacheEntry {
    /// Still served at exactly `expires_at`; gone strictly after.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now > at).unwrap_or(false)
    }
}

/// Cache statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
    pub memory_bytes: usize,
    pub max_memory_bytes: usize,
    pub strategy: EvictionStrategy,
    pub backend_degraded: bool,
}

type Flight = Arc<OnceCell<Result<Bytes, CacheError>>>;

/// Multi-strategy cache with optional shared backend.
pub struct QueryCache {
    config: CacheConfig,
    entries: DashMap<String, CacheEntry>,
    /// Pending `get_or_set` computations per key
    in_flight: DashMap<String, Flight>,
    memory_bytes: AtomicUsize,
    access_seq: AtomicU64,
    eviction_lock: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    backend: Option<Arc<dyn KeyValueBackend>>,
    gate: BackendGate,
}

impl QueryCache {
    /// Create a process-local cache.
    pub fn new(config: CacheConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a cache mirrored to `backend`.
    pub fn with_backend(config: CacheConfig, backend: Arc<dyn KeyValueBackend>) -> Self {
        Self::build(config, Some(backend))
    }

    fn build(config: CacheConfig, backend: Option<Arc<dyn KeyValueBackend>>) -> Self {
        let gate = BackendGate::new("query_cache", config.backend_gate.clone());
        Self {
            config,
            entries: DashMap::new(),
            in_flight: DashMap::new(),
            memory_bytes: AtomicUsize::new(0),
            access_seq: AtomicU64::new(0),
            eviction_lock: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            backend,
            gate,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    fn next_seq(&self) -> u64 {
        self.access_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up a key. Local misses fall through to the shared backend.
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        if let Some(value) = self.get_local(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        if let Some(value) = self.get_remote(key).await {
            // Already in the backend: populate locally without mirroring back.
            if let Err(e) = self.insert_local(key, value.clone(), self.config.default_ttl, &[]) {
                tracing::debug!(key, error = %e, "shared value not cached locally");
            }
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn get_local(&self, key: &str) -> Option<Bytes> {
        let now = Instant::now();
        {
            let mut entry = self.entries.get_mut(key)?;
            if !entry.is_expired(now) {
                entry.last_accessed = now;
                entry.access_count += 1;
                entry.access_seq = self.next_seq();
                return Some(entry.value.clone());
            }
        }

        if let Some((_, entry)) = self.entries.remove_if(key, |_, e| e.is_expired(now)) {
            self.memory_bytes.fetch_sub(entry.size_bytes, Ordering::Relaxed);
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    async fn get_remote(&self, key: &str) -> Option<Bytes> {
        let backend = self.backend.as_ref()?;
        let storage_key = self.storage_key(key);
        self.gate.call(|| backend.get(&storage_key)).await.flatten()
    }

    /// Store a value locally and mirror it to the shared backend.
    ///
    /// `ttl` falls back to the configured default.
    pub async fn set(
        &self,
        key: &str,
        value: impl Into<Bytes>,
        ttl: Option<Duration>,
        tags: &[&str],
    ) -> Result<(), CacheError> {
        let value = value.into();
        let ttl = ttl.or(self.config.default_ttl);
        self.insert_local(key, value.clone(), ttl, tags)?;

        if let Some(backend) = &self.backend {
            let storage_key = self.storage_key(key);
            self.gate.call(|| backend.set(&storage_key, value, ttl)).await;
        }
        Ok(())
    }

    fn insert_local(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
        tags: &[&str],
    ) -> Result<(), CacheError> {
        let size = key.len() + value.len() + tags.iter().map(|t| t.len()).sum::<usize>();
        if size > self.config.max_memory_bytes {
            return Err(CacheError::EntryTooLarge {
                size,
                budget: self.config.max_memory_bytes,
            });
        }

        let now = Instant::now();
        let entry = CacheEntry {
            key: key.to_string(),
            value,
            created_at: now,
            // A TTL past the clock's range means no expiry.
            expires_at: ttl.and_then(|ttl| now.checked_add(ttl)),
            last_accessed: now,
            access_count: 0,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            size_bytes: size,
            access_seq: self.next_seq(),
        };

        // Accounting happens under the shard lock so a concurrent removal
        // never subtracts before the matching add.
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut slot) => {
                let old = slot.insert(entry);
                self.memory_bytes.fetch_add(size, Ordering::Relaxed);
                self.memory_bytes.fetch_sub(old.size_bytes, Ordering::Relaxed);
            }
            Entry::Vacant(slot) => {
                slot.insert(entry);
                self.memory_bytes.fetch_add(size, Ordering::Relaxed);
            }
        }

        self.enforce_limits();
        Ok(())
    }

    /// Remove a key locally and from the shared backend.
    pub async fn delete(&self, key: &str) -> bool {
        let removed_local = self.remove_local(key);

        let removed_remote = match &self.backend {
            Some(backend) => {
                let storage_key = self.storage_key(key);
                self.gate
                    .call(|| backend.delete(&storage_key))
                    .await
                    .unwrap_or(false)
            }
            None => false,
        };

        removed_local || removed_remote
    }

    fn remove_local(&self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some((_, entry)) => {
                self.memory_bytes.fetch_sub(entry.size_bytes, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Return the cached value or compute, cache and return it.
    ///
    /// Concurrent callers missing on the same key wait for one factory call
    /// and share its result. If the computing caller is cancelled, a waiting
    /// caller takes over.
    pub async fn get_or_set<F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        factory: F,
    ) -> Result<Bytes, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        self.get_or_compute(key, ttl, move || async move {
            factory()
                .await
                .map_err(|e| CacheError::Factory(e.to_string()))
        })
        .await
    }

    /// `get_or_set` for factories that already speak `CacheError`.
    ///
    /// The error is shared as-is with every caller waiting on the flight.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<Bytes, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, CacheError>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        let flight = self
            .in_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let result = flight
            .get_or_init(|| async move {
                // An earlier flight may have landed while we queued up.
                if let Some(value) = self.get_local(key) {
                    return Ok(value);
                }

                let value = compute().await?;
                if let Err(e) = self.set(key, value.clone(), ttl, &[]).await {
                    tracing::warn!(key, error = %e, "computed value not cached");
                }
                Ok(value)
            })
            .await
            .clone();

        self.in_flight.remove_if(key, |_, f| Arc::ptr_eq(f, &flight));
        result
    }

    /// Typed read: JSON-decodes the cached bytes.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.get(key).await {
            Some(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|e| CacheError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Typed write: JSON-encodes the value.
    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        tags: &[&str],
    ) -> Result<(), CacheError> {
        let raw = serde_json::to_vec(value).map_err(|e| CacheError::Serialization(e.to_string()))?;
        self.set(key, raw, ttl, tags).await
    }

    /// Typed `get_or_set`.
    pub async fn get_or_set_json<T, F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        factory: F,
    ) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let raw = self
            .get_or_compute(key, ttl, move || async move {
                let value = factory()
                    .await
                    .map_err(|e| CacheError::Factory(e.to_string()))?;
                serde_json::to_vec(&value)
                    .map(Bytes::from)
                    .map_err(|e| CacheError::Serialization(e.to_string()))
            })
            .await?;

        serde_json::from_slice(&raw).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    /// Remove every entry carrying `tag`.
    pub async fn invalidate_by_tag(&self, tag: &str) -> usize {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.tags.contains(tag))
            .map(|e| e.key().clone())
            .collect();

        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((key, entry)) = self.entries.remove_if(&key, |_, e| e.tags.contains(tag)) {
                self.memory_bytes.fetch_sub(entry.size_bytes, Ordering::Relaxed);
                removed.push(key);
            }
        }

        self.delete_remote(&removed).await;
        tracing::debug!(tag, removed = removed.len(), "invalidated by tag");
        removed.len()
    }

    /// Remove every entry whose key matches the regular expression.
    pub async fn invalidate_by_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        let re = Regex::new(pattern).map_err(|e| CacheError::InvalidPattern(e.to_string()))?;

        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| re.is_match(e.key()))
            .map(|e| e.key().clone())
            .collect();

        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((key, entry)) = self.entries.remove(&key) {
                self.memory_bytes.fetch_sub(entry.size_bytes, Ordering::Relaxed);
                removed.push(key);
            }
        }

        self.delete_remote(&removed).await;
        tracing::debug!(pattern, removed = removed.len(), "invalidated by pattern");
        Ok(removed.len())
    }

    async fn delete_remote(&self, keys: &[String]) {
        let Some(backend) = &self.backend else {
            return;
        };
        for key in keys {
            let storage_key = self.storage_key(key);
            if self.gate.call(|| backend.delete(&storage_key)).await.is_none() {
                // Gate closed or backend failing: skip the rest.
                break;
            }
        }
    }

    /// Look up several keys at once; only hits are returned.
    pub async fn bulk_get(&self, keys: &[&str]) -> HashMap<String, Bytes> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(key).await {
                found.insert(key.to_string(), value);
            }
        }
        found
    }

    /// Store several entries; returns how many were stored.
    pub async fn bulk_set(&self, items: Vec<(String, Bytes)>, ttl: Option<Duration>) -> usize {
        let mut stored = 0;
        for (key, value) in items {
            match self.set(&key, value, ttl, &[]).await {
                Ok(()) => stored += 1,
                Err(e) => tracing::debug!(key = %key, error = %e, "bulk set skipped entry"),
            }
        }
        stored
    }

    /// Pre-populate the cache. Keys already present are left untouched.
    pub async fn warmup(&self, entries: Vec<(String, Bytes)>) -> usize {
        let mut loaded = 0;
        for (key, value) in entries {
            if self.contains(&key) {
                continue;
            }
            if self.set(&key, value, None, &[]).await.is_ok() {
                loaded += 1;
            }
        }
        tracing::info!(loaded, "cache warmed up");
        loaded
    }

    /// Whether a live entry exists locally. Does not count as an access.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .get(key)
            .map(|e| !e.is_expired(now))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every local entry. The shared backend is left alone.
    pub fn clear(&self) -> usize {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.iter().filter(|key| self.remove_local(key)).count()
    }

    /// Remove expired entries; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.is_expired(now))
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for key in expired {
            if let Some((_, entry)) = self.entries.remove_if(&key, |_, e| e.is_expired(now)) {
                self.memory_bytes.fetch_sub(entry.size_bytes, Ordering::Relaxed);
                removed += 1;
            }
        }
        self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Evict in strategy order until both limits hold.
    fn enforce_limits(&self) {
        let _guard = self.eviction_lock.lock();

        loop {
            let count = self.entries.len();
            let memory = self.memory_bytes.load(Ordering::Relaxed);
            if count <= self.config.max_entries && memory <= self.config.max_memory_bytes {
                break;
            }

            let batch = ((count as f64 * self.config.eviction_fraction).ceil() as usize).max(1);
            let victims = self.select_victims(batch);
            if victims.is_empty() {
                break;
            }

            let mut evicted = 0;
            for key in victims {
                if let Some((_, entry)) = self.entries.remove(&key) {
                    self.memory_bytes.fetch_sub(entry.size_bytes, Ordering::Relaxed);
                    evicted += 1;
                }
            }
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
            tracing::debug!(
                evicted,
                strategy = self.config.strategy.as_str(),
                "cache eviction pass"
            );
        }
    }

    fn select_victims(&self, batch: usize) -> Vec<String> {
        struct Candidate {
            key: String,
            access_count: u64,
            expires_at: Option<Instant>,
            access_seq: u64,
        }

        let mut candidates: Vec<Candidate> = self
            .entries
            .iter()
            .map(|e| Candidate {
                key: e.key().clone(),
                access_count: e.access_count,
                expires_at: e.expires_at,
                access_seq: e.access_seq,
            })
            .collect();

        match self.config.strategy {
            EvictionStrategy::Lru => candidates.sort_unstable_by_key(|c| c.access_seq),
            EvictionStrategy::Lfu => {
                candidates.sort_unstable_by_key(|c| (c.access_count, c.access_seq))
            }
            // Entries without expiry sort last.
            EvictionStrategy::Ttl => candidates
                .sort_unstable_by_key(|c| (c.expires_at.is_none(), c.expires_at, c.access_seq)),
        }

        candidates.truncate(batch);
        candidates.into_iter().map(|c| c.key).collect()
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        CacheStats {
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            entries: self.entries.len(),
            memory_bytes: self.memory_bytes.load(Ordering::Relaxed),
            max_memory_bytes: self.config.max_memory_bytes,
            strategy: self.config.strategy,
            backend_degraded: self.is_degraded(),
        }
    }

    /// True while running on the local map only.
    pub fn is_degraded(&self) -> bool {
        self.backend.is_some() && self.gate.is_degraded()
    }

    /// Start the periodic TTL sweep, stopped by `controller`. Each pass
    /// also pings a degraded backend.
    pub fn start_sweeper(self: &Arc<Self>, controller: &ShutdownController) {
        let cache = Arc::clone(self);
        controller.spawn_periodic("query_cache_sweep", self.config.sweep_interval, move || {
            let cache = cache.clone();
            async move {
                let removed = cache.purge_expired();
                if removed > 0 {
                    tracing::debug!(removed, "cache sweep removed expired entries");
                }
                if let Some(backend) = &cache.backend {
                    cache.gate.check_recovery(backend.as_ref()).await;
                }
            }
        });
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
