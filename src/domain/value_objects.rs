//! Value Objects - Immutable domain primitives
//!
//! Value objects are identified by their value rather than identity.
//! They are immutable and can be freely shared.

use serde::{Deserialize, Serialize};

/// Kind of backend a connection pool hands out handles for.
///
/// Each kind gets its own independently configured pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    /// Relational store (SQL database)
    Database,
    /// External cache store
    CacheStore,
    /// Outbound HTTP / LLM API budget
    Http,
}

impl PoolKind {
    /// All pool kinds, in a stable order.
    pub const ALL: [PoolKind; 3] = [PoolKind::Database, PoolKind::CacheStore, PoolKind::Http];

    /// Parse a pool kind from a string.
    ///
    /// Returns None for unknown kinds.
    ///
    /// # Examples
    /// ```
    /// use resource_governor::PoolKind;
    ///
    /// assert_eq!(PoolKind::parse("db"), Some(PoolKind::Database));
    /// assert_eq!(PoolKind::parse("redis"), Some(PoolKind::CacheStore));
    /// assert_eq!(PoolKind::parse("unknown"), None);
    /// ```
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "database" | "db" => Some(Self::Database),
            "cache_store" | "cache" | "redis" => Some(Self::CacheStore),
            "http" | "api" => Some(Self::Http),
            _ => None,
        }
    }

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::CacheStore => "cache_store",
            Self::Http => "http",
        }
    }
}

impl std::fmt::Display for PoolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of a pooled connection handle.
///
/// `Created → Idle ⇄ Active → {Recycled | Discarded}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleState {
    Created,
    Idle,
    Active,
    /// Retired because it outlived `recycle_after` or the pool went unhealthy
    Recycled,
    /// Thrown away after failing mid-use or exceeding capacity
    Discarded,
}

/// Eviction ordering used by the query cache when it is over budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionStrategy {
    /// Evict entries with the oldest last access first
    #[default]
    Lru,
    /// Evict entries with the fewest accesses first
    Lfu,
    /// Evict entries closest to expiry first (entries without TTL last)
    Ttl,
}

impl EvictionStrategy {
    /// Parse a strategy name, falling back to LRU.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "lfu" => Self::Lfu,
            "ttl" => Self::Ttl,
            _ => Self::Lru,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lru => "lru",
            Self::Lfu => "lfu",
            Self::Ttl => "ttl",
        }
    }
}
