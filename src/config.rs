use crate::domain::{EvictionStrategy, PoolKind};
use crate::infrastructure::{CacheConfig, HealthCheckConfig, PoolConfig, RateLimitConfig};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Pool to open at startup.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub kind: PoolKind,
    /// `host:port` for TCP backends, base URL for `Http`
    pub addr: String,
    pub config: PoolConfig,
}

#[derive(Debug, Clone)]
pub struct Config {
    // Status API settings
    pub api_listen_addr: String,
    pub debug: bool,

    // Shared key/value backend (None: process-local state only)
    pub backend_url: Option<String>,
    pub backend_timeout: Duration,

    // Service settings
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub health: HealthCheckConfig,

    // Pools
    pub pools: Vec<PoolSettings>,
    pub http_health_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_listen_addr: "0.0.0.0:8081".to_string(),
            debug: false,
            backend_url: None,
            backend_timeout: Duration::from_millis(500),
            rate_limit: RateLimitConfig::default(),
            cache: CacheConfig::default(),
            health: HealthCheckConfig::default(),
            pools: Vec::new(),
            http_health_path: "/health".to_string(),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("{0} pool configured more than once")]
    DuplicatePool(PoolKind),
}

impl Config {
    /// Check the values `load_config` cannot reject while parsing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::InvalidConfig(msg));

        if self.api_listen_addr.parse::<SocketAddr>().is_err() {
            return invalid(format!("api_listen_addr {:?} is not a socket address", self.api_listen_addr));
        }
        if let Some(url) = &self.backend_url {
            if reqwest::Url::parse(url).is_err() {
                return invalid(format!("backend_url {:?} is not a valid url", url));
            }
        }

        let rl = &self.rate_limit;
        if rl.capacity == 0 {
            return invalid("rate limit capacity must be greater than 0".to_string());
        }
        if !(rl.refill_rate.is_finite() && rl.refill_rate > 0.0) {
            return invalid("rate limit refill_rate must be a positive number".to_string());
        }
        if !(rl.penalty_multiplier.is_finite() && rl.penalty_multiplier >= 1.0) {
            return invalid("rate limit penalty_multiplier must be a finite number of at least 1".to_string());
        }

        let cache = &self.cache;
        if cache.max_entries == 0 || cache.max_memory_bytes == 0 {
            return invalid("cache limits must be greater than 0".to_string());
        }
        if !(cache.eviction_fraction > 0.0 && cache.eviction_fraction <= 1.0) {
            return invalid("cache eviction_fraction must be in (0, 1]".to_string());
        }

        let mut seen = Vec::with_capacity(self.pools.len());
        for pool in &self.pools {
            if seen.contains(&pool.kind) {
                return Err(ConfigError::DuplicatePool(pool.kind));
            }
            seen.push(pool.kind);

            if pool.addr.is_empty() {
                return invalid(format!("{} pool has no address", pool.kind));
            }
            pool.config
                .validate()
                .map_err(|e| ConfigError::InvalidConfig(format!("{} pool: {}", pool.kind, e)))?;
        }

        Ok(())
    }

    /// Settings of the pool for `kind`, if configured.
    pub fn pool(&self, kind: PoolKind) -> Option<&PoolSettings> {
        self.pools.iter().find(|p| p.kind == kind)
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_prefix(kind: PoolKind) -> &'static str {
    match kind {
        PoolKind::Database => "GOVERNOR_DATABASE",
        PoolKind::CacheStore => "GOVERNOR_CACHE_STORE",
        PoolKind::Http => "GOVERNOR_HTTP",
    }
}

fn load_pool(kind: PoolKind) -> Option<PoolSettings> {
    let prefix = env_prefix(kind);
    let addr = std::env::var(format!("{}_ADDR", prefix)).ok()?;
    let defaults = PoolConfig::default();

    let config = PoolConfig {
        min_connections: env_parse(&format!("{}_MIN_CONNECTIONS", prefix), defaults.min_connections),
        max_connections: env_parse(&format!("{}_MAX_CONNECTIONS", prefix), defaults.max_connections),
        max_overflow: env_parse(&format!("{}_MAX_OVERFLOW", prefix), defaults.max_overflow),
        acquire_timeout: Duration::from_millis(env_parse(
            &format!("{}_ACQUIRE_TIMEOUT_MS", prefix),
            defaults.acquire_timeout.as_millis() as u64,
        )),
        recycle_after: Duration::from_secs(env_parse(
            &format!("{}_RECYCLE_SECS", prefix),
            defaults.recycle_after.as_secs(),
        )),
        health_check_interval: Duration::from_secs(env_parse(
            &format!("{}_HEALTH_INTERVAL_SECS", prefix),
            defaults.health_check_interval.as_secs(),
        )),
        ..defaults
    };

    Some(PoolSettings { kind, addr, config })
}

pub fn load_config() -> anyhow::Result<Config> {
    let defaults = Config::default();

    let api_listen_addr = std::env::var("GOVERNOR_API_LISTEN_ADDR")
        .unwrap_or_else(|_| defaults.api_listen_addr.clone());

    let debug = std::env::var("GOVERNOR_DEBUG").is_ok();

    // Shared backend
    let backend_url = std::env::var("GOVERNOR_BACKEND_URL")
        .ok()
        .filter(|v| !v.trim().is_empty());

    let backend_timeout = Duration::from_millis(env_parse(
        "GOVERNOR_BACKEND_TIMEOUT_MS",
        defaults.backend_timeout.as_millis() as u64,
    ));

    // Rate limiter
    let rl = RateLimitConfig::default();
    let rate_limit = RateLimitConfig {
        capacity: env_parse("GOVERNOR_RATE_LIMIT_CAPACITY", rl.capacity),
        refill_rate: env_parse("GOVERNOR_RATE_LIMIT_REFILL_RATE", rl.refill_rate),
        penalty_threshold: env_parse("GOVERNOR_RATE_LIMIT_PENALTY_THRESHOLD", rl.penalty_threshold),
        penalty_multiplier: env_parse("GOVERNOR_RATE_LIMIT_PENALTY_MULTIPLIER", rl.penalty_multiplier),
        idle_ttl: Duration::from_secs(env_parse(
            "GOVERNOR_RATE_LIMIT_IDLE_TTL_SECS",
            rl.idle_ttl.as_secs(),
        )),
        ..rl
    };

    // Query cache
    let cc = CacheConfig::default();
    let default_ttl_secs: u64 = env_parse(
        "GOVERNOR_CACHE_DEFAULT_TTL_SECS",
        cc.default_ttl.map(|d| d.as_secs()).unwrap_or(0),
    );
    let cache = CacheConfig {
        max_entries: env_parse("GOVERNOR_CACHE_MAX_ENTRIES", cc.max_entries),
        max_memory_bytes: env_parse("GOVERNOR_CACHE_MAX_MEMORY_MB", cc.max_memory_bytes / (1024 * 1024))
            * 1024
            * 1024,
        strategy: std::env::var("GOVERNOR_CACHE_STRATEGY")
            .map(|v| EvictionStrategy::parse(&v))
            .unwrap_or(cc.strategy),
        // 0 disables expiry
        default_ttl: (default_ttl_secs > 0).then(|| Duration::from_secs(default_ttl_secs)),
        ..cc
    };

    // Pool health thresholds
    let hc = HealthCheckConfig::default();
    let health = HealthCheckConfig {
        unhealthy_threshold: env_parse("GOVERNOR_HEALTH_UNHEALTHY_THRESHOLD", hc.unhealthy_threshold),
        healthy_threshold: env_parse("GOVERNOR_HEALTH_HEALTHY_THRESHOLD", hc.healthy_threshold),
    };

    let pools = PoolKind::ALL.into_iter().filter_map(load_pool).collect();

    let http_health_path = std::env::var("GOVERNOR_HTTP_HEALTH_PATH")
        .unwrap_or_else(|_| defaults.http_health_path.clone());

    Ok(Config {
        api_listen_addr,
        debug,
        backend_url,
        backend_timeout,
        rate_limit,
        cache,
        health,
        pools,
        http_health_path,
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn with_pool(kind: PoolKind, addr: &str) -> Config {
        Config {
            pools: vec![PoolSettings {
                kind,
                addr: addr.to_string(),
                config: PoolConfig::default(),
            }],
            ..Config::default()
        }
    }

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.api_listen_addr, "0.0.0.0:8081");
        assert!(cfg.backend_url.is_none());
        assert!(cfg.pools.is_empty());
        assert_eq!(cfg.rate_limit.capacity, 60);
        assert_eq!(cfg.cache.strategy, EvictionStrategy::Lru);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_load_config_defaults() {
        std::env::remove_var("GOVERNOR_CACHE_MAX_ENTRIES");
        std::env::remove_var("GOVERNOR_HTTP_HEALTH_PATH");

        let cfg = load_config().unwrap();
        assert_eq!(cfg.cache.max_entries, 10_000);
        assert_eq!(cfg.http_health_path, "/health");
    }

    #[test]
    fn test_load_config_with_api_listen_addr() {
        std::env::set_var("GOVERNOR_API_LISTEN_ADDR", "127.0.0.1:9081");
        let cfg = load_config().unwrap();
        assert_eq!(cfg.api_listen_addr, "127.0.0.1:9081");
        std::env::remove_var("GOVERNOR_API_LISTEN_ADDR");
    }

    #[test]
    fn test_load_config_with_debug() {
        std::env::set_var("GOVERNOR_DEBUG", "1");
        let cfg = load_config().unwrap();
        assert!(cfg.debug);
        std::env::remove_var("GOVERNOR_DEBUG");
    }

    #[test]
    fn test_load_config_with_backend() {
        std::env::set_var("GOVERNOR_BACKEND_URL", "http://kv.internal:7000");
        std::env::set_var("GOVERNOR_BACKEND_TIMEOUT_MS", "250");
        let cfg = load_config().unwrap();
        assert_eq!(cfg.backend_url, Some("http://kv.internal:7000".to_string()));
        assert_eq!(cfg.backend_timeout, Duration::from_millis(250));
        std::env::remove_var("GOVERNOR_BACKEND_URL");
        std::env::remove_var("GOVERNOR_BACKEND_TIMEOUT_MS");
    }

    #[test]
    fn test_load_config_with_rate_limit() {
        std::env::set_var("GOVERNOR_RATE_LIMIT_CAPACITY", "5");
        std::env::set_var("GOVERNOR_RATE_LIMIT_REFILL_RATE", "0.5");
        std::env::set_var("GOVERNOR_RATE_LIMIT_PENALTY_THRESHOLD", "3");
        let cfg = load_config().unwrap();
        assert_eq!(cfg.rate_limit.capacity, 5);
        assert_eq!(cfg.rate_limit.refill_rate, 0.5);
        assert_eq!(cfg.rate_limit.penalty_threshold, 3);
        std::env::remove_var("GOVERNOR_RATE_LIMIT_CAPACITY");
        std::env::remove_var("GOVERNOR_RATE_LIMIT_REFILL_RATE");
        std::env::remove_var("GOVERNOR_RATE_LIMIT_PENALTY_THRESHOLD");
    }

    #[test]
    fn test_load_config_with_cache() {
        std::env::set_var("GOVERNOR_CACHE_STRATEGY", "LFU");
        std::env::set_var("GOVERNOR_CACHE_MAX_MEMORY_MB", "8");
        std::env::set_var("GOVERNOR_CACHE_DEFAULT_TTL_SECS", "0");
        let cfg = load_config().unwrap();
        assert_eq!(cfg.cache.strategy, EvictionStrategy::Lfu);
        assert_eq!(cfg.cache.max_memory_bytes, 8 * 1024 * 1024);
        assert_eq!(cfg.cache.default_ttl, None);
        std::env::remove_var("GOVERNOR_CACHE_STRATEGY");
        std::env::remove_var("GOVERNOR_CACHE_MAX_MEMORY_MB");
        std::env::remove_var("GOVERNOR_CACHE_DEFAULT_TTL_SECS");
    }

    #[test]
    fn test_load_config_with_pools() {
        std::env::set_var("GOVERNOR_DATABASE_ADDR", "10.0.0.5:5432");
        std::env::set_var("GOVERNOR_DATABASE_MAX_CONNECTIONS", "20");
        std::env::set_var("GOVERNOR_DATABASE_ACQUIRE_TIMEOUT_MS", "1500");
        std::env::set_var("GOVERNOR_HTTP_ADDR", "http://llm.internal");
        let cfg = load_config().unwrap();

        let db = cfg.pool(PoolKind::Database).unwrap();
        assert_eq!(db.addr, "10.0.0.5:5432");
        assert_eq!(db.config.max_connections, 20);
        assert_eq!(db.config.acquire_timeout, Duration::from_millis(1500));
        assert_eq!(db.config.min_connections, 2);
        assert!(cfg.pool(PoolKind::Http).is_some());

        std::env::remove_var("GOVERNOR_DATABASE_ADDR");
        std::env::remove_var("GOVERNOR_DATABASE_MAX_CONNECTIONS");
        std::env::remove_var("GOVERNOR_DATABASE_ACQUIRE_TIMEOUT_MS");
        std::env::remove_var("GOVERNOR_HTTP_ADDR");
    }

    #[test]
    fn test_load_config_parse_error_uses_default() {
        std::env::set_var("GOVERNOR_HEALTH_UNHEALTHY_THRESHOLD", "not_a_number");
        let cfg = load_config().unwrap();
        assert_eq!(cfg.health.unhealthy_threshold, 3);
        std::env::remove_var("GOVERNOR_HEALTH_UNHEALTHY_THRESHOLD");
    }

    #[test]
    fn test_validate_rejects_non_finite_penalty_multiplier() {
        for multiplier in [f64::INFINITY, f64::NAN, 0.5] {
            let mut cfg = Config::default();
            cfg.rate_limit.penalty_multiplier = multiplier;
            assert!(matches!(cfg.validate(), Err(ConfigError::InvalidConfig(_))));
        }

        let mut cfg = Config::default();
        cfg.rate_limit.penalty_multiplier = 1e300;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_listen_addr() {
        let cfg = Config {
            api_listen_addr: "not-an-addr".to_string(),
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_bad_backend_url() {
        let cfg = Config {
            backend_url: Some("::nope".to_string()),
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut cfg = Config::default();
        cfg.rate_limit.capacity = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.rate_limit.refill_rate = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_eviction_fraction() {
        let mut cfg = Config::default();
        cfg.cache.eviction_fraction = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_pool() {
        let mut cfg = with_pool(PoolKind::Database, "127.0.0.1:5432");
        cfg.pools.push(cfg.pools[0].clone());
        assert_eq!(cfg.validate(), Err(ConfigError::DuplicatePool(PoolKind::Database)));
    }

    #[test]
    fn test_validate_rejects_bad_pool_config() {
        let mut cfg = with_pool(PoolKind::CacheStore, "127.0.0.1:6379");
        cfg.pools[0].config.min_connections = 50;

        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("cache_store pool"));
    }

    #[test]
    fn test_validate_rejects_empty_pool_addr() {
        let cfg = with_pool(PoolKind::Http, "");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_config_clone() {
        let cfg = with_pool(PoolKind::Database, "127.0.0.1:5432");
        let cloned = cfg.clone();
        assert_eq!(cfg.api_listen_addr, cloned.api_listen_addr);
        assert_eq!(cloned.pools.len(), 1);
    }
}
