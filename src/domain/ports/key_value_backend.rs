//! Key/Value Backend Port
//!
//! Defines the interface for the shared store that rate-limit counters and
//! cache entries are mirrored to. Implementations may be in-process or remote.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Errors raised by a key/value backend.
///
/// These never reach callers of the governance services: they are absorbed
/// and turned into a degraded-mode signal.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("cache backend timed out")]
    Timeout,
    #[error("cache backend returned malformed data: {0}")]
    Corrupt(String),
}

/// Shared, multi-writer key/value store.
///
/// This is an outbound port. Every write is best-effort: the services
/// never assume exclusive access and never assume a write landed.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    /// Short name used in logs and status output.
    fn name(&self) -> &'static str;

    /// Fetch a value. `Ok(None)` means the key is absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, BackendError>;

    /// Store a value with an optional time-to-live.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), BackendError>;

    /// Remove a value. Returns true if something was removed.
    async fn delete(&self, key: &str) -> Result<bool, BackendError>;

    /// Lightweight round-trip; the periodic sweeps use it to detect
    /// recovery after an outage.
    async fn ping(&self) -> Result<(), BackendError>;
}
