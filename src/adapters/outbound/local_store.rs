//! In-process Key/Value Store
//!
//! Implements KeyValueBackend using DashMap. Lets several services in one
//! process share rate-limit and cache state, and stands in for the remote
//! store in tests.

use crate::domain::ports::{BackendError, KeyValueBackend};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct StoredValue {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now > at).unwrap_or(false)
    }
}

/// DashMap-backed key/value store with per-key TTL.
///
/// Expired values are dropped lazily on read and by `purge_expired`.
#[derive(Clone, Default)]
pub struct LocalStore {
    values: Arc<DashMap<String, StoredValue>>,
}

impl LocalStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored values, expired ones included.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Remove every expired value.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.values.len();
        self.values.retain(|_, v| !v.is_expired(now));
        before.saturating_sub(self.values.len())
    }
}

#[async_trait]
impl KeyValueBackend for LocalStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, BackendError> {
        let now = Instant::now();
        let expired = match self.values.get(key) {
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.values.remove_if(key, |_, v| v.is_expired(now));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), BackendError> {
        let expires_at = ttl.and_then(|ttl| Instant::now().checked_add(ttl));
        self.values
            .insert(key.to_string(), StoredValue { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        Ok(self.values.remove(key).is_some())
    }

    async fn ping(&self) -> Result<(), BackendError> {
        Ok(())
    }
}
