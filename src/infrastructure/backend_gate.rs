//! Backend Gate
//!
//! Circuit breaker in front of the shared key/value backend. While the gate
//! is open the owning service runs on process-local state only; after a
//! cool-down a single probe is let through to detect recovery. The probe is
//! either the next real operation or a `ping` from the periodic sweep.

use crate::domain::ports::{BackendError, KeyValueBackend};
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Backend gate configuration.
#[derive(Debug, Clone)]
pub struct BackendGateConfig {
    /// Consecutive backend failures before degrading to local state
    pub failure_threshold: u32,
    /// How long to stay degraded before letting a probe through
    pub retry_after: Duration,
}

impl Default for BackendGateConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 1,
            retry_after: Duration::from_secs(5),
        }
    }
}

/// Gate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GateState {
    /// Shared backend in use
    #[default]
    Healthy,
    /// Backend failing - local state only
    Degraded,
    /// Cool-down elapsed - next call probes the backend
    Probing,
}

impl std::fmt::Display for GateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateState::Healthy => write!(f, "healthy"),
            GateState::Degraded => write!(f, "degraded"),
            GateState::Probing => write!(f, "probing"),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: GateState,
    failures: u32,
    opened_at: Option<Instant>,
    last_error: Option<String>,
}

/// Degrade-to-local gate for one service's shared backend.
#[derive(Debug)]
pub struct BackendGate {
    component: &'static str,
    config: BackendGateConfig,
    inner: Mutex<Inner>,
}

impl BackendGate {
    /// Create a gate. `component` names the owning service in logs.
    pub fn new(component: &'static str, config: BackendGateConfig) -> Self {
        Self {
            component,
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Check if a call to the backend should be attempted.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == GateState::Healthy {
            return true;
        }

        // A probe whose caller was cancelled must not wedge the gate, so
        // Probing re-arms after the same cool-down as Degraded.
        let cooled = inner
            .opened_at
            .map(|at| at.elapsed() >= self.config.retry_after)
            .unwrap_or(true);
        if cooled {
            inner.state = GateState::Probing;
            inner.opened_at = Some(Instant::now());
            tracing::debug!(component = self.component, "probing shared backend");
        }
        cooled
    }

    /// Record a successful backend call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != GateState::Healthy {
            tracing::info!(
                component = self.component,
                "shared backend recovered, leaving local-only mode"
            );
        }
        inner.state = GateState::Healthy;
        inner.failures = 0;
        inner.opened_at = None;
        inner.last_error = None;
    }

    /// Record a failed backend call.
    pub fn record_failure(&self, error: &BackendError) {
        let mut inner = self.inner.lock();
        inner.last_error = Some(error.to_string());

        match inner.state {
            GateState::Healthy => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    inner.state = GateState::Degraded;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(
                        component = self.component,
                        error = %error,
                        "shared backend unavailable, degrading to local state"
                    );
                }
            }
            GateState::Probing | GateState::Degraded => {
                inner.state = GateState::Degraded;
                inner.opened_at = Some(Instant::now());
                tracing::debug!(
                    component = self.component,
                    error = %error,
                    "shared backend still unavailable"
                );
            }
        }
    }

    /// Run a backend operation through the gate.
    ///
    /// Returns None when the gate is closed or the call failed; failures are
    /// recorded and never propagated.
    pub async fn call<T, F, Fut>(&self, op: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        if !self.allow_request() {
            return None;
        }
        match op().await {
            Ok(value) => {
                self.record_success();
                Some(value)
            }
            Err(e) => {
                self.record_failure(&e);
                None
            }
        }
    }

    /// Ping `backend` once the cool-down allows it, so an idle service
    /// notices recovery without waiting for traffic.
    ///
    /// Returns true when the backend is in use.
    pub async fn check_recovery(&self, backend: &dyn KeyValueBackend) -> bool {
        if self.state() == GateState::Healthy {
            return true;
        }
        self.call(|| backend.ping()).await.is_some()
    }

    /// Current gate state.
    pub fn state(&self) -> GateState {
        self.inner.lock().state
    }

    /// True while the service is running on local state only.
    pub fn is_degraded(&self) -> bool {
        self.state() != GateState::Healthy
    }

    /// Last backend error seen, if degraded.
    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct PingCounter {
        down: AtomicBool,
        pings: AtomicUsize,
    }

    #[async_trait]
    impl KeyValueBackend for PingCounter {
        fn name(&self) -> &'static str {
            "ping-counter"
        }
        async fn get(&self, _key: &str) -> Result<Option<Bytes>, BackendError> {
            Ok(None)
        }
        async fn set(&self, _key: &str, _value: Bytes, _ttl: Option<Duration>) -> Result<(), BackendError> {
            Ok(())
        }
        async fn delete(&self, _key: &str) -> Result<bool, BackendError> {
            Ok(false)
        }
        async fn ping(&self) -> Result<(), BackendError> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                Err(BackendError::Timeout)
            } else {
                Ok(())
            }
        }
    }

    fn gate(threshold: u32) -> BackendGate {
        BackendGate::new(
            "test",
            BackendGateConfig {
                failure_threshold: threshold,
                retry_after: Duration::from_secs(5),
            },
        )
    }

    fn unavailable() -> BackendError {
        BackendError::Unavailable("connection refused".to_string())
    }

    #[test]
    fn test_gate_state_display() {
        assert_eq!(GateState::Healthy.to_string(), "healthy");
        assert_eq!(GateState::Degraded.to_string(), "degraded");
        assert_eq!(GateState::Probing.to_string(), "probing");
    }

    #[test]
    fn test_config_default() {
        let config = BackendGateConfig::default();
        assert_eq!(config.failure_threshold, 1);
        assert_eq!(config.retry_after, Duration::from_secs(5));
    }

    #[test]
    fn test_new_gate_is_healthy() {
        let g = gate(1);
        assert_eq!(g.state(), GateState::Healthy);
        assert!(!g.is_degraded());
        assert!(g.allow_request());
    }

    #[test]
    fn test_degrades_at_threshold() {
        let g = gate(2);
        g.record_failure(&unavailable());
        assert!(!g.is_degraded());

        g.record_failure(&unavailable());
        assert!(g.is_degraded());
        assert!(!g.allow_request());
        assert_eq!(
            g.last_error(),
            Some("cache backend unavailable: connection refused".to_string())
        );
    }

    #[test]
    fn test_success_resets_failures() {
        let g = gate(2);
        g.record_failure(&unavailable());
        g.record_success();
        g.record_failure(&unavailable());
        assert!(!g.is_degraded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_after_cooldown() {
        let g = gate(1);
        g.record_failure(&unavailable());
        assert!(!g.allow_request());

        tokio::time::advance(Duration::from_secs(6)).await;

        // First caller gets the probe, concurrent callers stay local
        assert!(g.allow_request());
        assert_eq!(g.state(), GateState::Probing);
        assert!(!g.allow_request());

        g.record_success();
        assert_eq!(g.state(), GateState::Healthy);
        assert!(g.last_error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let g = gate(1);
        g.record_failure(&unavailable());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(g.allow_request());

        g.record_failure(&BackendError::Timeout);
        assert_eq!(g.state(), GateState::Degraded);
        assert!(!g.allow_request());
    }

    #[tokio::test]
    async fn test_call_success() {
        let g = gate(1);
        let result = g.call(|| async { Ok::<_, BackendError>(42) }).await;
        assert_eq!(result, Some(42));
        assert!(!g.is_degraded());
    }

    #[tokio::test]
    async fn test_call_failure_absorbed() {
        let g = gate(1);
        let result: Option<u32> = g.call(|| async { Err(unavailable()) }).await;
        assert!(result.is_none());
        assert!(g.is_degraded());

        // Gate closed: the operation is not even attempted
        let mut attempted = false;
        let result: Option<u32> = g
            .call(|| {
                attempted = true;
                async { Ok(1) }
            })
            .await;
        assert!(result.is_none());
        assert!(!attempted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_recovery_pings_after_cooldown() {
        let g = gate(1);
        let backend = PingCounter::default();

        // Healthy gate: nothing to probe.
        assert!(g.check_recovery(&backend).await);
        assert_eq!(backend.pings.load(Ordering::SeqCst), 0);

        g.record_failure(&unavailable());
        backend.down.store(true, Ordering::SeqCst);
        assert!(!g.check_recovery(&backend).await);
        assert_eq!(backend.pings.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!g.check_recovery(&backend).await);
        assert_eq!(backend.pings.load(Ordering::SeqCst), 1);
        assert_eq!(g.state(), GateState::Degraded);

        backend.down.store(false, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(g.check_recovery(&backend).await);
        assert_eq!(backend.pings.load(Ordering::SeqCst), 2);
        assert_eq!(g.state(), GateState::Healthy);
    }
}
