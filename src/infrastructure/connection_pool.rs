//! Connection Pool Manager
//!
//! One bounded pool of reusable handles per backend kind. Handles move
//! `Created → Idle ⇄ Active → {Recycled | Discarded}`; the pool-level lock
//! keeps `active + idle + opening` within `max_connections + max_overflow`.

use crate::domain::ports::{Connection, Connector};
use crate::domain::{HandleState, PoolKind};
use crate::infrastructure::health_checker::{HealthCheckConfig, HealthChecker, HealthStatus};
use crate::infrastructure::shutdown::ShutdownController;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Upper bound on any acquire wait.
const MAX_WAIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Handles opened at startup and kept idle
    pub min_connections: usize,
    /// Regular capacity
    pub max_connections: usize,
    /// Extra handles allowed under burst; discarded on release
    pub max_overflow: usize,
    /// Default wait bound for `acquire`
    pub acquire_timeout: Duration,
    /// Maximum handle lifetime
    pub recycle_after: Duration,
    /// Interval of the health probe
    pub health_check_interval: Duration,
    /// How long `drain` waits for active handles
    pub drain_grace_period: Duration,
    /// Timeout of each health probe
    pub probe_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 10,
            max_overflow: 0,
            acquire_timeout: Duration::from_secs(5),
            recycle_after: Duration::from_secs(3600),
            health_check_interval: Duration::from_secs(30),
            drain_grace_period: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_connections == 0 {
            return Err(PoolError::InvalidConfig(
                "max_connections must be greater than 0".to_string(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(PoolError::InvalidConfig(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.acquire_timeout.is_zero() {
            return Err(PoolError::InvalidConfig(
                "acquire_timeout must be greater than 0".to_string(),
            ));
        }
        if self.health_check_interval.is_zero() {
            return Err(PoolError::InvalidConfig(
                "health_check_interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Pool errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PoolError {
    #[error("{kind} pool exhausted after waiting {waited:?}")]
    PoolExhausted { kind: PoolKind, waited: Duration },

    #[error("{0} connection is unhealthy")]
    ConnectionUnhealthy(PoolKind),

    #[error("failed to connect to {kind} backend: {reason}")]
    ConnectFailed { kind: PoolKind, reason: String },

    #[error("{0} pool is draining")]
    Draining(PoolKind),

    #[error("no {0} pool configured")]
    UnknownPool(PoolKind),

    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error("handle belongs to the {handle} pool, not {pool}")]
    KindMismatch { handle: PoolKind, pool: PoolKind },
}

impl PoolError {
    /// Whether the caller may retry (with backoff).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::PoolExhausted { .. } | PoolError::ConnectFailed { .. }
        )
    }
}

/// Pool statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
    /// Connects in progress
    pub opening: usize,
    pub created: u64,
    pub recycled: u64,
    pub discarded: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub peak_active: usize,
    #[serde(rename = "avg_wait_ms", serialize_with = "serialize_millis")]
    pub avg_wait_time: Duration,
    pub max_connections: usize,
    pub max_overflow: usize,
    pub draining: bool,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64() * 1000.0)
}

/// A connection checked out of a pool.
pub struct ConnectionHandle {
    id: u64,
    kind: PoolKind,
    conn: Box<dyn Connection>,
    created_at: Instant,
    state: HandleState,
    overflow: bool,
}

impl ConnectionHandle {
    fn new(id: u64, kind: PoolKind, conn: Box<dyn Connection>, overflow: bool) -> Self {
        let now = Instant::now();
        Self {
            id,
            kind,
            conn,
            created_at: now,
            state: HandleState::Created,
            overflow,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    /// Time since the underlying connection was opened.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Opened beyond `max_connections`; never returned to idle.
    pub fn is_overflow(&self) -> bool {
        self.overflow
    }

    /// Check if this handle has exceeded its lifetime.
    pub fn is_expired(&self, recycle_after: Duration) -> bool {
        self.created_at.elapsed() > recycle_after
    }

    /// Fail with `ConnectionUnhealthy` when the connection has gone bad.
    pub fn ensure_alive(&self) -> Result<(), PoolError> {
        if self.conn.is_alive() {
            Ok(())
        } else {
            Err(PoolError::ConnectionUnhealthy(self.kind))
        }
    }

    pub fn connection(&self) -> &dyn Connection {
        self.conn.as_ref()
    }

    /// Borrow the concrete connection type.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.conn.as_any().downcast_ref::<T>()
    }

    pub fn downcast_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.conn.as_any_mut().downcast_mut::<T>()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("overflow", &self.overflow)
            .finish()
    }
}

#[derive(Debug, Default)]
struct PoolState {
    idle: VecDeque<ConnectionHandle>,
    active: usize,
    opening: usize,
    max_connections: usize,
    draining: bool,
    created: u64,
    recycled: u64,
    discarded: u64,
    errors: u64,
    timeouts: u64,
    peak_active: usize,
    acquires: u64,
    total_wait: Duration,
}

impl PoolState {
    fn total(&self) -> usize {
        self.active + self.idle.len() + self.opening
    }

    fn mark_active(&mut self) {
        self.active += 1;
        self.peak_active = self.peak_active.max(self.active);
    }
}

enum Step {
    Ready(ConnectionHandle),
    Open { overflow: bool },
    Wait,
}

/// Per-kind pool.
struct Pool {
    kind: PoolKind,
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
    notify: Notify,
    next_id: AtomicU64,
}

/// Returns a reserved connect slot unless disarmed. Covers connector
/// failures and futures dropped mid-connect.
struct Reservation<'a> {
    pool: &'a Pool,
    armed: bool,
}

impl<'a> Reservation<'a> {
    fn new(pool: &'a Pool) -> Self {
        Self { pool, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.state.lock().opening -= 1;
            self.pool.notify.notify_one();
        }
    }
}

impl Pool {
    fn new(kind: PoolKind, config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        let state = PoolState {
            max_connections: config.max_connections,
            ..Default::default()
        };
        Self {
            kind,
            config,
            connector,
            state: Mutex::new(state),
            notify: Notify::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn acquire(&self, timeout: Duration) -> Result<ConnectionHandle, PoolError> {
        let started = Instant::now();
        // Unbounded waits are capped instead of overflowing the clock.
        let deadline = started
            .checked_add(timeout)
            .unwrap_or_else(|| started + MAX_WAIT);

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);

            let mut retired = Vec::new();
            let step = {
                let mut state = self.state.lock();
                if state.draining {
                    return Err(PoolError::Draining(self.kind));
                }

                let mut step = Step::Wait;
                while let Some(mut handle) = state.idle.pop_front() {
                    if handle.is_expired(self.config.recycle_after) || !handle.conn.is_alive() {
                        handle.state = HandleState::Recycled;
                        state.recycled += 1;
                        retired.push(handle);
                        continue;
                    }
                    handle.state = HandleState::Active;
                    state.mark_active();
                    step = Step::Ready(handle);
                    break;
                }

                if matches!(step, Step::Wait)
                    && state.total() < state.max_connections + self.config.max_overflow
                {
                    state.opening += 1;
                    let overflow = state.total() > state.max_connections;
                    step = Step::Open { overflow };
                }

                if matches!(step, Step::Wait) {
                    notified.as_mut().enable();
                }
                step
            };

            if !retired.is_empty() {
                tracing::debug!(pool = %self.kind, count = retired.len(), "recycled stale idle handles");
                close_in_background(retired);
            }

            match step {
                Step::Ready(handle) => {
                    self.record_wait(started.elapsed());
                    return Ok(handle);
                }
                Step::Open { overflow } => {
                    let reservation = Reservation::new(self);
                    let result = tokio::time::timeout_at(deadline, self.connector.connect()).await;

                    let mut conn = match result {
                        Ok(Ok(conn)) => conn,
                        Ok(Err(reason)) => {
                            drop(reservation);
                            self.state.lock().errors += 1;
                            tracing::warn!(pool = %self.kind, error = %reason, "failed to open connection");
                            return Err(PoolError::ConnectFailed {
                                kind: self.kind,
                                reason,
                            });
                        }
                        Err(_) => {
                            drop(reservation);
                            self.state.lock().errors += 1;
                            return Err(PoolError::ConnectFailed {
                                kind: self.kind,
                                reason: "connect timed out".to_string(),
                            });
                        }
                    };

                    {
                        let mut state = self.state.lock();
                        reservation.disarm();
                        state.opening -= 1;

                        if !state.draining {
                            state.created += 1;
                            state.mark_active();
                            let mut handle =
                                ConnectionHandle::new(self.next_id(), self.kind, conn, overflow);
                            handle.state = HandleState::Active;
                            drop(state);

                            self.record_wait(started.elapsed());
                            tracing::debug!(pool = %self.kind, id = handle.id, overflow, "opened connection");
                            return Ok(handle);
                        }
                        state.discarded += 1;
                    }

                    conn.close().await;
                    return Err(PoolError::Draining(self.kind));
                }
                Step::Wait => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        let waited = started.elapsed();
                        self.state.lock().timeouts += 1;
                        tracing::debug!(pool = %self.kind, waited_ms = waited.as_millis() as u64, "acquire timed out");
                        return Err(PoolError::PoolExhausted {
                            kind: self.kind,
                            waited,
                        });
                    }
                }
            }
        }
    }

    fn record_wait(&self, waited: Duration) {
        let mut state = self.state.lock();
        state.acquires += 1;
        state.total_wait += waited;
    }

    /// Return a handle. Keeps it idle when it is still fit for reuse.
    fn release(self: &Arc<Self>, mut handle: ConnectionHandle) {
        let (retired, replenish) = {
            let mut state = self.state.lock();
            state.active = state.active.saturating_sub(1);

            let verdict = if state.draining {
                Some((HandleState::Discarded, "pool draining"))
            } else if handle.overflow {
                Some((HandleState::Discarded, "overflow handle"))
            } else if handle.is_expired(self.config.recycle_after) {
                Some((HandleState::Recycled, "recycle_after elapsed"))
            } else if !handle.conn.is_alive() {
                Some((HandleState::Discarded, "connection not alive"))
            } else if state.total() + 1 > state.max_connections {
                Some((HandleState::Discarded, "capacity shrank"))
            } else {
                None
            };

            let retired = match verdict {
                None => {
                    handle.state = HandleState::Idle;
                    state.idle.push_back(handle);
                    None
                }
                Some((outcome, reason)) => {
                    match outcome {
                        HandleState::Recycled => state.recycled += 1,
                        _ => state.discarded += 1,
                    }
                    tracing::debug!(pool = %self.kind, id = handle.id, reason, "retiring handle");
                    handle.state = outcome;
                    Some(handle)
                }
            };

            (retired, self.needs_top_up(&state))
        };

        self.notify.notify_one();

        if let Some(handle) = retired {
            close_in_background(vec![handle]);
        }
        if replenish {
            self.spawn_top_up();
        }
    }

    /// Throw a handle away instead of reusing it.
    fn discard(self: &Arc<Self>, mut handle: ConnectionHandle) {
        let replenish = {
            let mut state = self.state.lock();
            state.active = state.active.saturating_sub(1);
            state.discarded += 1;
            self.needs_top_up(&state)
        };
        handle.state = HandleState::Discarded;
        tracing::debug!(pool = %self.kind, id = handle.id, "discarded handle");

        self.notify.notify_one();
        close_in_background(vec![handle]);
        if replenish {
            self.spawn_top_up();
        }
    }

    fn needs_top_up(&self, state: &PoolState) -> bool {
        !state.draining
            && state.idle.len() + state.opening < self.config.min_connections
            && state.total() < state.max_connections
    }

    fn spawn_top_up(self: &Arc<Self>) {
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let pool = self.clone();
            runtime.spawn(async move {
                pool.top_up().await;
            });
        }
    }

    /// Open idle handles until `min_connections` are idle or opening.
    async fn top_up(&self) -> usize {
        let mut opened = 0;

        loop {
            {
                let mut state = self.state.lock();
                if !self.needs_top_up(&state) {
                    break;
                }
                state.opening += 1;
            }

            let reservation = Reservation::new(self);
            match self.connector.connect().await {
                Ok(mut conn) => {
                    {
                        let mut state = self.state.lock();
                        reservation.disarm();
                        state.opening -= 1;

                        if !state.draining {
                            state.created += 1;
                            let mut handle =
                                ConnectionHandle::new(self.next_id(), self.kind, conn, false);
                            handle.state = HandleState::Idle;
                            state.idle.push_back(handle);
                            drop(state);

                            opened += 1;
                            self.notify.notify_one();
                            continue;
                        }
                        state.discarded += 1;
                    }
                    conn.close().await;
                    break;
                }
                Err(e) => {
                    drop(reservation);
                    self.state.lock().errors += 1;
                    tracing::warn!(pool = %self.kind, backend = %self.connector.target(), error = %e, "failed to open idle connection");
                    break;
                }
            }
        }

        opened
    }

    /// Retire every idle handle.
    async fn recycle_idle(&self) -> usize {
        let handles: Vec<_> = {
            let mut state = self.state.lock();
            let handles: Vec<_> = state.idle.drain(..).collect();
            state.recycled += handles.len() as u64;
            handles
        };
        let count = handles.len();
        close_all(handles, HandleState::Recycled).await;
        count
    }

    /// Retire idle handles past `recycle_after` or no longer alive.
    async fn recycle_stale(&self) -> usize {
        let stale: VecDeque<_> = {
            let mut state = self.state.lock();
            let (keep, stale): (VecDeque<_>, VecDeque<_>) = state.idle.drain(..).partition(|h| {
                !h.is_expired(self.config.recycle_after) && h.conn.is_alive()
            });
            state.idle = keep;
            state.recycled += stale.len() as u64;
            stale
        };
        let count = stale.len();
        if count > 0 {
            tracing::debug!(pool = %self.kind, count, "recycled stale idle handles");
        }
        close_all(stale, HandleState::Recycled).await;
        count
    }

    async fn resize(&self, new_max: usize) -> usize {
        let (excess, grew) = {
            let mut state = self.state.lock();
            let grew = new_max > state.max_connections;
            state.max_connections = new_max;

            let mut excess = Vec::new();
            while state.active + state.idle.len() > new_max {
                match state.idle.pop_back() {
                    Some(handle) => excess.push(handle),
                    None => break,
                }
            }
            state.discarded += excess.len() as u64;
            (excess, grew)
        };

        if grew {
            self.notify.notify_waiters();
        }

        let count = excess.len();
        close_all(excess, HandleState::Discarded).await;
        count
    }

    async fn drain(&self) -> usize {
        let active_before = {
            let mut state = self.state.lock();
            state.draining = true;
            state.active
        };
        self.notify.notify_waiters();

        let deadline = Instant::now() + self.config.drain_grace_period;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            {
                notified.as_mut().enable();
                if self.state.lock().active == 0 {
                    break;
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let (idle, active_after) = {
            let mut state = self.state.lock();
            let idle: Vec<_> = state.idle.drain(..).collect();
            state.discarded += idle.len() as u64;
            (idle, state.active)
        };

        if active_after > 0 {
            tracing::warn!(
                pool = %self.kind,
                active = active_after,
                "drain grace period elapsed with active handles"
            );
        }

        let reclaimed = idle.len() + active_before.saturating_sub(active_after);
        close_all(idle, HandleState::Discarded).await;
        reclaimed
    }

    fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let avg_wait_time = if state.acquires == 0 {
            Duration::ZERO
        } else {
            state.total_wait.div_f64(state.acquires as f64)
        };

        PoolStats {
            active: state.active,
            idle: state.idle.len(),
            opening: state.opening,
            created: state.created,
            recycled: state.recycled,
            discarded: state.discarded,
            errors: state.errors,
            timeouts: state.timeouts,
            peak_active: state.peak_active,
            avg_wait_time,
            max_connections: state.max_connections,
            max_overflow: self.config.max_overflow,
            draining: state.draining,
        }
    }
}

async fn close_all(handles: impl IntoIterator<Item = ConnectionHandle>, outcome: HandleState) {
    for mut handle in handles {
        handle.state = outcome;
        handle.conn.close().await;
    }
}

fn close_in_background(handles: Vec<ConnectionHandle>) {
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn(async move {
            for mut handle in handles {
                handle.conn.close().await;
            }
        });
    }
}

fn check_owner(pool: PoolKind, owner: PoolKind) -> Result<(), PoolError> {
    if pool == owner {
        return Ok(());
    }
    tracing::warn!(pool = %pool, owner = %owner, "handle returned under the wrong pool kind");
    Err(PoolError::KindMismatch {
        handle: owner,
        pool,
    })
}

/// Scoped acquisition: returns the handle to its pool when dropped.
pub struct PooledHandle {
    pool: Arc<Pool>,
    handle: Option<ConnectionHandle>,
}

impl PooledHandle {
    /// Throw the handle away instead of returning it for reuse.
    pub fn discard(mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.discard(handle);
        }
    }
}

impl Deref for PooledHandle {
    type Target = ConnectionHandle;

    fn deref(&self) -> &Self::Target {
        // Only `discard` and `drop` take the handle, both consume the guard.
        self.handle.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledHandle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.handle.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle);
        }
    }
}

/// Owns one pool per backend kind plus their health bookkeeping.
pub struct ConnectionPoolManager {
    pools: DashMap<PoolKind, Arc<Pool>>,
    health: HealthChecker,
}

impl ConnectionPoolManager {
    pub fn new(health_config: HealthCheckConfig) -> Self {
        Self {
            pools: DashMap::new(),
            health: HealthChecker::new(health_config),
        }
    }

    fn pool(&self, kind: PoolKind) -> Result<Arc<Pool>, PoolError> {
        self.pools
            .get(&kind)
            .map(|p| p.value().clone())
            .ok_or(PoolError::UnknownPool(kind))
    }

    /// Register a pool and pre-warm `min_connections` idle handles.
    ///
    /// Warm-up failures are logged; the pool fills lazily instead.
    pub async fn initialize(
        &self,
        kind: PoolKind,
        config: PoolConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<(), PoolError> {
        config.validate()?;

        let target = connector.target();
        let pool = match self.pools.entry(kind) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(PoolError::InvalidConfig(format!(
                    "{} pool already initialized",
                    kind
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let pool = Arc::new(Pool::new(kind, config, connector));
                slot.insert(pool.clone());
                pool
            }
        };
        self.health.register(kind).await;

        let warmed = pool.top_up().await;
        tracing::info!(
            pool = %kind,
            backend = %target,
            warmed,
            max = pool.config.max_connections,
            "connection pool initialized"
        );
        Ok(())
    }

    /// Registered pool kinds.
    pub fn kinds(&self) -> Vec<PoolKind> {
        let mut kinds: Vec<_> = self.pools.iter().map(|e| *e.key()).collect();
        kinds.sort_by_key(|k| PoolKind::ALL.iter().position(|a| a == k));
        kinds
    }

    /// Check out a handle, waiting up to `timeout` (the pool's
    /// `acquire_timeout` when None).
    pub async fn acquire(
        &self,
        kind: PoolKind,
        timeout: Option<Duration>,
    ) -> Result<ConnectionHandle, PoolError> {
        let pool = self.pool(kind)?;
        let timeout = timeout.unwrap_or(pool.config.acquire_timeout);
        pool.acquire(timeout).await
    }

    /// Like `acquire`, but the handle goes back to the pool when dropped.
    pub async fn acquire_scoped(
        &self,
        kind: PoolKind,
        timeout: Option<Duration>,
    ) -> Result<PooledHandle, PoolError> {
        let pool = self.pool(kind)?;
        let timeout = timeout.unwrap_or(pool.config.acquire_timeout);
        let handle = pool.acquire(timeout).await?;
        Ok(PooledHandle {
            pool,
            handle: Some(handle),
        })
    }

    /// Return a handle to `kind`'s pool.
    ///
    /// A handle always goes back to the pool that issued it; naming another
    /// kind still returns it there, then fails with `KindMismatch`.
    pub fn release(&self, kind: PoolKind, handle: ConnectionHandle) -> Result<(), PoolError> {
        let owner = handle.kind();
        self.pool(owner)?.release(handle);
        check_owner(kind, owner)
    }

    pub fn discard(&self, kind: PoolKind, handle: ConnectionHandle) -> Result<(), PoolError> {
        let owner = handle.kind();
        self.pool(owner)?.discard(handle);
        check_owner(kind, owner)
    }

    /// Probe the given pool (or all pools) now and return their health.
    ///
    /// A pool turning unhealthy has all its idle handles recycled.
    pub async fn health_check(&self, kind: Option<PoolKind>) -> HashMap<PoolKind, HealthStatus> {
        let targets: Vec<Arc<Pool>> = match kind {
            Some(kind) => self.pool(kind).into_iter().collect(),
            None => self.pools.iter().map(|e| e.value().clone()).collect(),
        };

        let mut report = HashMap::new();
        for pool in targets {
            let result = self
                .health
                .probe(pool.connector.as_ref(), pool.config.probe_timeout)
                .await;

            if self.health.update_status(pool.kind, result).await == Some(false) {
                let recycled = pool.recycle_idle().await;
                tracing::warn!(pool = %pool.kind, recycled, "recycled idle handles of unhealthy pool");
            }
            if let Some(status) = self.health.get_status(pool.kind).await {
                report.insert(pool.kind, status);
            }
        }
        report
    }

    /// Last known health of every pool, without probing.
    pub async fn health_status(&self) -> HashMap<PoolKind, HealthStatus> {
        self.health.all_statuses().await
    }

    /// Change `max_connections`. Shrinking discards idle handles only.
    pub async fn resize(&self, kind: PoolKind, new_max: usize) -> Result<(), PoolError> {
        if new_max == 0 {
            return Err(PoolError::InvalidConfig(
                "max_connections must be greater than 0".to_string(),
            ));
        }
        let pool = self.pool(kind)?;
        let discarded = pool.resize(new_max).await;
        tracing::info!(pool = %kind, new_max, discarded, "pool resized");
        Ok(())
    }

    /// Stop issuing handles and reclaim every connection of the pool.
    pub async fn drain(&self, kind: PoolKind) -> usize {
        let Ok(pool) = self.pool(kind) else {
            return 0;
        };
        let reclaimed = pool.drain().await;
        tracing::info!(pool = %kind, reclaimed, "pool drained");
        reclaimed
    }

    /// Drain every pool.
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        let pools: Vec<_> = self.pools.iter().map(|e| e.value().clone()).collect();
        let drains = pools.iter().map(|pool| pool.drain());
        let reclaimed: usize = futures::future::join_all(drains).await.into_iter().sum();
        tracing::info!(pools = pools.len(), reclaimed, "connection pools shut down");
        Ok(())
    }

    pub fn stats(&self, kind: PoolKind) -> Option<PoolStats> {
        self.pools.get(&kind).map(|p| p.stats())
    }

    pub fn all_stats(&self) -> HashMap<PoolKind, PoolStats> {
        self.pools
            .iter()
            .map(|e| (*e.key(), e.value().stats()))
            .collect()
    }

    /// One maintenance pass: health probe, recycling of stale idle handles,
    /// top-up to `min_connections`.
    pub async fn run_maintenance(&self) {
        self.health_check(None).await;

        let pools: Vec<_> = self.pools.iter().map(|e| e.value().clone()).collect();
        for pool in pools {
            pool.recycle_stale().await;
            pool.top_up().await;
        }
    }

    /// Start the periodic maintenance task at the shortest configured
    /// `health_check_interval`.
    pub fn start_maintenance(self: &Arc<Self>, shutdown: &ShutdownController) {
        let Some(interval) = self
            .pools
            .iter()
            .map(|e| e.value().config.health_check_interval)
            .min()
        else {
            return;
        };

        let manager = self.clone();
        shutdown.spawn_periodic("pool_maintenance", interval, move || {
            let manager = manager.clone();
            async move { manager.run_maintenance().await }
        });
    }
}

impl Default for ConnectionPoolManager {
    fn default() -> Self {
        Self::new(HealthCheckConfig::default())
    }
}
