//! Backend server pool.
//!
//! The pool is the single owner of backend state. Membership, health and
//! weight live behind one read/write lock; the per-request counters are
//! atomics so that the proxy can bracket a backend call without holding the
//! pool lock across I/O. Read paths hand out [`BackendSnapshot`] copies.

use crate::config::{validate_server, Scheme, ServerConfig};
use parking_lot::{RwLock, RwLockReadGuard};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{info, warn};

/// Health state of a backend.
///
/// `Draining` and `Maintenance` are operator-set and never overwritten by
/// health probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Unhealthy,
    Draining,
    Maintenance,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Healthy => "healthy",
            Health::Unhealthy => "unhealthy",
            Health::Draining => "draining",
            Health::Maintenance => "maintenance",
        }
    }

    /// Whether this state was set by an operator rather than by probes.
    pub fn is_operator_set(&self) -> bool {
        matches!(self, Health::Draining | Health::Maintenance)
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Health {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "healthy" => Ok(Health::Healthy),
            "unhealthy" => Ok(Health::Unhealthy),
            "draining" => Ok(Health::Draining),
            "maintenance" => Ok(Health::Maintenance),
            other => Err(PoolError::UnknownHealth(other.to_string())),
        }
    }
}

/// Errors returned by pool administration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("backend '{0}' already exists")]
    DuplicateBackend(String),

    #[error("backend '{0}' not found")]
    NotFound(String),

    #[error("invalid weight {weight} for backend '{id}' (must be >= 1)")]
    InvalidWeight { id: String, weight: u32 },

    #[error("unknown health state '{0}'")]
    UnknownHealth(String),

    #[error("invalid backend: {0}")]
    Invalid(String),
}

/// Point-in-time copy of a backend's descriptor and live state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendSnapshot {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub scheme: Scheme,
    pub weight: u32,
    pub health: Health,
    pub active_connections: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    /// Smoothed latency of successful calls in milliseconds, 0 until sampled.
    pub response_time_ms: f64,
    pub health_check_path: String,
    /// Unix seconds of the last probe, if any.
    pub last_health_check: Option<u64>,
    #[serde(skip)]
    pub timeout: Duration,
}

impl BackendSnapshot {
    /// `host:port` authority used for outbound connections.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Base URL of the backend.
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Proof that a backend was still a pool member. See [`ServerPool::pin`].
pub struct MembershipPin<'a> {
    _slots: RwLockReadGuard<'a, Vec<BackendSlot>>,
}

/// Live counters shared between the pool and in-flight requests.
#[derive(Debug, Default)]
struct BackendCounters {
    active_connections: AtomicU32,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
    /// f64 milliseconds stored as raw bits.
    response_time_ms: AtomicU64,
}

impl BackendCounters {
    fn response_time_ms(&self) -> f64 {
        f64::from_bits(self.response_time_ms.load(Ordering::Acquire))
    }
}

/// One pool member.
struct BackendSlot {
    config: ServerConfig,
    health: Health,
    last_health_check: Option<SystemTime>,
    counters: Arc<BackendCounters>,
}

impl BackendSlot {
    fn snapshot(&self) -> BackendSnapshot {
        let c = &self.counters;
        BackendSnapshot {
            id: self.config.id.clone(),
            host: self.config.host.clone(),
            port: self.config.port,
            scheme: self.config.scheme,
            weight: self.config.weight,
            health: self.health,
            active_connections: c.active_connections.load(Ordering::Acquire),
            total_requests: c.total_requests.load(Ordering::Relaxed),
            total_failures: c.total_failures.load(Ordering::Relaxed),
            response_time_ms: c.response_time_ms(),
            health_check_path: self.config.health_check_path.clone(),
            last_health_check: self.last_health_check.map(unix_seconds),
            timeout: self.config.timeout,
        }
    }
}

/// A health change applied by [`ServerPool::update_health`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthChange {
    pub previous: Health,
    pub current: Health,
}

impl HealthChange {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

/// The set of backends and their live state.
pub struct ServerPool {
    /// Members in insertion order.
    slots: RwLock<Vec<BackendSlot>>,
    /// Smoothing factor for the response time estimate.
    ema_alpha: f64,
}

impl ServerPool {
    /// Create an empty pool.
    pub fn new(ema_alpha: f64) -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            ema_alpha,
        }
    }

    /// Register a backend as healthy with zeroed counters.
    pub fn add(&self, config: ServerConfig) -> Result<BackendSnapshot, PoolError> {
        validate_server(&config).map_err(PoolError::Invalid)?;

        let mut slots = self.slots.write();
        if slots.iter().any(|s| s.config.id == config.id) {
            return Err(PoolError::DuplicateBackend(config.id));
        }

        let slot = BackendSlot {
            config,
            health: Health::Healthy,
            last_health_check: None,
            counters: Arc::new(BackendCounters::default()),
        };
        let snapshot = slot.snapshot();
        slots.push(slot);

        info!(backend = %snapshot.id, url = %snapshot.url(), weight = snapshot.weight, "backend added");
        Ok(snapshot)
    }

    /// Drain a backend and remove it from the pool.
    ///
    /// The backend is marked `Draining` first so that concurrent selections
    /// stop picking it, then its slot is dropped. In-flight requests keep
    /// their counters alive until they complete.
    pub fn remove(&self, id: &str) -> Result<BackendSnapshot, PoolError> {
        self.set_health(id, Health::Draining)?;

        let mut slots = self.slots.write();
        let index = slots
            .iter()
            .position(|s| s.config.id == id)
            .ok_or_else(|| PoolError::NotFound(id.to_string()))?;
        let slot = slots.remove(index);

        info!(
            backend = %id,
            in_flight = slot.counters.active_connections.load(Ordering::Acquire),
            "backend removed"
        );
        Ok(slot.snapshot())
    }

    /// Snapshot of the backends whose health is `Healthy`, in insertion order.
    pub fn healthy_set(&self) -> Vec<BackendSnapshot> {
        self.slots
            .read()
            .iter()
            .filter(|s| s.health == Health::Healthy)
            .map(BackendSlot::snapshot)
            .collect()
    }

    /// Snapshot of every backend, in insertion order.
    pub fn servers(&self) -> Vec<BackendSnapshot> {
        self.slots.read().iter().map(BackendSlot::snapshot).collect()
    }

    /// Snapshot of one backend.
    pub fn get(&self, id: &str) -> Option<BackendSnapshot> {
        self.slots
            .read()
            .iter()
            .find(|s| s.config.id == id)
            .map(BackendSlot::snapshot)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.read().iter().any(|s| s.config.id == id)
    }

    /// Hold the backend's membership while per-backend state is written.
    ///
    /// Returns `None` if the backend is gone. While the pin is alive the
    /// backend cannot be removed, so cleanup that follows a removal always
    /// sees the writes made under the pin. Do not call back into the pool
    /// while holding it.
    pub fn pin(&self, id: &str) -> Option<MembershipPin<'_>> {
        let slots = self.slots.read();
        if slots.iter().any(|s| s.config.id == id) {
            Some(MembershipPin { _slots: slots })
        } else {
            None
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.slots.read().iter().map(|s| s.config.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Administrative health override. Returns the previous state.
    pub fn set_health(&self, id: &str, health: Health) -> Result<Health, PoolError> {
        let mut slots = self.slots.write();
        let slot = slots
            .iter_mut()
            .find(|s| s.config.id == id)
            .ok_or_else(|| PoolError::NotFound(id.to_string()))?;

        let previous = std::mem::replace(&mut slot.health, health);
        if previous != health {
            info!(backend = %id, from = %previous, to = %health, "backend health set");
        }
        Ok(previous)
    }

    /// Administrative weight override.
    pub fn update_weight(&self, id: &str, weight: u32) -> Result<(), PoolError> {
        if weight == 0 {
            return Err(PoolError::InvalidWeight {
                id: id.to_string(),
                weight,
            });
        }

        let mut slots = self.slots.write();
        let slot = slots
            .iter_mut()
            .find(|s| s.config.id == id)
            .ok_or_else(|| PoolError::NotFound(id.to_string()))?;
        slot.config.weight = weight;

        info!(backend = %id, weight, "backend weight updated");
        Ok(())
    }

    /// Read, transform and write a backend's health in one critical section.
    ///
    /// Also stamps the last health check time. Returns `None` if the backend
    /// is no longer in the pool.
    pub fn update_health<F>(&self, id: &str, transition: F) -> Option<HealthChange>
    where
        F: FnOnce(Health) -> Health,
    {
        let mut slots = self.slots.write();
        let slot = slots.iter_mut().find(|s| s.config.id == id)?;

        let previous = slot.health;
        let current = transition(previous);
        slot.health = current;
        slot.last_health_check = Some(SystemTime::now());

        Some(HealthChange { previous, current })
    }

    /// Start a request against a backend.
    ///
    /// Increments the active connection and total request counters. The
    /// returned guard decrements the active count when dropped, so the count
    /// returns to its previous value on every exit path.
    pub fn acquire(&self, id: &str) -> Option<ConnectionGuard> {
        let counters = {
            let slots = self.slots.read();
            let slot = slots.iter().find(|s| s.config.id == id)?;
            Arc::clone(&slot.counters)
        };

        counters.active_connections.fetch_add(1, Ordering::AcqRel);
        counters.total_requests.fetch_add(1, Ordering::Relaxed);

        Some(ConnectionGuard {
            backend_id: id.to_string(),
            counters,
            ema_alpha: self.ema_alpha,
        })
    }
}

/// Tracks one in-flight request against a backend.
pub struct ConnectionGuard {
    backend_id: String,
    counters: Arc<BackendCounters>,
    ema_alpha: f64,
}

impl ConnectionGuard {
    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    /// Fold a successful call's latency into the response time estimate.
    pub fn record_success(&self, latency: Duration) {
        let sample = latency.as_secs_f64() * 1000.0;
        let alpha = self.ema_alpha;
        let _ = self
            .counters
            .response_time_ms
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some(ema(f64::from_bits(bits), sample, alpha).to_bits())
            });
    }

    /// Count a failed call.
    pub fn record_failure(&self) {
        self.counters.total_failures.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let result = self.counters.active_connections.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |n| n.checked_sub(1),
        );
        if result.is_err() {
            warn!(backend = %self.backend_id, "active connection count already zero");
        }
    }
}

/// Exponential moving average; the first sample seeds the estimate.
pub fn ema(current: f64, sample: f64, alpha: f64) -> f64 {
    if current == 0.0 {
        sample
    } else {
        alpha * sample + (1.0 - alpha) * current
    }
}

fn unix_seconds(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(ids: &[&str]) -> ServerPool {
        let pool = ServerPool::new(0.1);
        for (i, id) in ids.iter().enumerate() {
            pool.add(ServerConfig::new(*id, "127.0.0.1", 9000 + i as u16))
                .unwrap();
        }
        pool
    }

    #[test]
    fn test_add_starts_healthy() {
        let pool = pool_with(&["a"]);
        let a = pool.get("a").unwrap();
        assert_eq!(a.health, Health::Healthy);
        assert_eq!(a.active_connections, 0);
        assert_eq!(a.total_requests, 0);
        assert_eq!(a.response_time_ms, 0.0);
        assert_eq!(a.last_health_check, None);
    }

    #[test]
    fn test_duplicate_rejected() {
        let pool = pool_with(&["a"]);
        let err = pool
            .add(ServerConfig::new("a", "127.0.0.1", 9999))
            .unwrap_err();
        assert_eq!(err, PoolError::DuplicateBackend("a".to_string()));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_invalid_server_rejected() {
        let pool = ServerPool::new(0.1);
        let err = pool
            .add(ServerConfig::new("a", "127.0.0.1", 9000).with_weight(0))
            .unwrap_err();
        assert!(matches!(err, PoolError::Invalid(_)));
    }

    #[test]
    fn test_remove_unknown() {
        let pool = pool_with(&["a"]);
        assert_eq!(
            pool.remove("zz").unwrap_err(),
            PoolError::NotFound("zz".to_string())
        );
    }

    #[test]
    fn test_remove_drains_first() {
        let pool = pool_with(&["a", "b"]);
        let removed = pool.remove("a").unwrap();
        assert_eq!(removed.health, Health::Draining);
        assert!(!pool.contains("a"));
        assert_eq!(pool.ids(), vec!["b".to_string()]);
    }

    #[test]
    fn test_healthy_set_is_filtered_snapshot() {
        let pool = pool_with(&["a", "b", "c", "d"]);
        pool.set_health("b", Health::Unhealthy).unwrap();
        pool.set_health("c", Health::Draining).unwrap();
        pool.set_health("d", Health::Maintenance).unwrap();

        let healthy = pool.healthy_set();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].id, "a");

        // Snapshot is not a live view
        pool.set_health("a", Health::Unhealthy).unwrap();
        assert_eq!(healthy[0].health, Health::Healthy);
        assert!(pool.healthy_set().is_empty());
    }

    #[test]
    fn test_insertion_order_preserved() {
        let pool = pool_with(&["c", "a", "b"]);
        let ids: Vec<_> = pool.servers().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_update_weight() {
        let pool = pool_with(&["a"]);
        pool.update_weight("a", 5).unwrap();
        assert_eq!(pool.get("a").unwrap().weight, 5);
        assert!(matches!(
            pool.update_weight("a", 0),
            Err(PoolError::InvalidWeight { .. })
        ));
        assert!(matches!(
            pool.update_weight("zz", 2),
            Err(PoolError::NotFound(_))
        ));
    }

    #[test]
    fn test_update_health_stamps_check_time() {
        let pool = pool_with(&["a"]);
        let change = pool.update_health("a", |_| Health::Unhealthy).unwrap();
        assert!(change.changed());
        assert_eq!(change.previous, Health::Healthy);
        assert!(pool.get("a").unwrap().last_health_check.is_some());
        assert!(pool.update_health("zz", |h| h).is_none());
    }

    #[test]
    fn test_guard_brackets_connection_count() {
        let pool = pool_with(&["a"]);
        {
            let g1 = pool.acquire("a").unwrap();
            let _g2 = pool.acquire("a").unwrap();
            assert_eq!(pool.get("a").unwrap().active_connections, 2);
            g1.record_failure();
        }
        let a = pool.get("a").unwrap();
        assert_eq!(a.active_connections, 0);
        assert_eq!(a.total_requests, 2);
        assert_eq!(a.total_failures, 1);
    }

    #[test]
    fn test_guard_survives_removal() {
        let pool = pool_with(&["a"]);
        let guard = pool.acquire("a").unwrap();
        pool.remove("a").unwrap();
        guard.record_success(Duration::from_millis(5));
        drop(guard);
        assert!(pool.acquire("a").is_none());
    }

    #[test]
    fn test_response_time_ema() {
        let pool = pool_with(&["a"]);
        let guard = pool.acquire("a").unwrap();
        guard.record_success(Duration::from_millis(100));
        assert!((pool.get("a").unwrap().response_time_ms - 100.0).abs() < 1e-9);

        guard.record_success(Duration::from_millis(200));
        // 0.1 * 200 + 0.9 * 100
        assert!((pool.get("a").unwrap().response_time_ms - 110.0).abs() < 1e-9);
    }

    #[test]
    fn test_pin_holds_off_removal() {
        let pool = Arc::new(pool_with(&["a"]));
        assert!(pool.pin("missing").is_none());

        let pin = pool.pin("a").unwrap();
        let remover = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.remove("a").is_ok())
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!remover.is_finished());

        drop(pin);
        assert!(remover.join().unwrap());
        assert!(pool.pin("a").is_none());
    }

    #[test]
    fn test_ema_seed() {
        assert_eq!(ema(0.0, 42.0, 0.1), 42.0);
        assert!((ema(10.0, 20.0, 0.5) - 15.0).abs() < 1e-12);
    }

    #[test]
    fn test_health_from_str() {
        assert_eq!("DRAINING".parse::<Health>().unwrap(), Health::Draining);
        assert!("sleepy".parse::<Health>().is_err());
        assert!(Health::Maintenance.is_operator_set());
        assert!(!Health::Unhealthy.is_operator_set());
    }
}
