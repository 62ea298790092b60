//! The load balancer facade.
//!
//! Wires the pool, selector, breakers, limiter, health checker and metrics
//! together and exposes the administrative operations.

use crate::backend::{
    BackendSnapshot, Health, PoolError, SelectError, Selector, ServerPool, SessionAffinityTable,
};
use crate::breaker::{BreakerRegistry, CircuitState};
use crate::config::{Algorithm, Config, ServerConfig, UnknownAlgorithm};
use crate::health::{HealthChecker, ProbeSettings};
use crate::metrics::{MetricsCollector, MetricsRecorder};
use crate::proxy::{Proxy, ProxyRequest, ProxyResponse};
use crate::ratelimit::RateLimiter;
use crate::util::ShutdownSignal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// Errors surfaced to administrative callers.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    UnknownAlgorithm(#[from] UnknownAlgorithm),
}

/// Windowed statistics plus a line for every backend in the pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BalancerStats {
    pub total_requests: u64,
    pub avg_response_time: f64,
    pub error_rate_percent: f64,
    pub requests_per_second: f64,
    pub per_backend: BTreeMap<String, BackendStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendStats {
    pub requests: u64,
    pub avg_response_time: f64,
    pub error_rate_percent: f64,
    pub health: Health,
    pub active_connections: u32,
    pub total_requests_all_time: u64,
    /// Requests answered with a status of 400 or above since the backend was added.
    pub errors_all_time: u64,
    pub bytes_all_time: u64,
}

/// Summary used by the status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalancerStatus {
    pub total_servers: usize,
    pub healthy_servers: usize,
    pub unhealthy_servers: usize,
    pub algorithm: Algorithm,
    pub session_affinity: bool,
    pub active_sessions: usize,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
}

/// What one maintenance pass reclaimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub idle_clients: usize,
    pub expired_sessions: usize,
}

/// Reverse-proxy load balancer.
pub struct LoadBalancer {
    pool: Arc<ServerPool>,
    selector: Arc<Selector>,
    breakers: Option<Arc<BreakerRegistry>>,
    limiter: Option<Arc<RateLimiter>>,
    recorder: Arc<MetricsRecorder>,
    metrics: MetricsCollector,
    proxy: Proxy,
    health: Option<HealthChecker>,
    shutdown: ShutdownSignal,
    maintenance_interval: std::time::Duration,
    /// Set once background tasks run; servers added later get a probe task.
    started: AtomicBool,
}

impl LoadBalancer {
    /// Build a balancer and register the configured servers.
    pub fn new(config: &Config, shutdown: ShutdownSignal) -> Result<Self, AdminError> {
        let pool = Arc::new(ServerPool::new(config.metrics.ema_alpha));

        let affinity = config
            .session_affinity
            .enabled
            .then(|| SessionAffinityTable::new(config.session_affinity.ttl));
        let selector = Arc::new(Selector::new(config.algorithm, affinity));

        let cb = &config.circuit_breaker;
        let breakers = cb
            .enabled
            .then(|| Arc::new(BreakerRegistry::new(cb.failure_threshold, cb.recovery_timeout)));

        let rl = &config.rate_limit;
        let limiter = rl
            .enabled
            .then(|| Arc::new(RateLimiter::new(rl.max_requests, rl.window)));

        let recorder = Arc::new(MetricsRecorder::new(config.metrics.capacity));
        let metrics = MetricsCollector::new();

        let proxy = Proxy::new(
            Arc::clone(&pool),
            Arc::clone(&selector),
            breakers.clone(),
            limiter.clone(),
            Arc::clone(&recorder),
            metrics.clone(),
        );

        let health = config.health_check.enabled.then(|| {
            HealthChecker::new(
                Arc::clone(&pool),
                ProbeSettings::from(&config.health_check),
                metrics.clone(),
                shutdown.clone(),
            )
        });

        let lb = Self {
            pool,
            selector,
            breakers,
            limiter,
            recorder,
            metrics,
            proxy,
            health,
            shutdown,
            maintenance_interval: config.metrics.maintenance_interval,
            started: AtomicBool::new(false),
        };

        for server in &config.servers {
            lb.add_server(server.clone())?;
        }

        Ok(lb)
    }

    /// Start health probes and the maintenance loop. Returns `None` if they
    /// are already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.started.swap(true, Ordering::AcqRel) {
            debug!("background tasks already running");
            return None;
        }

        if let Some(health) = &self.health {
            for id in self.pool.ids() {
                health.watch(&id);
            }
        }

        Some(tokio::spawn(run_maintenance(
            Arc::clone(self),
            self.shutdown.subscribe(),
        )))
    }

    /// Proxy one request.
    pub async fn handle(&self, request: ProxyRequest) -> ProxyResponse {
        self.proxy.handle(request).await
    }

    pub fn pool(&self) -> &Arc<ServerPool> {
        &self.pool
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn session_affinity(&self) -> Option<&SessionAffinityTable> {
        self.selector.affinity()
    }

    /// Register a backend; it starts healthy and is probed if health
    /// checking runs.
    pub fn add_server(&self, server: ServerConfig) -> Result<BackendSnapshot, AdminError> {
        let snapshot = self.pool.add(server)?;

        if let Some(_pin) = self.pool.pin(&snapshot.id) {
            if let Some(breakers) = &self.breakers {
                let breaker = breakers.get_or_insert(&snapshot.id);
                self.metrics.set_circuit_state(&snapshot.id, breaker.state());
            }
            self.metrics.set_backend_health(&snapshot.id, snapshot.health);
        }

        if self.started.load(Ordering::Acquire) {
            if let Some(health) = &self.health {
                health.watch(&snapshot.id);
            }
        }
        Ok(snapshot)
    }

    /// Drain and remove a backend, purging its breaker, session mappings
    /// and counters.
    pub fn remove_server(&self, id: &str) -> Result<BackendSnapshot, AdminError> {
        let removed = self.pool.remove(id)?;

        if let Some(health) = &self.health {
            health.unwatch(id);
        }
        if let Some(breakers) = &self.breakers {
            breakers.remove(id);
        }
        let sessions = self
            .selector
            .affinity()
            .map(|table| table.purge_backend(id))
            .unwrap_or(0);
        self.recorder.forget_backend(id);
        self.metrics.forget_backend(id);

        info!(backend = %id, sessions_purged = sessions, "backend state purged");
        Ok(removed)
    }

    /// Switch algorithm by name. Unknown names leave the current one in place.
    pub fn set_algorithm(&self, name: &str) -> Result<Algorithm, AdminError> {
        let algorithm: Algorithm = name.parse()?;
        self.selector.set_algorithm(algorithm);
        Ok(algorithm)
    }

    pub fn algorithm(&self) -> Algorithm {
        self.selector.algorithm()
    }

    pub fn get_servers(&self) -> Vec<BackendSnapshot> {
        self.pool.servers()
    }

    /// Statistics over the last `window_minutes` minutes.
    pub fn get_stats(&self, window_minutes: u64) -> BalancerStats {
        self.get_stats_at(Instant::now(), window_minutes)
    }

    pub fn get_stats_at(&self, now: Instant, window_minutes: u64) -> BalancerStats {
        let window = self.recorder.stats_at(now, window_minutes);
        if window.total_requests == 0 {
            return BalancerStats::default();
        }

        let per_backend = self
            .pool
            .servers()
            .into_iter()
            .map(|server| {
                let recent = window.per_backend.get(&server.id).cloned().unwrap_or_default();
                let totals = self.recorder.backend_totals(&server.id);
                let stats = BackendStats {
                    requests: recent.requests,
                    avg_response_time: recent.avg_response_time,
                    error_rate_percent: recent.error_rate_percent,
                    health: server.health,
                    active_connections: server.active_connections,
                    total_requests_all_time: server.total_requests,
                    errors_all_time: totals.errors,
                    bytes_all_time: totals.bytes,
                };
                (server.id, stats)
            })
            .collect();

        BalancerStats {
            total_requests: window.total_requests,
            avg_response_time: window.avg_response_time,
            error_rate_percent: window.error_rate_percent,
            requests_per_second: window.requests_per_second,
            per_backend,
        }
    }

    pub fn set_health(&self, id: &str, health: Health) -> Result<Health, AdminError> {
        let previous = self.pool.set_health(id, health)?;
        self.metrics.set_backend_health(id, health);
        Ok(previous)
    }

    pub fn update_weight(&self, id: &str, weight: u32) -> Result<(), AdminError> {
        Ok(self.pool.update_weight(id, weight)?)
    }

    /// Stop sending new requests to a backend.
    pub fn drain_server(&self, id: &str) -> Result<Health, AdminError> {
        self.set_health(id, Health::Draining)
    }

    /// Return a backend to rotation.
    pub fn enable_server(&self, id: &str) -> Result<Health, AdminError> {
        self.set_health(id, Health::Healthy)
    }

    /// Take a backend out for maintenance.
    pub fn disable_server(&self, id: &str) -> Result<Health, AdminError> {
        self.set_health(id, Health::Maintenance)
    }

    pub fn status(&self) -> BalancerStatus {
        let servers = self.pool.servers();
        let healthy = servers.iter().filter(|s| s.health == Health::Healthy).count();
        let lifetime = self.recorder.lifetime();

        BalancerStatus {
            total_servers: servers.len(),
            healthy_servers: healthy,
            unhealthy_servers: servers.len() - healthy,
            algorithm: self.algorithm(),
            session_affinity: self.selector.affinity().is_some(),
            active_sessions: self.selector.affinity().map_or(0, SessionAffinityTable::len),
            total_requests: lifetime.total_requests,
            successful_requests: lifetime.successful_requests,
            failed_requests: lifetime.failed_requests,
        }
    }

    /// Pick a backend without forwarding anything.
    pub fn select(
        &self,
        client_ip: Option<std::net::IpAddr>,
        session_id: Option<&str>,
    ) -> Result<BackendSnapshot, SelectError> {
        self.selector
            .pick(&self.pool.healthy_set(), client_ip, session_id)
    }

    /// Circuit state per backend that has seen traffic.
    pub fn circuit_states(&self) -> Vec<(String, CircuitState)> {
        self.breakers
            .as_ref()
            .map(|registry| {
                registry
                    .snapshots()
                    .into_iter()
                    .map(|(id, snap)| (id, snap.state))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Reclaim idle limiter windows and expired sessions, then refresh the
    /// exported gauges.
    pub fn run_maintenance_at(&self, now: Instant) -> MaintenanceReport {
        let idle_clients = self.limiter.as_ref().map_or(0, |l| l.sweep_at(now));
        let expired_sessions = self
            .selector
            .affinity()
            .map_or(0, |table| table.purge_expired_at(now));

        // Gauges are written under a pin so a concurrent removal's cleanup
        // cannot be undone
        for server in self.pool.servers() {
            if let Some(_pin) = self.pool.pin(&server.id) {
                self.metrics.set_backend_health(&server.id, server.health);
                self.metrics
                    .set_active_connections(&server.id, server.active_connections);
            }
        }
        for (id, state) in self.circuit_states() {
            if let Some(_pin) = self.pool.pin(&id) {
                self.metrics.set_circuit_state(&id, state);
            }
        }
        self.metrics
            .set_affinity_sessions(self.selector.affinity().map_or(0, SessionAffinityTable::len));

        MaintenanceReport {
            idle_clients,
            expired_sessions,
        }
    }
}

/// Periodic maintenance until shutdown. Each pass runs in its own task so
/// that a panic is logged and the next pass still happens.
async fn run_maintenance(lb: Arc<LoadBalancer>, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = interval(lb.maintenance_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let pass = Arc::clone(&lb);
                match tokio::spawn(async move { pass.run_maintenance_at(Instant::now()) }).await {
                    Ok(report) => debug!(
                        idle_clients = report.idle_clients,
                        expired_sessions = report.expired_sessions,
                        "maintenance pass complete"
                    ),
                    Err(e) => error!(error = %e, "maintenance pass failed"),
                }
            }

            _ = shutdown.recv() => {
                debug!("maintenance loop shutting down");
                break;
            }
        }
    }
}
