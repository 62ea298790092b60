//! Prometheus metrics using prometheus-client.
//!
//! Provides metrics for request counts, latency, rejections, backend health
//! and circuit breaker state.

use crate::backend::Health;
use crate::breaker::CircuitState;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::Duration;

/// Labels for request metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub backend: String,
    pub method: String,
    pub status: String,
}

/// Labels for per-backend gauges and histograms.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BackendLabels {
    pub backend: String,
}

/// Labels for requests answered by the balancer itself.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RejectionLabels {
    pub reason: RejectionReason,
}

/// Why a request was answered without a backend response.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum RejectionReason {
    RateLimited,
    NoHealthyBackend,
    CircuitOpen,
    BadGateway,
}

/// Labels for health check metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HealthCheckLabels {
    pub backend: String,
    pub result: HealthCheckResult,
}

/// Result of a health check.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum HealthCheckResult {
    Success,
    Failure,
}

/// Collects and stores all metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

struct MetricsCollectorInner {
    /// Total proxied requests.
    requests_total: Family<RequestLabels, Counter>,
    /// Request duration histogram (in seconds).
    request_duration_seconds: Family<BackendLabels, Histogram>,
    /// Requests rejected before or instead of reaching a backend.
    rejections_total: Family<RejectionLabels, Counter>,
    /// Active connections gauge.
    active_connections: Family<BackendLabels, Gauge>,
    /// Backend health gauge (1 = healthy, 0 = otherwise).
    backend_health: Family<BackendLabels, Gauge>,
    /// Circuit state gauge (0 = closed, 1 = half open, 2 = open).
    circuit_state: Family<BackendLabels, Gauge>,
    /// Health check results counter.
    health_checks_total: Family<HealthCheckLabels, Counter>,
    /// Live session affinity entries.
    affinity_sessions: Gauge,
    /// The prometheus registry.
    registry: Registry,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let requests_total = Family::<RequestLabels, Counter>::default();
        let request_duration_seconds = Family::<BackendLabels, Histogram>::new_with_constructor(
            || {
                // Buckets: 1ms, 2.5ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s
                Histogram::new(exponential_buckets(0.001, 2.5, 13))
            },
        );
        let rejections_total = Family::<RejectionLabels, Counter>::default();
        let active_connections = Family::<BackendLabels, Gauge>::default();
        let backend_health = Family::<BackendLabels, Gauge>::default();
        let circuit_state = Family::<BackendLabels, Gauge>::default();
        let health_checks_total = Family::<HealthCheckLabels, Counter>::default();
        let affinity_sessions = Gauge::default();

        registry.register(
            "gatelb_requests",
            "Total number of requests forwarded to backends",
            requests_total.clone(),
        );
        registry.register(
            "gatelb_request_duration_seconds",
            "Backend request duration in seconds",
            request_duration_seconds.clone(),
        );
        registry.register(
            "gatelb_rejections",
            "Requests answered by the balancer without a backend response",
            rejections_total.clone(),
        );
        registry.register(
            "gatelb_active_connections",
            "Number of in-flight requests per backend",
            active_connections.clone(),
        );
        registry.register(
            "gatelb_backend_health",
            "Backend server health status (1=healthy, 0=not selectable)",
            backend_health.clone(),
        );
        registry.register(
            "gatelb_circuit_state",
            "Circuit breaker state (0=closed, 1=half open, 2=open)",
            circuit_state.clone(),
        );
        registry.register(
            "gatelb_health_checks",
            "Total number of health checks performed",
            health_checks_total.clone(),
        );
        registry.register(
            "gatelb_affinity_sessions",
            "Number of session affinity entries",
            affinity_sessions.clone(),
        );

        Self {
            inner: Arc::new(MetricsCollectorInner {
                requests_total,
                request_duration_seconds,
                rejections_total,
                active_connections,
                backend_health,
                circuit_state,
                health_checks_total,
                affinity_sessions,
                registry,
            }),
        }
    }

    /// Get the prometheus registry for encoding.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Record a request that reached a backend.
    pub fn record_request(&self, backend: &str, method: &str, status: u16, duration: Duration) {
        let labels = RequestLabels {
            backend: backend.to_string(),
            method: method.to_string(),
            status: status.to_string(),
        };
        self.inner.requests_total.get_or_create(&labels).inc();

        self.inner
            .request_duration_seconds
            .get_or_create(&backend_labels(backend))
            .observe(duration.as_secs_f64());
    }

    /// Record a request the balancer answered itself.
    pub fn record_rejection(&self, reason: RejectionReason) {
        self.inner
            .rejections_total
            .get_or_create(&RejectionLabels { reason })
            .inc();
    }

    /// Record a health check result.
    pub fn record_health_check(&self, backend: &str, success: bool) {
        let labels = HealthCheckLabels {
            backend: backend.to_string(),
            result: if success {
                HealthCheckResult::Success
            } else {
                HealthCheckResult::Failure
            },
        };
        self.inner.health_checks_total.get_or_create(&labels).inc();
    }

    /// Publish a backend's health.
    pub fn set_backend_health(&self, backend: &str, health: Health) {
        let value = if health == Health::Healthy { 1 } else { 0 };
        self.inner
            .backend_health
            .get_or_create(&backend_labels(backend))
            .set(value);
    }

    /// Publish a backend's in-flight request count.
    pub fn set_active_connections(&self, backend: &str, count: u32) {
        self.inner
            .active_connections
            .get_or_create(&backend_labels(backend))
            .set(i64::from(count));
    }

    /// Publish a backend's circuit state.
    pub fn set_circuit_state(&self, backend: &str, state: CircuitState) {
        let value = match state {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        };
        self.inner
            .circuit_state
            .get_or_create(&backend_labels(backend))
            .set(value);
    }

    pub fn set_affinity_sessions(&self, count: usize) {
        self.inner
            .affinity_sessions
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    /// Drop the gauges of a removed backend.
    pub fn forget_backend(&self, backend: &str) {
        let labels = backend_labels(backend);
        self.inner.active_connections.remove(&labels);
        self.inner.backend_health.remove(&labels);
        self.inner.circuit_state.remove(&labels);
    }

    /// Encode all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, self.registry())?;
        Ok(buffer)
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn backend_labels(backend: &str) -> BackendLabels {
    BackendLabels {
        backend: backend.to_string(),
    }
}
