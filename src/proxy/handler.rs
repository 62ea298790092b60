//! Request path: admission, selection, breaker-guarded forwarding and
//! metrics recording.

use crate::backend::{SelectError, Selector, ServerPool};
use crate::breaker::{BreakerRegistry, CircuitBreaker, CircuitError};
use crate::metrics::{MetricsCollector, MetricsRecorder, RejectionReason, RequestSample};
use crate::proxy::client::{self, TransportError};
use crate::ratelimit::{RateDecision, RateLimiter};
use crate::util::generate_short_request_id;
use bytes::Bytes;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use hyper::{Method, StatusCode};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Identity used for clients without a known address.
const UNKNOWN_CLIENT: &str = "unknown";

/// An inbound request, fully buffered.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: Option<IpAddr>,
    pub session_id: Option<String>,
}

impl ProxyRequest {
    /// Rate limiting identity of the caller.
    pub fn client_identity(&self) -> String {
        self.client_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
    }
}

/// The response handed back to the transport adapter.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Backend that served or was selected for the request.
    pub backend_id: Option<String>,
}

/// Request-path failures. Each maps to a status code and a JSON body.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("rate limit exceeded")]
    RateLimited { retry_after: Duration },

    #[error("no healthy backend available")]
    NoHealthyBackend,

    #[error("circuit open for backend '{backend}'")]
    CircuitOpen { backend: String },

    #[error("backend '{backend}' unreachable: {source}")]
    BackendUnreachable {
        backend: String,
        #[source]
        source: TransportError,
    },
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::NoHealthyBackend | ProxyError::CircuitOpen { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::BackendUnreachable { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    /// Client-facing error category.
    pub fn message(&self) -> &'static str {
        match self {
            ProxyError::RateLimited { .. } => "Rate limit exceeded",
            ProxyError::NoHealthyBackend => "No healthy servers available",
            ProxyError::CircuitOpen { .. } => "Service temporarily unavailable",
            ProxyError::BackendUnreachable { .. } => "Bad Gateway",
        }
    }

    fn reason(&self) -> RejectionReason {
        match self {
            ProxyError::RateLimited { .. } => RejectionReason::RateLimited,
            ProxyError::NoHealthyBackend => RejectionReason::NoHealthyBackend,
            ProxyError::CircuitOpen { .. } => RejectionReason::CircuitOpen,
            ProxyError::BackendUnreachable { .. } => RejectionReason::BadGateway,
        }
    }

    fn backend_id(&self) -> Option<String> {
        match self {
            ProxyError::CircuitOpen { backend } | ProxyError::BackendUnreachable { backend, .. } => {
                Some(backend.clone())
            }
            _ => None,
        }
    }

    /// Render as `{"error": "<category>"}`.
    pub fn into_response(self) -> ProxyResponse {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let ProxyError::RateLimited { retry_after } = &self {
            // Round up so clients never retry early
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            headers.insert(RETRY_AFTER, HeaderValue::from(secs.max(1)));
        }

        let body = serde_json::json!({ "error": self.message() }).to_string();
        ProxyResponse {
            status: self.status(),
            headers,
            body: Bytes::from(body),
            backend_id: self.backend_id(),
        }
    }
}

/// The request pipeline shared by every connection.
pub struct Proxy {
    pool: Arc<ServerPool>,
    selector: Arc<Selector>,
    breakers: Option<Arc<BreakerRegistry>>,
    limiter: Option<Arc<RateLimiter>>,
    recorder: Arc<MetricsRecorder>,
    metrics: MetricsCollector,
}

impl Proxy {
    /// Create a proxy. `None` for the breaker registry or the limiter
    /// disables that stage.
    pub fn new(
        pool: Arc<ServerPool>,
        selector: Arc<Selector>,
        breakers: Option<Arc<BreakerRegistry>>,
        limiter: Option<Arc<RateLimiter>>,
        recorder: Arc<MetricsRecorder>,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            pool,
            selector,
            breakers,
            limiter,
            recorder,
            metrics,
        }
    }

    /// Handle one request. Never fails; errors become error responses.
    #[instrument(skip_all, fields(
        request_id = %generate_short_request_id(),
        method = %request.method,
        path = %request.path_and_query,
        client = %request.client_identity(),
    ))]
    pub async fn handle(&self, request: ProxyRequest) -> ProxyResponse {
        match self.dispatch(&request).await {
            Ok(response) => response,
            Err(e) => {
                match &e {
                    ProxyError::RateLimited { .. } => debug!("request rate limited"),
                    ProxyError::NoHealthyBackend => warn!("no healthy servers available"),
                    other => warn!(error = %other, "request failed"),
                }
                self.metrics.record_rejection(e.reason());
                e.into_response()
            }
        }
    }

    /// The backend's breaker. A missing one is only created while the
    /// backend is pinned, so a removed backend never gets one back.
    fn breaker_for(&self, registry: &BreakerRegistry, id: &str) -> Option<Arc<CircuitBreaker>> {
        registry.get(id).or_else(|| {
            let _pin = self.pool.pin(id)?;
            Some(registry.get_or_insert(id))
        })
    }

    async fn dispatch(&self, request: &ProxyRequest) -> Result<ProxyResponse, ProxyError> {
        let client = request.client_identity();

        if let Some(limiter) = &self.limiter {
            if let RateDecision::Rejected { retry_after } = limiter.admit(&client) {
                return Err(ProxyError::RateLimited { retry_after });
            }
        }

        let healthy = self.pool.healthy_set();
        let backend = self
            .selector
            .pick(&healthy, request.client_ip, request.session_id.as_deref())
            .map_err(|SelectError::NoHealthyBackend| ProxyError::NoHealthyBackend)?;

        // Removed between snapshot and dispatch
        let guard = self
            .pool
            .acquire(&backend.id)
            .ok_or(ProxyError::NoHealthyBackend)?;

        let start = Instant::now();
        let result = match &self.breakers {
            Some(registry) => {
                let Some(breaker) = self.breaker_for(registry, &backend.id) else {
                    return Err(ProxyError::NoHealthyBackend);
                };
                breaker.call(|| client::forward(&backend, request)).await
            }
            None => client::forward(&backend, request)
                .await
                .map_err(CircuitError::Inner),
        };
        let latency = start.elapsed();

        let outcome = match result {
            Ok(upstream) => {
                guard.record_success(latency);
                Ok(upstream)
            }
            Err(CircuitError::Open) => Err(ProxyError::CircuitOpen {
                backend: backend.id.clone(),
            }),
            Err(CircuitError::Inner(source)) => {
                guard.record_failure();
                Err(ProxyError::BackendUnreachable {
                    backend: backend.id.clone(),
                    source,
                })
            }
        };

        let (status, bytes) = match &outcome {
            Ok(upstream) => (upstream.status, upstream.body.len() as u64),
            Err(e) => (e.status(), 0),
        };
        let sample = RequestSample {
            at: Instant::now(),
            client,
            backend_id: backend.id.clone(),
            latency,
            status: status.as_u16(),
            bytes,
        };
        match self.pool.pin(&backend.id) {
            Some(_pin) => {
                self.recorder.record(sample);
                self.metrics.record_request(
                    &backend.id,
                    request.method.as_str(),
                    status.as_u16(),
                    latency,
                );
            }
            None => {
                debug!(backend = %backend.id, "backend removed while request was in flight");
                self.recorder.record_unattributed(sample);
            }
        }

        let upstream = outcome?;
        info!(
            backend = %backend.id,
            status = upstream.status.as_u16(),
            duration_ms = latency.as_millis() as u64,
            "proxied request completed"
        );

        let mut headers = upstream.headers;
        if let Ok(value) = HeaderValue::from_str(&backend.id) {
            headers.insert("x-served-by", value);
        }

        Ok(ProxyResponse {
            status: upstream.status,
            headers,
            body: upstream.body,
            backend_id: Some(backend.id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Health;
    use crate::config::{Algorithm, ServerConfig};

    fn request(ip: &str) -> ProxyRequest {
        ProxyRequest {
            method: Method::GET,
            path_and_query: "/".to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            client_ip: ip.parse().ok(),
            session_id: None,
        }
    }

    fn proxy(pool: Arc<ServerPool>, limiter: Option<RateLimiter>) -> Proxy {
        Proxy::new(
            pool,
            Arc::new(Selector::new(Algorithm::RoundRobin, None)),
            Some(Arc::new(BreakerRegistry::new(1, Duration::from_secs(60)))),
            limiter.map(Arc::new),
            Arc::new(MetricsRecorder::new(100)),
            MetricsCollector::new(),
        )
    }

    /// A backend address with nothing listening.
    async fn dead_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    /// A backend that answers 200 after `delay`.
    async fn slow_backend(delay: Duration) -> u16 {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    tokio::time::sleep(delay).await;
                    let _ = stream
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                        .await;
                    let _ = stream.shutdown().await;
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                    }
                });
            }
        });
        port
    }

    #[test]
    fn test_error_mapping() {
        let cases = [
            (
                ProxyError::RateLimited { retry_after: Duration::from_millis(1500) },
                429,
                "Rate limit exceeded",
            ),
            (ProxyError::NoHealthyBackend, 503, "No healthy servers available"),
            (
                ProxyError::CircuitOpen { backend: "a".to_string() },
                503,
                "Service temporarily unavailable",
            ),
            (
                ProxyError::BackendUnreachable {
                    backend: "a".to_string(),
                    source: TransportError::Timeout(Duration::from_secs(1)),
                },
                502,
                "Bad Gateway",
            ),
        ];

        for (error, status, message) in cases {
            let response = error.into_response();
            assert_eq!(response.status.as_u16(), status);
            let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
            assert_eq!(body["error"], message);
            assert_eq!(response.headers["content-type"], "application/json");
        }
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let response = ProxyError::RateLimited {
            retry_after: Duration::from_millis(1500),
        }
        .into_response();
        assert_eq!(response.headers["retry-after"], "2");
    }

    #[tokio::test]
    async fn test_no_backends_is_503() {
        let proxy = proxy(Arc::new(ServerPool::new(0.1)), None);
        let response = proxy.handle(request("10.0.0.1")).await;
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.backend_id.is_none());
    }

    #[tokio::test]
    async fn test_rate_limited_is_429_and_skips_pool() {
        let pool = Arc::new(ServerPool::new(0.1));
        let proxy = proxy(
            Arc::clone(&pool),
            Some(RateLimiter::new(1, Duration::from_secs(60))),
        );

        // First request is admitted and fails on the empty pool
        assert_eq!(proxy.handle(request("10.0.0.1")).await.status.as_u16(), 503);
        assert_eq!(proxy.handle(request("10.0.0.1")).await.status.as_u16(), 429);
        // Another client has its own window
        assert_eq!(proxy.handle(request("10.0.0.2")).await.status.as_u16(), 503);
    }

    #[tokio::test]
    async fn test_unreachable_then_circuit_open() {
        let pool = Arc::new(ServerPool::new(0.1));
        pool.add(ServerConfig::new("a", "127.0.0.1", dead_port().await))
            .unwrap();
        let proxy = proxy(Arc::clone(&pool), None);

        let first = proxy.handle(request("10.0.0.1")).await;
        assert_eq!(first.status, StatusCode::BAD_GATEWAY);
        assert_eq!(first.backend_id.as_deref(), Some("a"));

        // Threshold 1: the breaker is now open
        let second = proxy.handle(request("10.0.0.1")).await;
        assert_eq!(second.status, StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = serde_json::from_slice(&second.body).unwrap();
        assert_eq!(body["error"], "Service temporarily unavailable");

        let a = pool.get("a").unwrap();
        assert_eq!(a.active_connections, 0);
        assert_eq!(a.total_requests, 2);
        assert_eq!(a.total_failures, 1);
        assert_eq!(proxy.recorder.len(), 2);
    }

    #[tokio::test]
    async fn test_unhealthy_backend_not_used() {
        let pool = Arc::new(ServerPool::new(0.1));
        pool.add(ServerConfig::new("a", "127.0.0.1", dead_port().await))
            .unwrap();
        pool.set_health("a", Health::Maintenance).unwrap();

        let proxy = proxy(Arc::clone(&pool), None);
        let response = proxy.handle(request("10.0.0.1")).await;
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(pool.get("a").unwrap().total_requests, 0);
    }

    #[tokio::test]
    async fn test_removal_mid_request_leaves_no_backend_state() {
        let pool = Arc::new(ServerPool::new(0.1));
        pool.add(ServerConfig::new("a", "127.0.0.1", slow_backend(Duration::from_millis(300)).await))
            .unwrap();
        let proxy = proxy(Arc::clone(&pool), None);
        let registry = proxy.breakers.clone().unwrap();

        let remove = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            pool.remove("a").unwrap();
            registry.remove("a");
            proxy.recorder.forget_backend("a");
            proxy.metrics.forget_backend("a");
        };
        let (response, ()) = tokio::join!(proxy.handle(request("10.0.0.1")), remove);

        assert_eq!(response.status, StatusCode::OK);
        assert!(!pool.contains("a"));
        assert!(registry.get("a").is_none());
        assert_eq!(proxy.recorder.backend_totals("a"), crate::metrics::BackendTotals::default());
        assert_eq!(proxy.recorder.lifetime().total_requests, 1);

        let text = proxy.metrics.encode().unwrap();
        assert!(!text.contains("backend=\"a\""), "stale series left behind:\n{}", text);
    }

    #[test]
    fn test_breaker_not_recreated_for_removed_backend() {
        let pool = Arc::new(ServerPool::new(0.1));
        pool.add(ServerConfig::new("a", "127.0.0.1", 9000)).unwrap();
        let proxy = proxy(Arc::clone(&pool), None);
        let registry = proxy.breakers.clone().unwrap();

        assert!(proxy.breaker_for(&registry, "a").is_some());
        assert_eq!(registry.len(), 1);

        pool.remove("a").unwrap();
        registry.remove("a");
        assert!(proxy.breaker_for(&registry, "a").is_none());
        assert!(registry.is_empty());
    }
}
