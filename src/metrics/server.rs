//! Admin HTTP server.
//!
//! Serves the JSON management API, Prometheus metrics and a liveness probe
//! on a separate listener from the proxy.

use crate::backend::{Health, PoolError};
use crate::balancer::{AdminError, LoadBalancer};
use crate::config::ServerConfig;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Default statistics window in minutes.
const DEFAULT_STATS_WINDOW: u64 = 60;

#[derive(Debug, Deserialize)]
struct AlgorithmBody {
    algorithm: String,
}

#[derive(Debug, Deserialize)]
struct HealthBody {
    health: String,
}

#[derive(Debug, Deserialize)]
struct WeightBody {
    weight: u32,
}

#[derive(Debug, Serialize)]
struct HealthUpdated<'a> {
    id: &'a str,
    previous: Health,
    current: Health,
}

/// Admin and metrics HTTP server.
pub struct AdminServer {
    listener: TcpListener,
    metrics_path: Arc<str>,
    balancer: Arc<LoadBalancer>,
}

impl AdminServer {
    /// Bind the admin listener.
    pub async fn bind(
        address: SocketAddr,
        metrics_path: &str,
        balancer: Arc<LoadBalancer>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        info!(address = %listener.local_addr()?, path = %metrics_path, "admin server bound");

        Ok(Self {
            listener,
            metrics_path: Arc::from(metrics_path),
            balancer,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            let balancer = Arc::clone(&self.balancer);
                            let path = Arc::clone(&self.metrics_path);

                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let balancer = Arc::clone(&balancer);
                                    let path = Arc::clone(&path);
                                    async move { handle_request(req, &balancer, &path).await }
                                });

                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(error = %e, "admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept admin connection");
                        }
                    }
                }

                _ = shutdown.recv() => {
                    info!("admin server shutting down");
                    break;
                }
            }
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    balancer: &LoadBalancer,
    metrics_path: &str,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(error = %e, "failed to read admin request body");
            return Ok(error_json(StatusCode::BAD_REQUEST, "unreadable request body"));
        }
    };

    Ok(route(
        &parts.method,
        parts.uri.path(),
        parts.uri.query(),
        &body,
        balancer,
        metrics_path,
    ))
}

/// Dispatch one admin request.
pub(crate) fn route(
    method: &Method,
    path: &str,
    query: Option<&str>,
    body: &[u8],
    balancer: &LoadBalancer,
    metrics_path: &str,
) -> Response<Full<Bytes>> {
    debug!(path = %path, method = %method, "admin request");

    if path == metrics_path {
        if method != Method::GET {
            return method_not_allowed();
        }
        return match balancer.metrics().encode() {
            Ok(text) => text_response(
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                text,
            ),
            Err(e) => {
                error!(error = %e, "failed to encode metrics");
                error_json(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics")
            }
        };
    }

    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (method, segments.as_slice()) {
        (&Method::GET, ["health"] | ["healthz"]) => {
            text_response(StatusCode::OK, "text/plain", "OK\n".to_string())
        }

        (&Method::GET, ["api", "servers"]) => json_response(StatusCode::OK, &balancer.get_servers()),

        (&Method::POST, ["api", "servers"]) => match serde_json::from_slice::<ServerConfig>(body) {
            Ok(server) => match balancer.add_server(server) {
                Ok(snapshot) => json_response(StatusCode::CREATED, &snapshot),
                Err(e) => admin_error(e),
            },
            Err(e) => error_json(StatusCode::BAD_REQUEST, &format!("invalid server: {}", e)),
        },

        (&Method::DELETE, ["api", "servers", id]) => match balancer.remove_server(id) {
            Ok(snapshot) => json_response(StatusCode::OK, &snapshot),
            Err(e) => admin_error(e),
        },

        (&Method::PUT, ["api", "servers", id, "health"]) => {
            let health = serde_json::from_slice::<HealthBody>(body)
                .map_err(|e| error_json(StatusCode::BAD_REQUEST, &format!("invalid body: {}", e)))
                .and_then(|b| {
                    b.health
                        .parse::<Health>()
                        .map_err(|e| admin_error(AdminError::Pool(e)))
                });
            match health {
                Ok(health) => match balancer.set_health(id, health) {
                    Ok(previous) => json_response(
                        StatusCode::OK,
                        &HealthUpdated {
                            id,
                            previous,
                            current: health,
                        },
                    ),
                    Err(e) => admin_error(e),
                },
                Err(response) => response,
            }
        }

        (&Method::PUT, ["api", "servers", id, "weight"]) => {
            match serde_json::from_slice::<WeightBody>(body) {
                Ok(b) => match balancer.update_weight(id, b.weight) {
                    Ok(()) => json_response(
                        StatusCode::OK,
                        &serde_json::json!({ "id": id, "weight": b.weight }),
                    ),
                    Err(e) => admin_error(e),
                },
                Err(e) => error_json(StatusCode::BAD_REQUEST, &format!("invalid body: {}", e)),
            }
        }

        (&Method::PUT, ["api", "algorithm"]) => match serde_json::from_slice::<AlgorithmBody>(body) {
            Ok(b) => match balancer.set_algorithm(&b.algorithm) {
                Ok(algorithm) => json_response(
                    StatusCode::OK,
                    &serde_json::json!({ "algorithm": algorithm }),
                ),
                Err(e) => admin_error(e),
            },
            Err(e) => error_json(StatusCode::BAD_REQUEST, &format!("invalid body: {}", e)),
        },

        (&Method::GET, ["api", "stats"]) => match stats_window(query) {
            Some(window) => json_response(StatusCode::OK, &balancer.get_stats(window)),
            None => error_json(StatusCode::BAD_REQUEST, "window must be a whole number of minutes"),
        },

        (&Method::GET, ["api", "status"]) => json_response(StatusCode::OK, &balancer.status()),

        (
            _,
            ["health"]
            | ["healthz"]
            | ["api", "servers"]
            | ["api", "stats"]
            | ["api", "status"]
            | ["api", "algorithm"]
            | ["api", "servers", _]
            | ["api", "servers", _, "health" | "weight"],
        ) => method_not_allowed(),

        _ => error_json(StatusCode::NOT_FOUND, "not found"),
    }
}

/// Parse `window=<minutes>` from the query string.
fn stats_window(query: Option<&str>) -> Option<u64> {
    let Some(query) = query else {
        return Some(DEFAULT_STATS_WINDOW);
    };

    match query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "window")
    {
        Some((_, value)) => value.parse().ok(),
        None => Some(DEFAULT_STATS_WINDOW),
    }
}

fn admin_error(error: AdminError) -> Response<Full<Bytes>> {
    let status = match &error {
        AdminError::Pool(PoolError::NotFound(_)) => StatusCode::NOT_FOUND,
        AdminError::Pool(PoolError::DuplicateBackend(_)) => StatusCode::CONFLICT,
        _ => StatusCode::BAD_REQUEST,
    };
    error_json(status, &error.to_string())
}

fn json_response<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => with_content_type(status, "application/json", Bytes::from(body)),
        Err(e) => {
            error!(error = %e, "failed to serialize admin response");
            with_content_type(
                StatusCode::INTERNAL_SERVER_ERROR,
                "application/json",
                Bytes::from_static(b"{\"error\":\"serialization failed\"}"),
            )
        }
    }
}

fn error_json(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, &serde_json::json!({ "error": message }))
}

fn method_not_allowed() -> Response<Full<Bytes>> {
    error_json(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}

fn text_response(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    with_content_type(status, content_type, Bytes::from(body))
}

fn with_content_type(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Algorithm, Config};
    use crate::util::ShutdownSignal;

    fn balancer() -> LoadBalancer {
        let config = Config {
            servers: vec![
                ServerConfig::new("a", "127.0.0.1", 9000),
                ServerConfig::new("b", "127.0.0.1", 9001),
            ],
            ..Config::default()
        };
        LoadBalancer::new(&config, ShutdownSignal::new()).unwrap()
    }

    async fn body_json(response: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn call(lb: &LoadBalancer, method: Method, path: &str, body: &str) -> Response<Full<Bytes>> {
        let (path, query) = match path.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (path, None),
        };
        route(&method, path, query, body.as_bytes(), lb, "/metrics")
    }

    #[tokio::test]
    async fn test_list_servers() {
        let lb = balancer();
        let response = call(&lb, Method::GET, "/api/servers", "");
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json.as_array().unwrap().len(), 2);
        assert_eq!(json[0]["id"], "a");
        assert_eq!(json[0]["health"], "healthy");
        assert_eq!(json[0]["active_connections"], 0);
    }

    #[tokio::test]
    async fn test_add_and_remove_server() {
        let lb = balancer();
        let body = r#"{"id": "c", "host": "127.0.0.1", "port": 9002, "weight": 3, "timeout": "2s"}"#;

        let response = call(&lb, Method::POST, "/api/servers", body);
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(body_json(response).await["weight"], 3);

        let dup = call(&lb, Method::POST, "/api/servers", body);
        assert_eq!(dup.status(), StatusCode::CONFLICT);

        assert_eq!(call(&lb, Method::DELETE, "/api/servers/c", "").status(), StatusCode::OK);
        assert_eq!(
            call(&lb, Method::DELETE, "/api/servers/c", "").status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_invalid_server_rejected() {
        let lb = balancer();
        let response = call(
            &lb,
            Method::POST,
            "/api/servers",
            r#"{"id": "c", "host": "127.0.0.1", "port": 9002, "scheme": "https"}"#,
        );
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("plain http"));
    }

    #[tokio::test]
    async fn test_set_algorithm() {
        let lb = balancer();
        let ok = call(&lb, Method::PUT, "/api/algorithm", r#"{"algorithm": "ip_hash"}"#);
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(body_json(ok).await["algorithm"], "ip_hash");

        let bad = call(&lb, Method::PUT, "/api/algorithm", r#"{"algorithm": "fastest"}"#);
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
        assert_eq!(lb.algorithm(), Algorithm::IpHash);
    }

    #[tokio::test]
    async fn test_health_and_weight_overrides() {
        let lb = balancer();
        let response = call(&lb, Method::PUT, "/api/servers/a/health", r#"{"health": "maintenance"}"#);
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["previous"], "healthy");
        assert_eq!(json["current"], "maintenance");

        let bad = call(&lb, Method::PUT, "/api/servers/a/health", r#"{"health": "sleepy"}"#);
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let weight = call(&lb, Method::PUT, "/api/servers/b/weight", r#"{"weight": 4}"#);
        assert_eq!(weight.status(), StatusCode::OK);
        assert_eq!(lb.pool().get("b").unwrap().weight, 4);

        let zero = call(&lb, Method::PUT, "/api/servers/b/weight", r#"{"weight": 0}"#);
        assert_eq!(zero.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stats_and_status() {
        let lb = balancer();
        let stats = call(&lb, Method::GET, "/api/stats?window=5", "");
        assert_eq!(stats.status(), StatusCode::OK);
        assert_eq!(body_json(stats).await["total_requests"], 0);

        let bad = call(&lb, Method::GET, "/api/stats?window=soon", "");
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let status = body_json(call(&lb, Method::GET, "/api/status", "")).await;
        assert_eq!(status["total_servers"], 2);
        assert_eq!(status["algorithm"], "round_robin");
    }

    #[tokio::test]
    async fn test_metrics_and_health_endpoints() {
        let lb = balancer();
        let metrics = call(&lb, Method::GET, "/metrics", "");
        assert_eq!(metrics.status(), StatusCode::OK);
        let text = metrics.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&text).contains("gatelb_backend_health"));

        assert_eq!(call(&lb, Method::GET, "/health", "").status(), StatusCode::OK);
        assert_eq!(call(&lb, Method::POST, "/metrics", "").status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(call(&lb, Method::POST, "/api/status", "").status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(call(&lb, Method::GET, "/nope", "").status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_stats_window() {
        assert_eq!(stats_window(None), Some(60));
        assert_eq!(stats_window(Some("window=15")), Some(15));
        assert_eq!(stats_window(Some("x=1&window=2")), Some(2));
        assert_eq!(stats_window(Some("x=1")), Some(60));
        assert_eq!(stats_window(Some("window=-1")), None);
    }
}
