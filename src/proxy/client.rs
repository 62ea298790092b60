//! Outbound HTTP/1.1 client.
//!
//! Opens one connection per forwarded request, sends the buffered request
//! and buffers the full response. Redirects are returned as-is.

use crate::backend::BackendSnapshot;
use crate::proxy::ProxyRequest;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Connection-scoped headers that must not be forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Transport-level failures talking to a backend.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to backend: {0}")]
    Connect(#[source] std::io::Error),

    #[error("backend handshake failed: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("failed to send request to backend: {0}")]
    Send(#[source] hyper::Error),

    #[error("failed to read backend response: {0}")]
    Body(#[source] hyper::Error),

    #[error("backend did not respond within {0:?}")]
    Timeout(Duration),

    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),
}

/// A fully buffered backend response.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Forward a request to a backend within the backend's timeout.
pub async fn forward(
    backend: &BackendSnapshot,
    request: &ProxyRequest,
) -> Result<UpstreamResponse, TransportError> {
    let upstream = build_upstream_request(backend, request)?;

    match timeout(backend.timeout, send(backend, upstream)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(backend.timeout)),
    }
}

async fn send(
    backend: &BackendSnapshot,
    request: Request<Full<Bytes>>,
) -> Result<UpstreamResponse, TransportError> {
    let stream = TcpStream::connect(backend.authority())
        .await
        .map_err(TransportError::Connect)?;
    let _ = stream.set_nodelay(true);

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(TransportError::Handshake)?;

    // Spawn connection driver
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "backend connection closed with error");
        }
    });

    let response = sender
        .send_request(request)
        .await
        .map_err(TransportError::Send)?;

    let (parts, body) = response.into_parts();
    let body = body
        .collect()
        .await
        .map_err(TransportError::Body)?
        .to_bytes();

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);

    Ok(UpstreamResponse {
        status: parts.status,
        headers,
        body,
    })
}

/// Build the outbound request: original method, path, query and body, plus
/// forwarding headers.
pub fn build_upstream_request(
    backend: &BackendSnapshot,
    request: &ProxyRequest,
) -> Result<Request<Full<Bytes>>, TransportError> {
    let mut headers = request.headers.clone();
    strip_hop_by_hop(&mut headers);

    if !headers.contains_key(HOST) {
        let host = HeaderValue::from_str(&backend.authority())
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        headers.insert(HOST, host);
    }

    if let Some(ip) = request.client_ip {
        let chain = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(existing) if !existing.trim().is_empty() => format!("{}, {}", existing, ip),
            _ => ip.to_string(),
        };
        match HeaderValue::from_str(&chain) {
            Ok(value) => {
                headers.insert(HeaderName::from_static(X_FORWARDED_FOR), value);
            }
            Err(e) => warn!(error = %e, "dropping malformed x-forwarded-for chain"),
        }
    }
    headers.insert(
        HeaderName::from_static(X_FORWARDED_PROTO),
        HeaderValue::from_static("http"),
    );

    let mut upstream = Request::builder()
        .method(request.method.clone())
        .uri(request.path_and_query.as_str())
        .body(Full::new(request.body.clone()))
        .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
    *upstream.headers_mut() = headers;

    Ok(upstream)
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named by Connection are connection-scoped too
    let named: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}
