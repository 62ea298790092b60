//! Frontend listener implementation.

use crate::balancer::LoadBalancer;
use crate::frontend::SessionCookie;
use crate::proxy::{ProxyRequest, ProxyResponse};
use crate::util::generate_session_id;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE, SET_COOKIE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Frontend listener that accepts and handles connections.
pub struct FrontendListener {
    listener: TcpListener,
    balancer: Arc<LoadBalancer>,
    session: Option<Arc<SessionCookie>>,
}

impl FrontendListener {
    /// Bind the listening socket.
    pub async fn bind(
        address: SocketAddr,
        balancer: Arc<LoadBalancer>,
        session: Option<SessionCookie>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        info!(listen = %listener.local_addr()?, sticky = session.is_some(), "frontend listener bound");

        Ok(Self {
            listener,
            balancer,
            session: session.map(Arc::new),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the listener, accepting connections until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => self.handle_connection(stream, addr),
                        Err(e) => error!(error = %e, "failed to accept connection"),
                    }
                }

                _ = shutdown.recv() => {
                    info!("frontend listener shutting down");
                    break;
                }
            }
        }
    }

    fn handle_connection(&self, stream: TcpStream, client_addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY on client connection");
        }

        let balancer = Arc::clone(&self.balancer);
        let session = self.session.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let balancer = Arc::clone(&balancer);
                let session = session.clone();
                async move { handle_request(req, client_addr, &balancer, session.as_deref()).await }
            });

            // Serve HTTP/1.1 with keep-alive support
            if let Err(e) = http1::Builder::new()
                .keep_alive(true)
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(client = %client_addr, error = %e, "client connection error");
            }
        });
    }
}

/// Buffer one request, run it through the balancer and build the response.
async fn handle_request(
    req: Request<Incoming>,
    client_addr: SocketAddr,
    balancer: &LoadBalancer,
    session: Option<&SessionCookie>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(client = %client_addr, error = %e, "failed to read request body");
            return Ok(bad_request());
        }
    };

    // Reuse the caller's session or start a new one
    let (session_id, new_session) = match session {
        Some(cookie) => match cookie.extract(&parts.headers) {
            Some(id) => (Some(id), false),
            None => (Some(generate_session_id()), true),
        },
        None => (None, false),
    };

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let request = ProxyRequest {
        method: parts.method,
        path_and_query,
        headers: parts.headers,
        body,
        client_ip: Some(client_addr.ip()),
        session_id: session_id.clone(),
    };

    let mut response = into_http_response(balancer.handle(request).await);

    if let (Some(cookie), Some(id), true) = (session, session_id.as_deref(), new_session) {
        if let Some(value) = cookie.set_cookie(id) {
            response.headers_mut().append(SET_COOKIE, value);
        }
    }

    Ok(response)
}

fn into_http_response(proxied: ProxyResponse) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(proxied.body));
    *response.status_mut() = proxied.status;
    *response.headers_mut() = proxied.headers;
    response
}

fn bad_request() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(b"{\"error\":\"Bad Request\"}")));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::util::ShutdownSignal;
    use hyper::HeaderMap;

    #[tokio::test]
    async fn test_frontend_listener_bind() {
        let balancer = Arc::new(LoadBalancer::new(&Config::default(), ShutdownSignal::new()).unwrap());
        let listener = FrontendListener::bind("127.0.0.1:0".parse().unwrap(), balancer, None)
            .await
            .unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_into_http_response() {
        let mut headers = HeaderMap::new();
        headers.insert("x-served-by", HeaderValue::from_static("a"));
        let response = into_http_response(ProxyResponse {
            status: StatusCode::CREATED,
            headers,
            body: Bytes::from_static(b"done"),
            backend_id: Some("a".to_string()),
        });

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-served-by"], "a");
    }

    #[test]
    fn test_bad_request_body() {
        let response = bad_request();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
    }
}
