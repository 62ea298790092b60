//! Active health checker.
//!
//! Runs one probe task per backend. Each task sends `GET <health_check_path>`
//! every interval, folds the outcome into its failure streak and applies the
//! resulting transition to the pool in a single locked update.

use crate::backend::{BackendSnapshot, Health, ServerPool};
use crate::config::HealthCheckConfig;
use crate::health::{HealthProbe, ProbeOutcome};
use crate::metrics::MetricsCollector;
use crate::util::ShutdownSignal;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Longest status line we are willing to buffer.
const MAX_STATUS_LINE: usize = 1024;

/// Probe parameters shared by every backend.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub interval: Duration,
    pub timeout: Duration,
    pub expected_status: u16,
    pub unhealthy_threshold: u32,
}

impl From<&HealthCheckConfig> for ProbeSettings {
    fn from(config: &HealthCheckConfig) -> Self {
        Self {
            interval: config.interval,
            timeout: config.timeout,
            expected_status: config.expected_status,
            unhealthy_threshold: config.unhealthy_threshold,
        }
    }
}

/// Reasons a probe fails.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("connection failed: {0}")]
    Connect(std::io::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("probe timed out")]
    Timeout,

    #[error("invalid HTTP response")]
    Malformed,

    #[error("unexpected status: {status} (expected {expected})")]
    UnexpectedStatus { status: u16, expected: u16 },
}

/// Active health checker that probes backend servers.
pub struct HealthChecker {
    pool: Arc<ServerPool>,
    settings: ProbeSettings,
    metrics: MetricsCollector,
    shutdown: ShutdownSignal,
    /// Probe task per backend id.
    tasks: DashMap<String, JoinHandle<()>>,
}

impl HealthChecker {
    /// Create a new health checker.
    pub fn new(
        pool: Arc<ServerPool>,
        settings: ProbeSettings,
        metrics: MetricsCollector,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            pool,
            settings,
            metrics,
            shutdown,
            tasks: DashMap::new(),
        }
    }

    /// Start probing a backend. Replaces any existing probe task for it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn watch(&self, backend_id: &str) {
        let task = tokio::spawn(run_probe_loop(
            Arc::clone(&self.pool),
            self.settings.clone(),
            self.metrics.clone(),
            backend_id.to_string(),
            self.shutdown.subscribe(),
        ));

        if let Some(previous) = self.tasks.insert(backend_id.to_string(), task) {
            previous.abort();
        }
        debug!(backend = %backend_id, interval = ?self.settings.interval, "health probe started");
    }

    /// Stop probing a backend.
    pub fn unwatch(&self, backend_id: &str) {
        if let Some((_, task)) = self.tasks.remove(backend_id) {
            task.abort();
            debug!(backend = %backend_id, "health probe stopped");
        }
    }

    /// Number of backends with a probe task.
    pub fn watched(&self) -> usize {
        self.tasks.len()
    }
}

impl Drop for HealthChecker {
    fn drop(&mut self) {
        for entry in self.tasks.iter() {
            entry.value().abort();
        }
    }
}

/// Probe loop for one backend. Exits when the backend leaves the pool or on
/// shutdown.
async fn run_probe_loop(
    pool: Arc<ServerPool>,
    settings: ProbeSettings,
    metrics: MetricsCollector,
    backend_id: String,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut probe = HealthProbe::new(settings.unhealthy_threshold);
    let mut ticker = interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(server) = pool.get(&backend_id) else {
                    break;
                };

                // A panicking probe must not take the loop down with it
                let check = tokio::spawn(check_backend(server, settings.clone()));
                let outcome = match check.await {
                    Ok(Ok(())) => {
                        debug!(backend = %backend_id, "health check passed");
                        ProbeOutcome::Success
                    }
                    Ok(Err(e)) => {
                        debug!(backend = %backend_id, error = %e, "health check failed");
                        ProbeOutcome::Failure
                    }
                    Err(e) => {
                        error!(backend = %backend_id, error = %e, "health check task failed");
                        continue;
                    }
                };

                let Some(change) = pool.update_health(&backend_id, |current| {
                    probe.record(current, outcome)
                }) else {
                    break;
                };

                match pool.pin(&backend_id) {
                    Some(_pin) => {
                        metrics.record_health_check(&backend_id, outcome == ProbeOutcome::Success);
                        metrics.set_backend_health(&backend_id, change.current);
                    }
                    None => break,
                }

                if change.changed() {
                    match change.current {
                        Health::Unhealthy => warn!(
                            backend = %backend_id,
                            failures = probe.consecutive_failures(),
                            "backend marked unhealthy"
                        ),
                        Health::Healthy => info!(backend = %backend_id, "backend recovered"),
                        _ => {}
                    }
                }
            }

            _ = shutdown.recv() => {
                break;
            }
        }
    }

    debug!(backend = %backend_id, "health probe loop exited");
}

/// Perform a single HTTP health check against a backend.
pub async fn check_backend(
    server: BackendSnapshot,
    settings: ProbeSettings,
) -> Result<(), ProbeError> {
    let status = timeout(
        settings.timeout,
        fetch_status(&server.authority(), &server.host, &server.health_check_path),
    )
    .await
    .map_err(|_| ProbeError::Timeout)??;

    if status == settings.expected_status {
        Ok(())
    } else {
        Err(ProbeError::UnexpectedStatus {
            status,
            expected: settings.expected_status,
        })
    }
}

/// Send `GET path` and return the response status code.
async fn fetch_status(authority: &str, host: &str, path: &str) -> Result<u16, ProbeError> {
    let mut stream = TcpStream::connect(authority)
        .await
        .map_err(ProbeError::Connect)?;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: gatelb-health\r\nConnection: close\r\n\r\n",
        path, host
    );
    stream.write_all(request.as_bytes()).await?;

    // Read until the status line is complete
    let mut buf = Vec::with_capacity(256);
    let mut chunk = [0u8; 512];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(2).any(|w| w == b"\r\n") || buf.len() >= MAX_STATUS_LINE {
            break;
        }
    }

    if buf.is_empty() {
        return Err(ProbeError::Malformed);
    }
    parse_http_status(&String::from_utf8_lossy(&buf))
}

/// Parse HTTP status code from response.
fn parse_http_status(response: &str) -> Result<u16, ProbeError> {
    // Format: "HTTP/1.1 200 OK\r\n..."
    let mut parts = response.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => {
            code.parse().map_err(|_| ProbeError::Malformed)
        }
        _ => Err(ProbeError::Malformed),
    }
}
