//! Configuration data types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// Address the proxy listens on
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Admin / metrics endpoint
    #[serde(default)]
    pub admin: AdminConfig,

    /// Initial load balancing algorithm
    #[serde(default)]
    pub algorithm: Algorithm,

    /// Active health checking
    #[serde(default)]
    pub health_check: HealthCheckConfig,

    /// Per-backend circuit breaking
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Per-client admission control
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Sticky sessions
    #[serde(default)]
    pub session_affinity: SessionAffinityConfig,

    /// Request sample retention and aggregation
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Backend servers registered at startup
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            global: GlobalConfig::default(),
            listen: default_listen(),
            admin: AdminConfig::default(),
            algorithm: Algorithm::default(),
            health_check: HealthCheckConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            session_affinity: SessionAffinityConfig::default(),
            metrics: MetricsConfig::default(),
            servers: Vec::new(),
        }
    }
}

/// Global configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Json,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Admin endpoint configuration (JSON API and Prometheus exposition).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdminConfig {
    /// Whether the admin endpoint is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address to bind the admin server
    #[serde(default = "default_admin_address")]
    pub address: SocketAddr,

    /// Path for Prometheus metrics
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_admin_address(),
            metrics_path: default_metrics_path(),
        }
    }
}

/// Load balancing algorithm.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
    LeastResponseTime,
    IpHash,
    Random,
}

impl Algorithm {
    /// All algorithms, in documentation order.
    pub const ALL: [Algorithm; 6] = [
        Algorithm::RoundRobin,
        Algorithm::LeastConnections,
        Algorithm::WeightedRoundRobin,
        Algorithm::LeastResponseTime,
        Algorithm::IpHash,
        Algorithm::Random,
    ];

    /// The configuration / admin API name of this algorithm.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::RoundRobin => "round_robin",
            Algorithm::LeastConnections => "least_connections",
            Algorithm::WeightedRoundRobin => "weighted_round_robin",
            Algorithm::LeastResponseTime => "least_response_time",
            Algorithm::IpHash => "ip_hash",
            Algorithm::Random => "random",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an algorithm name that is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown algorithm '{0}'")]
pub struct UnknownAlgorithm(pub String);

impl FromStr for Algorithm {
    type Err = UnknownAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Algorithm::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| UnknownAlgorithm(s.to_string()))
    }
}

/// Active health check settings shared by every backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    /// Whether probes run at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often to probe each backend
    #[serde(default = "default_health_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Timeout for a single probe
    #[serde(default = "default_health_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Expected HTTP status code
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,

    /// Consecutive failures before marking unhealthy
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            expected_status: default_expected_status(),
            unhealthy_threshold: default_unhealthy_threshold(),
        }
    }
}

/// Circuit breaker settings applied to every backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Consecutive failures that trip the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Cooldown before a trial call is allowed
    #[serde(default = "default_recovery_timeout", with = "humantime_serde")]
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            recovery_timeout: default_recovery_timeout(),
        }
    }
}

/// Sliding-window rate limit settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Requests allowed per client within the window
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,

    /// Window length
    #[serde(default = "default_rate_window", with = "humantime_serde")]
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: default_max_requests(),
            window: default_rate_window(),
        }
    }
}

/// Session affinity (sticky session) settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionAffinityConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Cookie carrying the session identifier
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// Lifetime of the cookie and of the affinity entry
    #[serde(default = "default_session_ttl", with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for SessionAffinityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cookie_name: default_cookie_name(),
            ttl: default_session_ttl(),
        }
    }
}

/// Request metrics settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Number of recent request samples retained
    #[serde(default = "default_sample_capacity")]
    pub capacity: usize,

    /// Smoothing factor for the response time estimate
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,

    /// Period of the background maintenance loop
    #[serde(default = "default_maintenance_interval", with = "humantime_serde")]
    pub maintenance_interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            capacity: default_sample_capacity(),
            ema_alpha: default_ema_alpha(),
            maintenance_interval: default_maintenance_interval(),
        }
    }
}

/// URL scheme of a backend server.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => f.write_str("http"),
            Scheme::Https => f.write_str("https"),
        }
    }
}

/// Individual backend server configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ServerConfig {
    /// Unique server id
    pub id: String,

    /// Hostname or IP address
    pub host: String,

    /// TCP port
    pub port: u16,

    /// URL scheme
    #[serde(default)]
    pub scheme: Scheme,

    /// Weight for weighted load balancing (default: 1)
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Path probed by the health checker
    #[serde(default = "default_health_path")]
    pub health_check_path: String,

    /// Timeout for proxied requests
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl ServerConfig {
    /// Build a server description with default scheme, weight, path and timeout.
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            scheme: Scheme::Http,
            weight: default_weight(),
            health_check_path: default_health_path(),
            timeout: default_request_timeout(),
        }
    }

    /// Set the weight.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the health check path.
    pub fn with_health_check_path(mut self, path: impl Into<String>) -> Self {
        self.health_check_path = path.into();
        self
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_true() -> bool {
    true
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_admin_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_health_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_expected_status() -> u16 {
    200
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_max_requests() -> usize {
    1000
}

fn default_rate_window() -> Duration {
    Duration::from_secs(3600)
}

fn default_cookie_name() -> String {
    "session_id".to_string()
}

fn default_session_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_sample_capacity() -> usize {
    1000
}

fn default_ema_alpha() -> f64 {
    0.1
}

fn default_maintenance_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_weight() -> u32 {
    1
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Custom serde module for humantime durations.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
