//! Configuration validation.

use crate::config::{Config, Scheme, ServerConfig};
use std::collections::HashSet;

/// Validate the configuration.
///
/// Checks for:
/// - Unique, non-empty server ids
/// - Server weights, ports, schemes and health check paths
/// - Sensible health check, circuit breaker, rate limit and metrics settings
/// - A known log level
///
/// # Returns
///
/// `Ok(())` if valid, or an error message describing every problem found.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    // Check for unique server ids
    let mut server_ids = HashSet::new();
    for server in &config.servers {
        if !server_ids.insert(server.id.as_str()) {
            errors.push(format!("duplicate server id: {}", server.id));
        }
        if let Err(e) = validate_server(server) {
            errors.push(e);
        }
    }

    let hc = &config.health_check;
    if hc.unhealthy_threshold == 0 {
        errors.push("health_check.unhealthy_threshold must be >= 1".to_string());
    }
    if hc.interval.is_zero() {
        errors.push("health_check.interval must be greater than zero".to_string());
    }
    if hc.timeout.is_zero() {
        errors.push("health_check.timeout must be greater than zero".to_string());
    }

    if config.circuit_breaker.failure_threshold == 0 {
        errors.push("circuit_breaker.failure_threshold must be >= 1".to_string());
    }

    if config.rate_limit.max_requests == 0 {
        errors.push("rate_limit.max_requests must be >= 1".to_string());
    }
    if config.rate_limit.window.is_zero() {
        errors.push("rate_limit.window must be greater than zero".to_string());
    }

    if config.session_affinity.cookie_name.is_empty() {
        errors.push("session_affinity.cookie_name cannot be empty".to_string());
    }

    let alpha = config.metrics.ema_alpha;
    if !(alpha > 0.0 && alpha <= 1.0) {
        errors.push(format!("metrics.ema_alpha {} must be in (0, 1]", alpha));
    }
    if config.metrics.capacity == 0 {
        errors.push("metrics.capacity must be >= 1".to_string());
    }
    if config.metrics.maintenance_interval.is_zero() {
        errors.push("metrics.maintenance_interval must be greater than zero".to_string());
    }

    if !config.admin.metrics_path.starts_with('/') {
        errors.push(format!(
            "admin.metrics_path '{}' must start with '/'",
            config.admin.metrics_path
        ));
    }

    // Validate log level
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.global.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.global.log_level,
            valid_levels.join(", ")
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

/// Validate a single server description.
///
/// Used both for servers listed in the configuration file and for servers
/// registered at runtime through the admin API.
pub fn validate_server(server: &ServerConfig) -> Result<(), String> {
    let mut errors = Vec::new();

    if server.id.is_empty() {
        errors.push("server id cannot be empty".to_string());
    }
    if server.host.is_empty() {
        errors.push(format!("server '{}' has an empty host", server.id));
    }
    if server.port == 0 {
        errors.push(format!("server '{}' has port 0", server.id));
    }
    if server.weight == 0 {
        errors.push(format!(
            "server '{}' has weight 0 (must be >= 1)",
            server.id
        ));
    }
    if server.scheme == Scheme::Https {
        errors.push(format!(
            "server '{}' uses https, only plain http upstreams are supported",
            server.id
        ));
    }
    if !server.health_check_path.starts_with('/') {
        errors.push(format!(
            "server '{}' health check path '{}' must start with '/'",
            server.id, server.health_check_path
        ));
    }
    if server.timeout.is_zero() {
        errors.push(format!("server '{}' has a zero timeout", server.id));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}
