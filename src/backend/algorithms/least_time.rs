//! Least-response-time load balancing algorithm.

use super::{choose_min_by, LoadBalancer, RoundRobin};
use crate::backend::BackendSnapshot;
use std::net::IpAddr;

/// Picks the backend with the lowest smoothed response time.
///
/// Only backends with at least one latency sample compete. Until any
/// backend has been sampled, selection falls back to round robin on a
/// cursor of its own.
pub struct LeastResponseTime {
    fallback: RoundRobin,
}

impl LeastResponseTime {
    pub fn new() -> Self {
        Self {
            fallback: RoundRobin::new(),
        }
    }
}

impl Default for LeastResponseTime {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for LeastResponseTime {
    fn select<'a>(
        &self,
        servers: &'a [BackendSnapshot],
        _client_ip: Option<IpAddr>,
    ) -> Option<&'a BackendSnapshot> {
        if !servers.iter().any(|s| s.response_time_ms > 0.0) {
            return self.fallback.next(servers);
        }

        // Unsampled backends sort last
        choose_min_by(servers, |s| {
            if s.response_time_ms > 0.0 {
                s.response_time_ms
            } else {
                f64::INFINITY
            }
        })
    }
}
