//! Round-robin load balancing algorithm.

use super::LoadBalancer;
use crate::backend::BackendSnapshot;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Round-robin load balancer.
///
/// One cursor shared by all callers; each selection is a single atomic
/// increment, so no two concurrent callers use the same cursor value.
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    /// Create a new round-robin load balancer.
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }

    /// Pick the next server in order.
    pub fn next<'a>(&self, servers: &'a [BackendSnapshot]) -> Option<&'a BackendSnapshot> {
        if servers.is_empty() {
            return None;
        }

        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % servers.len();
        Some(&servers[idx])
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for RoundRobin {
    fn select<'a>(
        &self,
        servers: &'a [BackendSnapshot],
        _client_ip: Option<IpAddr>,
    ) -> Option<&'a BackendSnapshot> {
        self.next(servers)
    }
}
