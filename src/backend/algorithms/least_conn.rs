//! Least-connections load balancing algorithm.

use super::{choose_min_by, LoadBalancer};
use crate::backend::BackendSnapshot;
use std::net::IpAddr;

/// Least-connections load balancer.
///
/// Sends requests to the server with the fewest active connections.
/// Breaks ties with a uniform random choice so that idle servers do not
/// all funnel onto the first one in the list.
pub struct LeastConnections;

impl LeastConnections {
    /// Create a new least-connections load balancer.
    pub fn new() -> Self {
        Self
    }
}

impl Default for LeastConnections {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for LeastConnections {
    fn select<'a>(
        &self,
        servers: &'a [BackendSnapshot],
        _client_ip: Option<IpAddr>,
    ) -> Option<&'a BackendSnapshot> {
        choose_min_by(servers, |s| f64::from(s.active_connections))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::algorithms::test_support::servers;
    use std::collections::HashSet;

    #[test]
    fn test_least_conn_selects_lowest() {
        let lc = LeastConnections::new();
        let mut servers = servers(&["a", "b", "c"]);
        servers[0].active_connections = 2;
        servers[1].active_connections = 1;

        // Server c has 0 connections, should be selected
        let selected = lc.select(&servers, None).unwrap();
        assert_eq!(selected.id, "c");
    }

    #[test]
    fn test_least_conn_never_above_minimum() {
        let lc = LeastConnections::new();
        let mut servers = servers(&["a", "b", "c", "d"]);
        servers[0].active_connections = 3;
        servers[1].active_connections = 1;
        servers[2].active_connections = 1;
        servers[3].active_connections = 7;

        for _ in 0..200 {
            let selected = lc.select(&servers, None).unwrap();
            assert_eq!(selected.active_connections, 1);
        }
    }

    #[test]
    fn test_least_conn_spreads_ties() {
        let lc = LeastConnections::new();
        let servers = servers(&["a", "b", "c"]);

        // All idle: random tie-break should reach every server eventually
        let seen: HashSet<_> = (0..300)
            .map(|_| lc.select(&servers, None).unwrap().id.clone())
            .collect();
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_least_conn_empty() {
        let lc = LeastConnections::new();
        assert!(lc.select(&[], None).is_none());
    }
}
