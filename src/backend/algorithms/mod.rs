//! Load balancing algorithms.
//!
//! Every algorithm picks from a snapshot of the healthy backends, in pool
//! insertion order. Empty input yields `None`.

mod ip_hash;
mod least_conn;
mod least_time;
mod random;
mod round_robin;
mod weighted;

pub use ip_hash::IpHash;
pub use least_conn::LeastConnections;
pub use least_time::LeastResponseTime;
pub use random::Random;
pub use round_robin::RoundRobin;
pub use weighted::WeightedRoundRobin;

use crate::backend::BackendSnapshot;
use crate::config::Algorithm;
use rand::seq::SliceRandom;
use std::net::IpAddr;

/// Trait for load balancing algorithms.
pub trait LoadBalancer: Send + Sync {
    /// Select the next backend server.
    ///
    /// # Arguments
    ///
    /// * `servers` - Available healthy servers
    /// * `client_ip` - Client's address (for IP hash)
    ///
    /// # Returns
    ///
    /// The selected server, or None if no servers available.
    fn select<'a>(
        &self,
        servers: &'a [BackendSnapshot],
        client_ip: Option<IpAddr>,
    ) -> Option<&'a BackendSnapshot>;
}

/// Build a fresh instance of the given algorithm.
pub fn build(algorithm: Algorithm) -> Box<dyn LoadBalancer> {
    match algorithm {
        Algorithm::RoundRobin => Box::new(RoundRobin::new()),
        Algorithm::LeastConnections => Box::new(LeastConnections::new()),
        Algorithm::WeightedRoundRobin => Box::new(WeightedRoundRobin::new()),
        Algorithm::LeastResponseTime => Box::new(LeastResponseTime::new()),
        Algorithm::IpHash => Box::new(IpHash::new()),
        Algorithm::Random => Box::new(Random::new()),
    }
}

/// Uniform random choice among the servers that minimise `key`.
fn choose_min_by<'a, F>(servers: &'a [BackendSnapshot], key: F) -> Option<&'a BackendSnapshot>
where
    F: Fn(&BackendSnapshot) -> f64,
{
    let min = servers
        .iter()
        .map(&key)
        .fold(f64::INFINITY, f64::min);

    let candidates: Vec<&BackendSnapshot> =
        servers.iter().filter(|s| key(s) == min).collect();

    candidates.choose(&mut rand::thread_rng()).copied()
}


#[cfg(test)]
mod tests {
    use super::test_support::servers;
    use super::*;

    #[test]
    fn test_every_algorithm_handles_empty_input() {
        for algorithm in Algorithm::ALL {
            let lb = build(algorithm);
            assert!(lb.select(&[], None).is_none(), "{algorithm} returned a server");
        }
    }

    #[test]
    fn test_every_algorithm_picks_sole_server() {
        let list = servers(&["only"]);
        let ip = Some("10.1.2.3".parse().unwrap());
        for algorithm in Algorithm::ALL {
            let lb = build(algorithm);
            assert_eq!(lb.select(&list, ip).unwrap().id, "only");
        }
    }

    #[test]
    fn test_choose_min_by_only_returns_minimum() {
        let mut list = servers(&["a", "b", "c"]);
        list[0].active_connections = 2;
        list[1].active_connections = 1;
        list[2].active_connections = 1;

        for _ in 0..50 {
            let picked = choose_min_by(&list, |s| s.active_connections as f64).unwrap();
            assert_ne!(picked.id, "a");
        }
    }
}
