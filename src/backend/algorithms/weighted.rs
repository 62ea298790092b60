//! Weighted round-robin load balancing algorithm.

use super::LoadBalancer;
use crate::backend::BackendSnapshot;
use rand::Rng;
use std::net::IpAddr;

/// Weighted load balancer.
///
/// Draws a uniform integer in `[1, total_weight]` and returns the first
/// server whose cumulative weight reaches the draw, so each server receives
/// traffic in proportion to its weight. Zero-weight servers are never picked.
pub struct WeightedRoundRobin;

impl WeightedRoundRobin {
    /// Create a new weighted load balancer.
    pub fn new() -> Self {
        Self
    }

    /// Map a draw in `[1, total_weight]` onto a server.
    fn pick_for_draw(servers: &[BackendSnapshot], draw: u64) -> Option<&BackendSnapshot> {
        let mut cumulative = 0u64;
        for server in servers {
            cumulative += u64::from(server.weight);
            if server.weight > 0 && cumulative >= draw {
                return Some(server);
            }
        }
        None
    }
}

impl Default for WeightedRoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for WeightedRoundRobin {
    fn select<'a>(
        &self,
        servers: &'a [BackendSnapshot],
        _client_ip: Option<IpAddr>,
    ) -> Option<&'a BackendSnapshot> {
        let total_weight: u64 = servers.iter().map(|s| u64::from(s.weight)).sum();
        if total_weight == 0 {
            return None;
        }

        let draw = rand::thread_rng().gen_range(1..=total_weight);
        Self::pick_for_draw(servers, draw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::algorithms::test_support::server;

    #[test]
    fn test_draw_mapping() {
        let servers = vec![server("a", 1), server("b", 3)];

        assert_eq!(WeightedRoundRobin::pick_for_draw(&servers, 1).unwrap().id, "a");
        assert_eq!(WeightedRoundRobin::pick_for_draw(&servers, 2).unwrap().id, "b");
        assert_eq!(WeightedRoundRobin::pick_for_draw(&servers, 4).unwrap().id, "b");
        assert!(WeightedRoundRobin::pick_for_draw(&servers, 5).is_none());
    }

    #[test]
    fn test_zero_weight_unreachable() {
        let servers = vec![server("zero", 0), server("b", 2)];
        let wrr = WeightedRoundRobin::new();

        for _ in 0..200 {
            assert_eq!(wrr.select(&servers, None).unwrap().id, "b");
        }
        assert!(wrr.select(&[server("zero", 0)], None).is_none());
    }

    #[test]
    fn test_weighted_distribution() {
        let servers = vec![server("a", 1), server("b", 3)];
        let wrr = WeightedRoundRobin::new();

        let mut a = 0;
        let mut b = 0;
        for _ in 0..4000 {
            match wrr.select(&servers, None).unwrap().id.as_str() {
                "a" => a += 1,
                _ => b += 1,
            }
        }

        // With 1:3 weights, expect ~1000 / ~3000 within 5% of the draws
        assert!((800..=1200).contains(&a), "a = {a}");
        assert!((2800..=3200).contains(&b), "b = {b}");
    }
}
