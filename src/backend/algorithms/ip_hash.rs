//! IP hash load balancing algorithm.

use super::LoadBalancer;
use crate::backend::BackendSnapshot;
use rand::seq::SliceRandom;
use std::net::IpAddr;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// IP hash load balancer.
///
/// Routes requests from the same client IP to the same position in the
/// healthy list for as long as membership does not change. Requests with
/// no client IP get a random server.
pub struct IpHash;

impl IpHash {
    /// Create a new IP hash load balancer.
    pub fn new() -> Self {
        Self
    }
}

impl Default for IpHash {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for IpHash {
    fn select<'a>(
        &self,
        servers: &'a [BackendSnapshot],
        client_ip: Option<IpAddr>,
    ) -> Option<&'a BackendSnapshot> {
        if servers.is_empty() {
            return None;
        }

        match client_ip {
            Some(ip) => {
                let idx = fnv1a(ip.to_string().as_bytes()) % servers.len() as u64;
                Some(&servers[idx as usize])
            }
            None => servers.choose(&mut rand::thread_rng()),
        }
    }
}

/// 64-bit FNV-1a; stable across processes and releases.
pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
