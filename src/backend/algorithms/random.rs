//! Uniform random selection.

use super::LoadBalancer;
use crate::backend::BackendSnapshot;
use rand::seq::SliceRandom;
use std::net::IpAddr;

pub struct Random;

impl Random {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Random {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for Random {
    fn select<'a>(
        &self,
        servers: &'a [BackendSnapshot],
        _client_ip: Option<IpAddr>,
    ) -> Option<&'a BackendSnapshot> {
        servers.choose(&mut rand::thread_rng())
    }
}
