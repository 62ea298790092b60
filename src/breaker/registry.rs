//! Breakers keyed by backend id.

use crate::breaker::{CircuitBreaker, CircuitSnapshot};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// Per-backend breakers sharing one configuration. Entries are created when
/// a backend joins the pool and dropped when it leaves.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    failure_threshold: u32,
    recovery_timeout: Duration,
}

impl BreakerRegistry {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            breakers: DashMap::new(),
            failure_threshold,
            recovery_timeout,
        }
    }

    /// The breaker for a backend, created closed if missing.
    pub fn get_or_insert(&self, backend_id: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(backend_id) {
            return Arc::clone(&breaker);
        }

        let entry = self
            .breakers
            .entry(backend_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    backend_id,
                    self.failure_threshold,
                    self.recovery_timeout,
                ))
            });
        Arc::clone(&entry)
    }

    pub fn get(&self, backend_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(backend_id).map(|b| Arc::clone(&b))
    }

    pub fn remove(&self, backend_id: &str) -> bool {
        self.breakers.remove(backend_id).is_some()
    }

    /// Snapshot of every breaker.
    pub fn snapshots(&self) -> Vec<(String, CircuitSnapshot)> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
