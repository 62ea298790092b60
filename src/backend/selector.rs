//! Backend selection.
//!
//! Combines the active algorithm with the optional session affinity table.
//! The algorithm can be swapped at runtime without blocking selections.

use crate::backend::algorithms::{self, LoadBalancer};
use crate::backend::{BackendSnapshot, SessionAffinityTable};
use crate::config::Algorithm;
use arc_swap::ArcSwap;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors returned by selection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectError {
    #[error("no healthy backend available")]
    NoHealthyBackend,
}

/// An algorithm instance together with its name.
struct ActiveAlgorithm {
    kind: Algorithm,
    balancer: Box<dyn LoadBalancer>,
}

/// Picks a backend for each request.
pub struct Selector {
    active: ArcSwap<ActiveAlgorithm>,
    affinity: Option<SessionAffinityTable>,
}

impl Selector {
    /// Create a selector. Pass an affinity table to enable sticky sessions.
    pub fn new(algorithm: Algorithm, affinity: Option<SessionAffinityTable>) -> Self {
        Self {
            active: ArcSwap::from_pointee(ActiveAlgorithm {
                kind: algorithm,
                balancer: algorithms::build(algorithm),
            }),
            affinity,
        }
    }

    /// The algorithm currently in use.
    pub fn algorithm(&self) -> Algorithm {
        self.active.load().kind
    }

    /// Swap the active algorithm. The new instance starts with fresh state.
    pub fn set_algorithm(&self, algorithm: Algorithm) {
        let previous = self.active.swap(Arc::new(ActiveAlgorithm {
            kind: algorithm,
            balancer: algorithms::build(algorithm),
        }));
        info!(from = %previous.kind, to = %algorithm, "load balancing algorithm changed");
    }

    pub fn affinity(&self) -> Option<&SessionAffinityTable> {
        self.affinity.as_ref()
    }

    /// Pick a backend from the healthy set.
    ///
    /// A live session mapping to a backend still in `healthy` wins; otherwise
    /// the algorithm runs and, if a session id was given, the choice is
    /// recorded for it.
    pub fn pick(
        &self,
        healthy: &[BackendSnapshot],
        client_ip: Option<IpAddr>,
        session_id: Option<&str>,
    ) -> Result<BackendSnapshot, SelectError> {
        if healthy.is_empty() {
            warn!("no healthy servers available");
            return Err(SelectError::NoHealthyBackend);
        }

        let sticky = self.affinity.as_ref().zip(session_id);

        if let Some((table, session)) = sticky {
            if let Some(server) = table.lookup(session, healthy) {
                debug!(session = %session, backend = %server.id, "session affinity hit");
                return Ok(server);
            }
        }

        let active = self.active.load();
        let server = active
            .balancer
            .select(healthy, client_ip)
            .cloned()
            .ok_or(SelectError::NoHealthyBackend)?;

        if let Some((table, session)) = sticky {
            table.bind(session, &server.id);
        }

        debug!(algorithm = %active.kind, backend = %server.id, "selected backend server");
        Ok(server)
    }
}
