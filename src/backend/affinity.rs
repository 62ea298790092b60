//! Session affinity table.
//!
//! Maps a session id to the backend that served it. Entries expire after the
//! session cookie lifetime; a mapping whose backend has left the healthy set
//! is ignored and later overwritten.

use crate::backend::BackendSnapshot;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
struct AffinityEntry {
    backend_id: String,
    expires_at: Instant,
}

/// Session id to backend id mapping with a fixed TTL.
pub struct SessionAffinityTable {
    entries: DashMap<String, AffinityEntry>,
    ttl: Duration,
}

impl SessionAffinityTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Find the live backend bound to a session.
    pub fn lookup(&self, session_id: &str, healthy: &[BackendSnapshot]) -> Option<BackendSnapshot> {
        self.lookup_at(session_id, healthy, Instant::now())
    }

    pub fn lookup_at(
        &self,
        session_id: &str,
        healthy: &[BackendSnapshot],
        now: Instant,
    ) -> Option<BackendSnapshot> {
        let backend_id = {
            let entry = self.entries.get(session_id)?;
            if entry.expires_at <= now {
                None
            } else {
                Some(entry.backend_id.clone())
            }
        };

        let Some(backend_id) = backend_id else {
            self.entries
                .remove_if(session_id, |_, e| e.expires_at <= now);
            return None;
        };

        let found = healthy.iter().find(|s| s.id == backend_id).cloned();
        if found.is_none() {
            debug!(session = %session_id, backend = %backend_id, "stale session mapping");
        }
        found
    }

    /// Bind a session to a backend, replacing any previous mapping.
    pub fn bind(&self, session_id: &str, backend_id: &str) {
        self.bind_at(session_id, backend_id, Instant::now());
    }

    pub fn bind_at(&self, session_id: &str, backend_id: &str, now: Instant) {
        self.entries.insert(
            session_id.to_string(),
            AffinityEntry {
                backend_id: backend_id.to_string(),
                expires_at: now + self.ttl,
            },
        );
    }

    /// Backend currently recorded for a session, live or not.
    pub fn backend_for(&self, session_id: &str) -> Option<String> {
        self.entries.get(session_id).map(|e| e.backend_id.clone())
    }

    /// Drop every mapping that points at a backend. Returns the number removed.
    pub fn purge_backend(&self, backend_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.backend_id != backend_id);
        before.saturating_sub(self.entries.len())
    }

    /// Drop expired mappings. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub fn purge_expired_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::algorithms::test_support::servers;

    #[test]
    fn test_bind_and_lookup() {
        let table = SessionAffinityTable::new(Duration::from_secs(60));
        let healthy = servers(&["a", "b"]);

        assert!(table.lookup("s1", &healthy).is_none());
        table.bind("s1", "b");
        assert_eq!(table.lookup("s1", &healthy).unwrap().id, "b");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_unhealthy_target_falls_through() {
        let table = SessionAffinityTable::new(Duration::from_secs(60));
        table.bind("s1", "b");

        let healthy = servers(&["a", "c"]);
        assert!(table.lookup("s1", &healthy).is_none());
        // Stale entry stays until overwritten
        assert_eq!(table.backend_for("s1").as_deref(), Some("b"));

        table.bind("s1", "a");
        assert_eq!(table.lookup("s1", &healthy).unwrap().id, "a");
    }

    #[test]
    fn test_expiry() {
        let table = SessionAffinityTable::new(Duration::from_secs(10));
        let healthy = servers(&["a"]);
        let start = Instant::now();

        table.bind_at("s1", "a", start);
        assert!(table.lookup_at("s1", &healthy, start + Duration::from_secs(9)).is_some());
        assert!(table.lookup_at("s1", &healthy, start + Duration::from_secs(10)).is_none());
        // Expired entry is dropped on lookup
        assert!(table.is_empty());
    }

    #[test]
    fn test_purge_expired() {
        let table = SessionAffinityTable::new(Duration::from_secs(10));
        let start = Instant::now();
        table.bind_at("old", "a", start);
        table.bind_at("new", "a", start + Duration::from_secs(5));

        assert_eq!(table.purge_expired_at(start + Duration::from_secs(12)), 1);
        assert_eq!(table.backend_for("new").as_deref(), Some("a"));
    }

    #[test]
    fn test_purge_backend() {
        let table = SessionAffinityTable::new(Duration::from_secs(60));
        table.bind("s1", "a");
        table.bind("s2", "b");
        table.bind("s3", "b");

        assert_eq!(table.purge_backend("b"), 2);
        assert_eq!(table.len(), 1);
    }
}
