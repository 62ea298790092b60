//! Sliding-window rate limiter.
//!
//! Each client identity keeps the timestamps of its admitted requests inside
//! the trailing window. A request is admitted iff fewer than `max_requests`
//! timestamps remain after pruning.
//!
//! Windows of idle clients are only reclaimed when that client is seen again
//! or when [`RateLimiter::sweep`] runs, so memory is bounded by the number of
//! clients seen within one sweep period.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: usize },
    Rejected { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

/// Sliding-window limiter keyed by client identity.
pub struct RateLimiter {
    windows: DashMap<String, VecDeque<Instant>>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            max_requests,
            window,
        }
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Admit or reject one request from `client`.
    pub fn admit(&self, client: &str) -> RateDecision {
        self.admit_at(client, Instant::now())
    }

    pub fn admit_at(&self, client: &str, now: Instant) -> RateDecision {
        let mut window = self.windows.entry(client.to_string()).or_default();
        prune(&mut window, now, self.window);

        if window.len() < self.max_requests {
            window.push_back(now);
            RateDecision::Allowed {
                remaining: self.max_requests - window.len(),
            }
        } else {
            let retry_after = window
                .front()
                .map(|oldest| self.window.saturating_sub(now.saturating_duration_since(*oldest)))
                .unwrap_or(self.window);
            RateDecision::Rejected { retry_after }
        }
    }

    /// Requests from `client` counted in the current window.
    pub fn in_window(&self, client: &str) -> usize {
        self.in_window_at(client, Instant::now())
    }

    pub fn in_window_at(&self, client: &str, now: Instant) -> usize {
        self.windows
            .get(client)
            .map(|w| w.iter().filter(|ts| is_live(**ts, now, self.window)).count())
            .unwrap_or(0)
    }

    /// Drop windows with no live timestamps. Returns the number of clients
    /// reclaimed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            prune(window, now, self.window);
            !window.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }

    /// Number of clients currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }
}

/// A timestamp is live while it is strictly newer than `now - window`.
fn is_live(ts: Instant, now: Instant, window: Duration) -> bool {
    now.saturating_duration_since(ts) < window
}

fn prune(window: &mut VecDeque<Instant>, now: Instant, length: Duration) {
    while let Some(front) = window.front() {
        if is_live(*front, now, length) {
            break;
        }
        window.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_admits_up_to_limit() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let now = Instant::now();

        assert_eq!(limiter.admit_at("c", now), RateDecision::Allowed { remaining: 2 });
        assert!(limiter.admit_at("c", now).is_allowed());
        assert_eq!(limiter.admit_at("c", now), RateDecision::Allowed { remaining: 0 });

        let rejected = limiter.admit_at("c", now);
        assert_eq!(
            rejected,
            RateDecision::Rejected {
                retry_after: Duration::from_secs(60)
            }
        );
    }

    #[test]
    fn test_rejection_does_not_mutate() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10));
        let now = Instant::now();
        limiter.admit_at("c", now);
        for i in 1..5 {
            assert!(!limiter.admit_at("c", now + Duration::from_secs(i)).is_allowed());
        }
        assert_eq!(limiter.in_window_at("c", now + Duration::from_secs(5)), 1);

        // Only the admitted request occupies the window
        assert!(limiter.admit_at("c", now + Duration::from_secs(10)).is_allowed());
    }

    #[test]
    fn test_window_slides() {
        let limiter = RateLimiter::new(2, Duration::from_secs(10));
        let start = Instant::now();

        limiter.admit_at("c", start);
        limiter.admit_at("c", start + Duration::from_secs(5));
        assert!(!limiter.admit_at("c", start + Duration::from_secs(9)).is_allowed());

        // The first timestamp leaves the window exactly at start + 10s
        assert!(limiter.admit_at("c", start + Duration::from_secs(10)).is_allowed());
        assert!(!limiter.admit_at("c", start + Duration::from_secs(11)).is_allowed());
    }

    #[test]
    fn test_retry_after_tracks_oldest() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10));
        let start = Instant::now();
        limiter.admit_at("c", start);

        assert_eq!(
            limiter.admit_at("c", start + Duration::from_secs(4)),
            RateDecision::Rejected {
                retry_after: Duration::from_secs(6)
            }
        );
    }

    #[test]
    fn test_clients_are_isolated() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();
        assert!(limiter.admit_at("a", now).is_allowed());
        assert!(limiter.admit_at("b", now).is_allowed());
        assert!(!limiter.admit_at("a", now).is_allowed());
    }

    #[test]
    fn test_sweep_reclaims_idle_clients() {
        let limiter = RateLimiter::new(5, Duration::from_secs(10));
        let start = Instant::now();
        limiter.admit_at("idle", start);
        limiter.admit_at("busy", start + Duration::from_secs(8));
        assert_eq!(limiter.tracked_clients(), 2);

        assert_eq!(limiter.sweep_at(start + Duration::from_secs(12)), 1);
        assert_eq!(limiter.tracked_clients(), 1);
        assert_eq!(limiter.in_window_at("busy", start + Duration::from_secs(12)), 1);
    }

    #[test]
    fn test_concurrent_admission_respects_limit() {
        let limiter = Arc::new(RateLimiter::new(100, Duration::from_secs(60)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..50).filter(|_| limiter.admit("shared").is_allowed()).count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 100);
    }
}
