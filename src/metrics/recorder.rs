//! Request sample recording and windowed aggregation.
//!
//! Keeps a bounded ring of recent samples (oldest evicted first) for the
//! windowed statistics, plus cumulative per-backend counters that only
//! disappear when the backend is removed.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// One completed request that reached the backend selection stage.
#[derive(Debug, Clone)]
pub struct RequestSample {
    pub at: Instant,
    pub client: String,
    pub backend_id: String,
    pub latency: Duration,
    pub status: u16,
    pub bytes: u64,
}

impl RequestSample {
    pub fn is_error(&self) -> bool {
        self.status >= 400
    }
}

/// Aggregates over the samples of one time window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WindowStats {
    pub total_requests: u64,
    /// Mean latency in milliseconds.
    pub avg_response_time: f64,
    pub error_rate_percent: f64,
    pub requests_per_second: f64,
    pub per_backend: BTreeMap<String, BackendWindowStats>,
}

/// Per-backend aggregates over one time window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackendWindowStats {
    pub requests: u64,
    pub avg_response_time: f64,
    pub error_rate_percent: f64,
}

/// Cumulative counters of one backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackendTotals {
    pub requests: u64,
    pub errors: u64,
    pub bytes: u64,
}

/// Lifetime request counters across all backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LifetimeTotals {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
}

#[derive(Debug, Default)]
struct AtomicTotals {
    requests: AtomicU64,
    errors: AtomicU64,
    bytes: AtomicU64,
}

impl AtomicTotals {
    fn load(&self) -> BackendTotals {
        BackendTotals {
            requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

/// Bounded sample ring plus cumulative counters.
pub struct MetricsRecorder {
    samples: Mutex<VecDeque<RequestSample>>,
    capacity: usize,
    per_backend: DashMap<String, AtomicTotals>,
    total: AtomicU64,
    failed: AtomicU64,
}

impl MetricsRecorder {
    /// A ring holding at most `capacity` samples, at least one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            per_backend: DashMap::new(),
            total: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record a sample, evicting the oldest once the ring is full.
    ///
    /// Callers must hold the backend's membership (see
    /// [`ServerPool::pin`](crate::backend::ServerPool::pin)) so that a
    /// removed backend's totals are not recreated.
    pub fn record(&self, sample: RequestSample) {
        {
            let totals = self
                .per_backend
                .entry(sample.backend_id.clone())
                .or_default();
            totals.requests.fetch_add(1, Ordering::Relaxed);
            totals.bytes.fetch_add(sample.bytes, Ordering::Relaxed);
            if sample.is_error() {
                totals.errors.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.record_unattributed(sample);
    }

    /// Record a sample whose backend has already been removed. Only the
    /// lifetime counters and the ring see it.
    pub fn record_unattributed(&self, sample: RequestSample) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if sample.is_error() {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }

        let mut samples = self.samples.lock();
        while samples.len() >= self.capacity {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    /// Number of samples currently retained.
    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    /// Aggregate the samples of the last `window_minutes` minutes.
    pub fn stats(&self, window_minutes: u64) -> WindowStats {
        self.stats_at(Instant::now(), window_minutes)
    }

    pub fn stats_at(&self, now: Instant, window_minutes: u64) -> WindowStats {
        let window = Duration::from_secs(window_minutes.saturating_mul(60));

        let recent: Vec<RequestSample> = self
            .samples
            .lock()
            .iter()
            .filter(|s| now.saturating_duration_since(s.at) <= window)
            .cloned()
            .collect();

        if recent.is_empty() {
            return WindowStats::default();
        }

        let total = recent.len() as u64;
        let seconds = window.as_secs_f64();
        let requests_per_second = if seconds > 0.0 {
            total as f64 / seconds
        } else {
            0.0
        };

        let mut grouped: BTreeMap<String, Vec<&RequestSample>> = BTreeMap::new();
        for sample in &recent {
            grouped
                .entry(sample.backend_id.clone())
                .or_default()
                .push(sample);
        }

        let per_backend = grouped
            .into_iter()
            .map(|(id, samples)| {
                let stats = BackendWindowStats {
                    requests: samples.len() as u64,
                    avg_response_time: round_to(mean_latency_ms(samples.iter().copied()), 3),
                    error_rate_percent: round_to(error_rate(samples.iter().copied()), 2),
                };
                (id, stats)
            })
            .collect();

        WindowStats {
            total_requests: total,
            avg_response_time: round_to(mean_latency_ms(recent.iter()), 3),
            error_rate_percent: round_to(error_rate(recent.iter()), 2),
            requests_per_second: round_to(requests_per_second, 2),
            per_backend,
        }
    }

    /// Cumulative counters of one backend.
    pub fn backend_totals(&self, backend_id: &str) -> BackendTotals {
        self.per_backend
            .get(backend_id)
            .map(|t| t.load())
            .unwrap_or_default()
    }

    pub fn lifetime(&self) -> LifetimeTotals {
        let total = self.total.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        LifetimeTotals {
            total_requests: total,
            successful_requests: total.saturating_sub(failed),
            failed_requests: failed,
        }
    }

    /// Drop the cumulative counters of a removed backend.
    pub fn forget_backend(&self, backend_id: &str) {
        self.per_backend.remove(backend_id);
    }
}

fn mean_latency_ms<'a>(samples: impl Iterator<Item = &'a RequestSample>) -> f64 {
    let (count, sum) = samples.fold((0u64, 0.0f64), |(n, sum), s| {
        (n + 1, sum + s.latency.as_secs_f64() * 1000.0)
    });
    if count == 0 { 0.0 } else { sum / count as f64 }
}

fn error_rate<'a>(samples: impl Iterator<Item = &'a RequestSample>) -> f64 {
    let (count, errors) = samples.fold((0u64, 0u64), |(n, e), s| {
        (n + 1, e + u64::from(s.is_error()))
    });
    if count == 0 {
        0.0
    } else {
        errors as f64 / count as f64 * 100.0
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
