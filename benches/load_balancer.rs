//! Benchmarks for gatelb components.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use gatelb::backend::{Selector, ServerPool, SessionAffinityTable};
use gatelb::breaker::CircuitBreaker;
use gatelb::config::{Algorithm, ServerConfig};
use gatelb::metrics::{MetricsCollector, MetricsRecorder, RequestSample};
use gatelb::ratelimit::RateLimiter;
use gatelb::util::{generate_session_id, generate_short_request_id};
use std::net::IpAddr;
use std::time::{Duration, Instant};

fn create_pool(num_servers: usize) -> ServerPool {
    let pool = ServerPool::new(0.1);
    for i in 0..num_servers {
        let server = ServerConfig::new(format!("web-{}", i), "127.0.0.1", 9000 + i as u16)
            .with_weight((i % 4) as u32 + 1);
        pool.add(server).unwrap();
    }
    pool
}

fn benchmark_selection(c: &mut Criterion) {
    let pool = create_pool(10);
    let healthy = pool.healthy_set();
    let client: IpAddr = "192.168.1.100".parse().unwrap();

    let mut group = c.benchmark_group("select");
    for algorithm in Algorithm::ALL {
        let selector = Selector::new(algorithm, None);
        group.bench_with_input(BenchmarkId::from_parameter(algorithm), &healthy, |b, healthy| {
            b.iter(|| {
                black_box(selector.pick(healthy, Some(client), None).ok());
            })
        });
    }
    group.finish();
}

fn benchmark_sticky_selection(c: &mut Criterion) {
    let pool = create_pool(10);
    let healthy = pool.healthy_set();
    let selector = Selector::new(
        Algorithm::RoundRobin,
        Some(SessionAffinityTable::new(Duration::from_secs(3600))),
    );
    let session = generate_session_id();
    let _ = selector.pick(&healthy, None, Some(&session));

    c.bench_function("select_with_session", |b| {
        b.iter(|| {
            black_box(selector.pick(&healthy, None, Some(black_box(&session))).ok());
        })
    });
}

fn benchmark_healthy_set(c: &mut Criterion) {
    let pool = create_pool(50);

    c.bench_function("healthy_set_50", |b| {
        b.iter(|| {
            black_box(pool.healthy_set());
        })
    });
}

fn benchmark_rate_limiter(c: &mut Criterion) {
    let limiter = RateLimiter::new(1000, Duration::from_millis(10));
    let clients: Vec<String> = (0..256).map(|i| format!("10.0.0.{}", i)).collect();

    let mut group = c.benchmark_group("rate_limiter");
    group.throughput(Throughput::Elements(1));

    let mut i = 0usize;
    group.bench_function("admit", |b| {
        b.iter(|| {
            i = (i + 1) % clients.len();
            black_box(limiter.admit(&clients[i]));
        })
    });

    group.finish();
}

fn benchmark_circuit_breaker(c: &mut Criterion) {
    let breaker = CircuitBreaker::new("web-0", 5, Duration::from_secs(60));

    c.bench_function("breaker_acquire_succeed", |b| {
        b.iter(|| {
            if let Some(permit) = breaker.acquire() {
                permit.succeed();
            }
        })
    });
}

fn benchmark_metrics(c: &mut Criterion) {
    let recorder = MetricsRecorder::new(10_000);
    let collector = MetricsCollector::new();

    let mut group = c.benchmark_group("metrics");
    group.throughput(Throughput::Elements(1));

    group.bench_function("recorder_record", |b| {
        b.iter(|| {
            recorder.record(RequestSample {
                at: Instant::now(),
                client: "10.0.0.1".to_string(),
                backend_id: "web-0".to_string(),
                latency: Duration::from_millis(10),
                status: 200,
                bytes: 512,
            });
        })
    });

    group.bench_function("recorder_stats", |b| {
        b.iter(|| {
            black_box(recorder.stats(black_box(60)));
        })
    });

    group.bench_function("collector_record_request", |b| {
        b.iter(|| {
            collector.record_request(
                black_box("web-0"),
                black_box("GET"),
                black_box(200),
                black_box(Duration::from_millis(10)),
            );
        })
    });

    group.finish();
}

fn benchmark_ids(c: &mut Criterion) {
    let mut group = c.benchmark_group("ids");

    group.bench_function("session", |b| {
        b.iter(|| {
            black_box(generate_session_id());
        })
    });

    group.bench_function("request", |b| {
        b.iter(|| {
            black_box(generate_short_request_id());
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_selection,
    benchmark_sticky_selection,
    benchmark_healthy_set,
    benchmark_rate_limiter,
    benchmark_circuit_breaker,
    benchmark_metrics,
    benchmark_ids,
);

criterion_main!(benches);
