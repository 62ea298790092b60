//! gatelb - An HTTP reverse-proxy load balancer
//!
//! This crate provides a single-pool Layer 7 load balancer with support for:
//! - Six selection algorithms, switchable at runtime
//! - Active health checking with operator overrides
//! - Per-backend circuit breakers and per-client rate limiting
//! - Cookie-based session affinity
//! - Windowed request statistics and Prometheus metrics

pub mod backend;
pub mod balancer;
pub mod breaker;
pub mod config;
pub mod frontend;
pub mod health;
pub mod metrics;
pub mod proxy;
pub mod ratelimit;
pub mod util;

pub use balancer::LoadBalancer;
pub use config::Config;
