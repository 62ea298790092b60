//! Per-client admission control.

mod limiter;

pub use limiter::{RateDecision, RateLimiter};
