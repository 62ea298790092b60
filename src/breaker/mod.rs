//! Per-backend circuit breaking.
//!
//! # States
//! - Closed: calls pass through, consecutive failures are counted
//! - Open: calls fail fast until the recovery timeout has elapsed
//! - Half-Open: a single trial call decides between Closed and Open
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_count >= threshold
//! Open → Half-Open: next call after recovery_timeout
//! Half-Open → Closed: trial call succeeds
//! Half-Open → Open: trial call fails or is cancelled
//! ```
//!
//! While a trial is in flight every other caller is rejected.

mod circuit;
mod registry;

pub use circuit::{CallPermit, CircuitBreaker, CircuitError, CircuitSnapshot, CircuitState};
pub use registry::BreakerRegistry;
