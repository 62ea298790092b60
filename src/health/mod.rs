//! Active health checking for backend servers.

mod checker;
mod state;

pub use checker::{HealthChecker, ProbeError, ProbeSettings};
pub use state::{next_health, HealthProbe, ProbeOutcome};
