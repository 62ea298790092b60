//! Request metrics, Prometheus exposition and the admin API.

mod collector;
mod recorder;
mod server;

pub use collector::{MetricsCollector, RejectionReason};
pub use recorder::{
    BackendTotals, BackendWindowStats, LifetimeTotals, MetricsRecorder, RequestSample,
    WindowStats,
};
pub use server::AdminServer;
