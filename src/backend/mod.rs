//! Backend pool management and load balancing algorithms.

mod affinity;
pub mod algorithms;
mod pool;
mod selector;

pub use affinity::SessionAffinityTable;
pub use pool::{
    ema, BackendSnapshot, ConnectionGuard, Health, HealthChange, MembershipPin, PoolError,
    ServerPool,
};
pub use selector::{SelectError, Selector};
