pub(crate) mod drain;
pub(crate) mod metrics;
pub(crate) mod permits;
pub(crate) mod pool;
pub(crate) mod resource;
pub(crate) mod waitqueue;

mod time {
    #[cfg(not(test))]
    pub use std::time::Instant;
    #[cfg(test)]
    pub use tokio::time::Instant;
}

// Public interface

pub use metrics::{ByState, MetricVariant, PoolMetrics};
pub use permits::{AllocationStrategy, Bounded, Unbounded};
pub use pool::{Pool, PoolConfig, PoolHandle};
pub use resource::{AcquireExecutor, PoolError, PoolResult, PooledMeta, ResourceManager};
pub use waitqueue::PendingOrdering;
