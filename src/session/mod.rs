//! Cross-invocation session state: the durable registry, pool capacity,
//! stale sweeping, device-type detection, and last-target tracking.

pub mod detector;
pub mod last_target;
pub mod pool;
pub mod registry;
pub mod sweeper;

pub use last_target::LastTargetTracker;
pub use pool::PoolManager;
pub use registry::{ConnectionDetail, ConnectionRegistry, RegistryRow};
pub use sweeper::{SweepReport, Sweeper};
