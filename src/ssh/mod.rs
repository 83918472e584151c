//! SSH control-channel layer: target identity, socket store, health
//! probes, and the connection lifecycle.

pub mod control;
pub mod health;
pub mod lifecycle;
pub mod target;

pub use control::ControlSocketStore;
pub use health::HealthChecker;
pub use lifecycle::{Closed, CommandOutput, ConnectionManager, Established};
pub use target::{ConnectionId, Target};
