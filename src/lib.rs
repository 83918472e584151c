//! HostMux - connection multiplexing and host metadata caching
//!
//! Lets many short-lived command invocations share one persistent,
//! authenticated SSH session per target host, driving the installed ssh
//! client's ControlMaster mode, and remembers per-host device-type
//! classifications across invocations that have no shared process memory.
//!
//! All cross-call state is durable files under the configured state
//! directory: control sockets and a lockable JSON-Lines registry in the
//! socket directory, one versioned cache entry per target in the cache
//! directory, and a single-slot last-target record.
//!
//! Typical flow:
//!
//! ```no_run
//! use hostmux::config::Config;
//! use hostmux::ssh::{ConnectionManager, Target};
//!
//! # async fn run() -> hostmux::error::Result<()> {
//! let config = Config::from_env();
//! let manager = ConnectionManager::new(config);
//! let target = Target::parse("admin@192.0.2.10:2200")?;
//! manager.establish(&target).await?;
//! let output = manager.execute(&target, "uptime").await?;
//! println!("{}", output.stdout);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod session;
pub mod ssh;

pub use cache::{CacheEntry, CacheStats, DeviceTypeCache};
pub use config::Config;
pub use error::{MuxError, Result};
pub use session::{ConnectionRegistry, LastTargetTracker, PoolManager, Sweeper};
pub use ssh::{CommandOutput, ConnectionManager, Target};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging for embedding hosts.
///
/// Filter via `RUST_LOG`; defaults to `info`.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
