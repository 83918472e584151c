//! Runtime Configuration
//!
//! Every knob is overridable through a `HOSTMUX_*` environment variable and
//! falls back to a documented default. State lives under `~/.hostmux` unless
//! redirected: control sockets and the registry in the socket directory,
//! device-type entries in the cache directory.

use std::path::PathBuf;
use std::time::Duration;

/// Registry file name inside the socket directory.
pub const REGISTRY_FILE: &str = "registry.jsonl";

/// Advisory lock file guarding registry rewrites.
pub const REGISTRY_LOCK_FILE: &str = "registry.lock";

/// Single-slot last-target record inside the socket directory.
pub const LAST_TARGET_FILE: &str = "last_target.json";

/// Crate configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding one control socket per connection plus the registry
    pub socket_dir: PathBuf,
    /// Directory holding one device-type cache entry per target
    pub cache_dir: PathBuf,
    /// Maximum age of a cached device type before re-detection
    pub cache_ttl: Duration,
    /// Cache files above this count trigger oldest-first eviction
    pub cache_max_entries: usize,
    /// Hard cap on concurrently tracked connections
    pub max_connections: usize,
    /// ConnectTimeout passed to the ssh client
    pub connect_timeout: Duration,
    /// Bound on a single control-channel liveness probe
    pub check_timeout: Duration,
    /// ControlPersist lifetime of an idle master session
    pub control_persist: Duration,
    /// Socket mtime age below which quick checks skip the round trip
    pub socket_fresh: Duration,
    /// Polling attempts while waiting for a master socket to come up
    pub establish_attempts: u32,
    /// Interval between establish polling attempts
    pub establish_poll_interval: Duration,
    /// Number of recently used cache entries touched by a warm pass
    pub warm_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        let state = state_dir();
        Self {
            socket_dir: state.join("sockets"),
            cache_dir: state.join("cache"),
            cache_ttl: Duration::from_secs(86_400), // 1 day
            cache_max_entries: 100,
            max_connections: 10,
            connect_timeout: Duration::from_secs(10),
            check_timeout: Duration::from_secs(5),
            control_persist: Duration::from_secs(600), // 10 minutes idle
            socket_fresh: Duration::from_secs(3600),   // 1 hour
            establish_attempts: 30,
            establish_poll_interval: Duration::from_secs(1),
            warm_limit: 5,
        }
    }
}

impl Config {
    /// Build a configuration from `HOSTMUX_*` environment variables.
    ///
    /// Unset or unparsable values silently fall back to the defaults; a
    /// misconfigured environment must never prevent a caller from connecting.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(dir) = env_path("HOSTMUX_SOCKET_DIR") {
            config.socket_dir = dir;
        }
        if let Some(dir) = env_path("HOSTMUX_CACHE_DIR") {
            config.cache_dir = dir;
        }
        if let Some(secs) = env_u64("HOSTMUX_CACHE_TTL_SECS") {
            config.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("HOSTMUX_CACHE_MAX_ENTRIES") {
            config.cache_max_entries = n as usize;
        }
        if let Some(n) = env_u64("HOSTMUX_MAX_CONNECTIONS") {
            config.max_connections = n as usize;
        }
        if let Some(secs) = env_u64("HOSTMUX_CONNECT_TIMEOUT_SECS") {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("HOSTMUX_CHECK_TIMEOUT_SECS") {
            config.check_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("HOSTMUX_CONTROL_PERSIST_SECS") {
            config.control_persist = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("HOSTMUX_SOCKET_FRESH_SECS") {
            config.socket_fresh = Duration::from_secs(secs);
        }

        config
    }

    /// Path of the JSON-Lines registry file.
    pub fn registry_path(&self) -> PathBuf {
        self.socket_dir.join(REGISTRY_FILE)
    }

    /// Path of the advisory lock guarding the registry.
    pub fn registry_lock_path(&self) -> PathBuf {
        self.socket_dir.join(REGISTRY_LOCK_FILE)
    }

    /// Path of the single-slot last-target record.
    pub fn last_target_path(&self) -> PathBuf {
        self.socket_dir.join(LAST_TARGET_FILE)
    }
}

/// Default state directory: `~/.hostmux`, or `./.hostmux` when no home
/// directory can be determined.
fn state_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".hostmux"))
        .unwrap_or_else(|| PathBuf::from(".hostmux"))
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var_os(name)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.cache_ttl, Duration::from_secs(86_400));
        assert_eq!(config.cache_max_entries, 100);
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.establish_attempts, 30);
        assert_eq!(config.establish_poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_derived_paths() {
        let mut config = Config::default();
        config.socket_dir = PathBuf::from("/tmp/hostmux-test");
        assert_eq!(
            config.registry_path(),
            PathBuf::from("/tmp/hostmux-test/registry.jsonl")
        );
        assert_eq!(
            config.registry_lock_path(),
            PathBuf::from("/tmp/hostmux-test/registry.lock")
        );
        assert_eq!(
            config.last_target_path(),
            PathBuf::from("/tmp/hostmux-test/last_target.json")
        );
    }
}
