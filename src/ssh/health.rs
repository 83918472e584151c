//! Connection Health Checks
//!
//! Two probes against a multiplexed session:
//! - `full_check` issues a real `ssh -O check` round trip, bounded by the
//!   configured check timeout.
//! - `quick_check` trusts a socket whose mtime is below the freshness
//!   threshold and only falls back to the round trip beyond it. This buys a
//!   small false-positive staleness window in exchange for per-call latency;
//!   callers that need certainty (registration, command execution) use
//!   `full_check`.
//!
//! Neither probe mutates state, and neither ever errors: spawn failures,
//! non-zero exits, and timeouts all map to `false`.

use std::path::Path;

use tokio::time::timeout;
use tracing::debug;

use super::control::{self, ControlSocketStore};
use super::target::Target;
use crate::config::Config;

pub struct HealthChecker {
    config: Config,
    store: ControlSocketStore,
}

impl HealthChecker {
    pub fn new(config: Config) -> Self {
        let store = ControlSocketStore::new(&config);
        Self { config, store }
    }

    /// True iff a control socket exists for the target and the master behind
    /// it answers a liveness check within the check timeout.
    pub async fn full_check(&self, target: &Target) -> bool {
        let id = target.connection_id();
        if !self.store.socket_exists(&id) {
            return false;
        }
        self.probe_socket(&self.store.socket_path(&id)).await
    }

    /// Freshness-gated variant of [`full_check`](Self::full_check).
    ///
    /// A socket modified less than `socket_fresh` ago is accepted without a
    /// round trip; older (or unreadable) sockets get the full probe.
    pub async fn quick_check(&self, target: &Target) -> bool {
        let id = target.connection_id();
        if let Some(age) = self.store.socket_age(&id) {
            if age < self.config.socket_fresh {
                debug!(
                    "[Health] {} socket fresh ({}s old), skipping probe",
                    target,
                    age.as_secs()
                );
                return true;
            }
        }
        self.full_check(target).await
    }

    /// Probe a bare socket path, regardless of whether any registry row or
    /// target maps to it. Used for orphan sockets during sweeps.
    pub(crate) async fn probe_socket(&self, socket: &Path) -> bool {
        let mut cmd = control::probe_command(socket);
        match timeout(self.config.check_timeout, cmd.status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                debug!("[Health] probe spawn failed for {:?}: {}", socket, e);
                false
            }
            Err(_) => {
                debug!(
                    "[Health] probe timed out after {}s for {:?}",
                    self.config.check_timeout.as_secs(),
                    socket
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.socket_dir = dir.to_path_buf();
        config
    }

    #[tokio::test]
    async fn test_full_check_without_socket() {
        let temp = tempfile::tempdir().unwrap();
        let checker = HealthChecker::new(test_config(temp.path()));
        let target = Target::parse("root@web1").unwrap();
        assert!(!checker.full_check(&target).await);
    }

    #[tokio::test]
    async fn test_quick_check_accepts_fresh_socket() {
        let temp = tempfile::tempdir().unwrap();
        let config = test_config(temp.path());
        let store = ControlSocketStore::new(&config);
        let checker = HealthChecker::new(config);

        let target = Target::parse("root@web1").unwrap();
        std::fs::write(store.socket_path(&target.connection_id()), b"").unwrap();

        // A just-created socket is below the freshness threshold, so no
        // round trip is attempted and the check passes.
        assert!(checker.quick_check(&target).await);
    }

    #[tokio::test]
    async fn test_quick_check_without_socket() {
        let temp = tempfile::tempdir().unwrap();
        let checker = HealthChecker::new(test_config(temp.path()));
        let target = Target::parse("root@web1").unwrap();
        assert!(!checker.quick_check(&target).await);
    }
}
