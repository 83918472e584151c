//! Connection Lifecycle
//!
//! Orchestrates establish / reuse / close / reconnect / execute for
//! multiplexed sessions.
//!
//! # Design
//! - `establish` is idempotent: a healthy existing master is reused, never
//!   duplicated.
//! - Teardown is best-effort from the caller's point of view: a failed
//!   graceful exit degrades to removing the socket file, reported as a
//!   forced outcome for logging.
//! - `execute` never retries and never reshapes output; it only refuses to
//!   run against a missing or unhealthy session.
//!
//! # Invariants
//! - L1: after a successful `establish`, the connection is registered and
//!   the pool cap has been enforced.
//! - L2: after `close`, no socket file and no registry row remain for the
//!   target, regardless of how the master died.

use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::control::{self, ControlSocketStore};
use super::health::HealthChecker;
use super::target::Target;
use crate::config::Config;
use crate::error::{MuxError, Result};
use crate::session::last_target::LastTargetTracker;
use crate::session::pool::PoolManager;
use crate::session::registry::ConnectionRegistry;
use crate::session::sweeper::Sweeper;

/// How `establish` satisfied the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Established {
    /// A healthy master already existed.
    Reused,
    /// A new master session was started.
    Fresh,
}

/// How `close` brought the session down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closed {
    /// The master acknowledged the exit command.
    Graceful,
    /// The exit command failed; the socket file was removed instead.
    Forced,
}

/// Output of a remote command, returned to the caller unchanged.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub struct ConnectionManager {
    config: Config,
    store: ControlSocketStore,
    health: HealthChecker,
    registry: ConnectionRegistry,
    pool: PoolManager,
    last_target: LastTargetTracker,
}

impl ConnectionManager {
    pub fn new(config: Config) -> Self {
        Self {
            store: ControlSocketStore::new(&config),
            health: HealthChecker::new(config.clone()),
            registry: ConnectionRegistry::new(&config),
            pool: PoolManager::new(config.clone()),
            last_target: LastTargetTracker::new(&config),
            config,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn health(&self) -> &HealthChecker {
        &self.health
    }

    /// Ensure a healthy master session for the target.
    ///
    /// Reuses an existing healthy master; otherwise clears any stale socket,
    /// spawns a new ControlMaster, and polls for socket appearance plus
    /// confirmed health up to the configured attempt budget. On success the
    /// connection is registered, the pool cap enforced, and the last-target
    /// slot updated. Exhausting the budget fails with
    /// [`MuxError::ConnectionTimeout`].
    pub async fn establish(&self, target: &Target) -> Result<Established> {
        if self.health.full_check(target).await {
            debug!("[Lifecycle] reusing healthy session for {}", target);
            self.remember_connect(target);
            return Ok(Established::Reused);
        }

        let id = target.connection_id();
        self.store.ensure_dir().await?;

        // A socket file without a live master behind it would make the new
        // master refuse to bind.
        if self.store.remove_socket(&id).await? {
            debug!("[Lifecycle] removed stale socket for {}", target);
        }

        let socket = self.store.socket_path(&id);
        info!("[Lifecycle] establishing master for {}", target);
        let mut child = control::master_command(&self.config, &socket, target).spawn()?;
        let mut spawn_failure_logged = false;

        for attempt in 1..=self.config.establish_attempts {
            // The `-f` parent exits once authentication finishes; a non-zero
            // exit usually means the poll below will never succeed, but a
            // master started by a concurrent caller may still show up.
            if !spawn_failure_logged {
                if let Ok(Some(status)) = child.try_wait() {
                    if !status.success() {
                        warn!(
                            "[Lifecycle] ssh master for {} exited with {} while polling",
                            target, status
                        );
                        spawn_failure_logged = true;
                    }
                }
            }

            if self.store.socket_exists(&id) && self.health.full_check(target).await {
                debug!(
                    "[Lifecycle] {} healthy after {} attempt(s)",
                    target, attempt
                );
                self.registry.register(target)?;
                self.pool
                    .enforce_capacity(self.config.max_connections)
                    .await?;
                self.remember_connect(target);
                // Opportunistic cleanup of whatever else went stale; never
                // blocks this caller.
                Sweeper::spawn(self.config.clone());
                return Ok(Established::Fresh);
            }

            sleep(self.config.establish_poll_interval).await;
        }

        Err(MuxError::ConnectionTimeout {
            target: target.raw().to_string(),
            attempts: self.config.establish_attempts,
        })
    }

    /// Close the master session for the target.
    ///
    /// Fails only when no socket exists at all. A master that ignores the
    /// exit command gets its socket file removed instead, reported as
    /// [`Closed::Forced`]. The registry row is removed in either case.
    pub async fn close(&self, target: &Target) -> Result<Closed> {
        let id = target.connection_id();
        if !self.store.socket_exists(&id) {
            return Err(MuxError::ConnectionNotFound(target.raw().to_string()));
        }

        let socket = self.store.socket_path(&id);
        let mut cmd = control::exit_command(&socket, target);
        let graceful = matches!(
            timeout(self.config.check_timeout, cmd.status()).await,
            Ok(Ok(status)) if status.success()
        );

        // `-O exit` removes the socket itself on success; make sure it is
        // gone either way.
        self.store.remove_socket(&id).await?;
        self.registry.unregister(target)?;

        if graceful {
            info!("[Lifecycle] closed {}", target);
            Ok(Closed::Graceful)
        } else {
            warn!("[Lifecycle] forced close for {}", target);
            Ok(Closed::Forced)
        }
    }

    /// Close (ignoring an absent session) and establish again.
    ///
    /// Not atomic: a crash in between leaves the target disconnected, which
    /// is fine because `establish` is idempotent and retryable.
    pub async fn reconnect(&self, target: &Target) -> Result<Established> {
        match self.close(target).await {
            Ok(_) | Err(MuxError::ConnectionNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.establish(target).await
    }

    /// Run a command over the established session and return its output
    /// unchanged. No retries; the caller bounds execution time itself.
    pub async fn execute(&self, target: &Target, command: &str) -> Result<CommandOutput> {
        let id = target.connection_id();
        if !self.store.socket_exists(&id) {
            return Err(MuxError::ConnectionNotFound(target.raw().to_string()));
        }
        if !self.health.full_check(target).await {
            return Err(MuxError::ConnectionUnhealthy(target.raw().to_string()));
        }

        let socket = self.store.socket_path(&id);
        let output = control::exec_command(&socket, target, command)
            .output()
            .await?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    /// Record the target as the most recent successful connect. Failure is
    /// logged only; the connect itself already succeeded.
    fn remember_connect(&self, target: &Target) {
        if let Err(e) = self.last_target.set(target) {
            warn!("[Lifecycle] failed to record last target: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn test_manager(dir: &Path) -> ConnectionManager {
        let mut config = Config::default();
        config.socket_dir = dir.to_path_buf();
        config.cache_dir = dir.join("cache");
        config.check_timeout = std::time::Duration::from_secs(2);
        ConnectionManager::new(config)
    }

    #[tokio::test]
    async fn test_close_without_socket_is_not_found() {
        let temp = tempfile::tempdir().unwrap();
        let manager = test_manager(temp.path());
        let target = Target::parse("root@web1").unwrap();

        assert!(matches!(
            manager.close(&target).await,
            Err(MuxError::ConnectionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_execute_without_socket_is_not_found() {
        let temp = tempfile::tempdir().unwrap();
        let manager = test_manager(temp.path());
        let target = Target::parse("root@web1").unwrap();

        assert!(matches!(
            manager.execute(&target, "uptime").await,
            Err(MuxError::ConnectionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_execute_with_dead_socket_is_unhealthy() {
        let temp = tempfile::tempdir().unwrap();
        let manager = test_manager(temp.path());
        let target = Target::parse("root@web1").unwrap();

        manager.store.ensure_dir().await.unwrap();
        std::fs::write(
            manager.store.socket_path(&target.connection_id()),
            b"",
        )
        .unwrap();

        // The file exists but no master answers on it.
        assert!(matches!(
            manager.execute(&target, "uptime").await,
            Err(MuxError::ConnectionUnhealthy(_))
        ));
    }

    #[tokio::test]
    async fn test_forced_close_removes_socket_and_row() {
        let temp = tempfile::tempdir().unwrap();
        let manager = test_manager(temp.path());
        let target = Target::parse("root@web1").unwrap();

        manager.store.ensure_dir().await.unwrap();
        std::fs::write(
            manager.store.socket_path(&target.connection_id()),
            b"",
        )
        .unwrap();
        manager.registry.register(&target).unwrap();

        // No live master: the exit command fails and the close degrades.
        let outcome = manager.close(&target).await.unwrap();
        assert_eq!(outcome, Closed::Forced);
        assert!(!manager.store.socket_exists(&target.connection_id()));
        assert_eq!(manager.registry.count().unwrap(), 0);
    }
}
