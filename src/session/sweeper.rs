//! Stale Connection Sweeper
//!
//! Background pass that reaps dead control sockets and orphaned registry
//! rows. Runs detached from the foreground call path: every failure is
//! logged and swallowed, and any file or row it touches may be concurrently
//! rewritten by another process, so everything tolerates vanishing state.

use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::registry::ConnectionRegistry;
use crate::config::Config;
use crate::ssh::control::{self, ControlSocketStore};
use crate::ssh::health::HealthChecker;
use crate::ssh::target::{ConnectionId, Target};

/// What a sweep pass did, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sockets_seen: usize,
    pub sockets_removed: usize,
    pub rows_removed: usize,
}

pub struct Sweeper {
    store: ControlSocketStore,
    health: HealthChecker,
    registry: ConnectionRegistry,
    config: Config,
}

impl Sweeper {
    pub fn new(config: Config) -> Self {
        Self {
            store: ControlSocketStore::new(&config),
            health: HealthChecker::new(config.clone()),
            registry: ConnectionRegistry::new(&config),
            config,
        }
    }

    /// One full pass: probe every socket, reap the dead, compact the
    /// registry down to rows whose socket still exists. Never fails.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        let sockets = match self.store.list_sockets() {
            Ok(sockets) => sockets,
            Err(e) => {
                warn!("[Sweeper] cannot list sockets: {}", e);
                return report;
            }
        };

        for (id, path) in sockets {
            report.sockets_seen += 1;

            let owner = self.registry.lookup_target(&id).unwrap_or_else(|e| {
                debug!("[Sweeper] registry lookup for {} failed: {}", id, e);
                None
            });

            match owner.as_deref().map(Target::parse) {
                Some(Ok(target)) => {
                    if self.health.quick_check(&target).await {
                        continue;
                    }
                    debug!("[Sweeper] {} ({}) is dead", target, id);
                    self.remove_connection(&id, Some(&target)).await;
                    if let Ok(true) = self.registry.remove_id(&id) {
                        report.rows_removed += 1;
                    }
                    report.sockets_removed += 1;
                }
                // Orphan socket, or a row whose target no longer parses:
                // remove it only if no live master answers on it.
                Some(Err(_)) | None => {
                    if self.health.probe_socket(&path).await {
                        continue;
                    }
                    debug!("[Sweeper] removing orphan socket {:?}", path);
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            debug!("[Sweeper] orphan removal failed: {}", e);
                            continue;
                        }
                    }
                    report.sockets_removed += 1;
                }
            }
        }

        // Compaction: a row without a socket can never serve a caller again.
        match self
            .registry
            .retain(|row| self.store.socket_exists(&row.connection_id))
        {
            Ok(dropped) => report.rows_removed += dropped,
            Err(e) => debug!("[Sweeper] compaction failed: {}", e),
        }

        if report.sockets_removed > 0 || report.rows_removed > 0 {
            info!(
                "[Sweeper] removed {} sockets, {} rows ({} sockets seen)",
                report.sockets_removed, report.rows_removed, report.sockets_seen
            );
        }
        report
    }

    /// Tear down one connection's socket: graceful `-O exit` when the owner
    /// target is known, then file removal either way. Best-effort.
    pub(crate) async fn remove_connection(&self, id: &ConnectionId, target: Option<&Target>) {
        if let Some(target) = target {
            let socket = self.store.socket_path(id);
            let mut cmd = control::exit_command(&socket, target);
            match timeout(self.config.check_timeout, cmd.status()).await {
                Ok(Ok(status)) if status.success() => {
                    debug!("[Sweeper] graceful exit for {}", target)
                }
                _ => debug!("[Sweeper] graceful exit failed for {}, removing file", target),
            }
        }
        if let Err(e) = self.store.remove_socket(id).await {
            debug!("[Sweeper] socket removal for {} failed: {}", id, e);
        }
    }

    /// Run a sweep on a detached task so no foreground caller waits on it.
    pub fn spawn(config: Config) {
        tokio::spawn(async move {
            let report = Sweeper::new(config).sweep().await;
            debug!("[Sweeper] background pass done: {:?}", report);
        });
    }
}
