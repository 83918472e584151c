//! Durable Connection Registry
//!
//! Source of truth for which connections are currently tracked. One JSON
//! object per line in `registry.jsonl`; rows are typed serde records, so a
//! target embedding `:port` needs no delimiter special-casing anywhere.
//!
//! Callers are short-lived processes with no shared memory, so every
//! read-modify-write runs under an exclusive advisory lock on a sibling
//! `registry.lock` file. Concurrent registrations from separate processes
//! serialize instead of losing updates. Plain reads skip the lock: the
//! registry file is only ever replaced by atomic rename, so a reader sees
//! either the old or the new content, never a torn file.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{Local, TimeZone, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::DeviceTypeCache;
use crate::config::Config;
use crate::error::{MuxError, Result};
use crate::ssh::health::HealthChecker;
use crate::ssh::target::{ConnectionId, Target};

/// One tracked connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryRow {
    pub connection_id: ConnectionId,
    pub target: String,
    /// Unix seconds of the most recent registration.
    pub registered_at: i64,
}

/// Detailed row for `list_detailed`: registry data joined with live health
/// and the cached device type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDetail {
    pub connection_id: ConnectionId,
    pub target: String,
    pub healthy: bool,
    pub device_type: Option<String>,
    pub registered_at: i64,
    /// Human-readable registration time for display.
    pub registered_at_display: String,
}

/// Exclusive advisory lock held for the duration of a registry rewrite.
struct RegistryLock {
    file: File,
}

impl RegistryLock {
    fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| MuxError::Registry(format!("create lock dir: {}", e)))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| MuxError::Registry(format!("open lock file: {}", e)))?;
        file.lock_exclusive()
            .map_err(|e| MuxError::Registry(format!("acquire lock: {}", e)))?;
        Ok(Self { file })
    }
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Durable table of `(connection_id, target, registered_at)` rows.
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
    path: PathBuf,
    lock_path: PathBuf,
}

impl ConnectionRegistry {
    pub fn new(config: &Config) -> Self {
        Self {
            path: config.registry_path(),
            lock_path: config.registry_lock_path(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All rows in file order. A missing file reads as empty; unparsable
    /// lines are skipped with a warning, never fatal.
    pub fn rows(&self) -> Result<Vec<RegistryRow>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(MuxError::Registry(format!("read registry: {}", e))),
        };

        let mut rows = Vec::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RegistryRow>(line) {
                Ok(row) => rows.push(row),
                Err(e) => warn!("[Registry] skipping unparsable row: {}", e),
            }
        }
        Ok(rows)
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.rows()?.len())
    }

    /// Register a connection: any existing row for the same id is replaced
    /// by a fresh one stamped with the current time.
    pub fn register(&self, target: &Target) -> Result<()> {
        let id = target.connection_id();
        let row = RegistryRow {
            connection_id: id.clone(),
            target: target.raw().to_string(),
            registered_at: Utc::now().timestamp(),
        };

        let _guard = RegistryLock::acquire(&self.lock_path)?;
        let mut rows = self.rows()?;
        rows.retain(|r| r.connection_id != id);
        rows.push(row);
        self.write_rows(&rows)?;
        debug!("[Registry] registered {} as {}", target, id);
        Ok(())
    }

    /// Remove the row for a target, if any. No-op when absent.
    pub fn unregister(&self, target: &Target) -> Result<()> {
        self.remove_id(&target.connection_id())?;
        Ok(())
    }

    /// Remove the row for an id. Returns whether a row was removed.
    pub fn remove_id(&self, id: &ConnectionId) -> Result<bool> {
        let _guard = RegistryLock::acquire(&self.lock_path)?;
        let mut rows = self.rows()?;
        let before = rows.len();
        rows.retain(|r| &r.connection_id != id);
        if rows.len() == before {
            return Ok(false);
        }
        self.write_rows(&rows)?;
        debug!("[Registry] removed {}", id);
        Ok(true)
    }

    /// Reverse lookup: the raw target string registered under an id.
    pub fn lookup_target(&self, id: &ConnectionId) -> Result<Option<String>> {
        Ok(self
            .rows()?
            .into_iter()
            .find(|r| &r.connection_id == id)
            .map(|r| r.target))
    }

    /// Registration time of an id, if tracked.
    pub fn lookup_registered_at(&self, id: &ConnectionId) -> Result<Option<i64>> {
        Ok(self
            .rows()?
            .into_iter()
            .find(|r| &r.connection_id == id)
            .map(|r| r.registered_at))
    }

    /// Keep only rows matching the predicate; returns how many were dropped.
    /// Runs the whole read-filter-write under the advisory lock.
    pub fn retain<F>(&self, mut keep: F) -> Result<usize>
    where
        F: FnMut(&RegistryRow) -> bool,
    {
        let _guard = RegistryLock::acquire(&self.lock_path)?;
        let rows = self.rows()?;
        let before = rows.len();
        let kept: Vec<RegistryRow> = rows.into_iter().filter(|r| keep(r)).collect();
        let dropped = before - kept.len();
        if dropped > 0 {
            self.write_rows(&kept)?;
        }
        Ok(dropped)
    }

    /// Every row joined with live health, cached device type, and a
    /// formatted registration time. Rows whose socket vanished are reported
    /// as disconnected but left in place for the sweeper.
    pub async fn list_detailed(
        &self,
        health: &HealthChecker,
        cache: &DeviceTypeCache,
    ) -> Result<Vec<ConnectionDetail>> {
        let mut details = Vec::new();
        for row in self.rows()? {
            let (healthy, device_type) = match Target::parse(&row.target) {
                Ok(target) => (
                    health.full_check(&target).await,
                    cache.get_valid(&target).await.ok(),
                ),
                // A row whose target no longer parses is reported, not
                // hidden; the sweeper reaps it together with its socket.
                Err(_) => (false, None),
            };
            details.push(ConnectionDetail {
                connection_id: row.connection_id.clone(),
                target: row.target.clone(),
                healthy,
                device_type,
                registered_at: row.registered_at,
                registered_at_display: format_timestamp(row.registered_at),
            });
        }
        Ok(details)
    }

    /// Rewrite the registry atomically: temp file, then rename.
    fn write_rows(&self, rows: &[RegistryRow]) -> Result<()> {
        let io_err = |e: std::io::Error| MuxError::Registry(format!("write registry: {}", e));
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let temp_path = self.path.with_extension("jsonl.tmp");
        let mut file = File::create(&temp_path).map_err(io_err)?;
        for row in rows {
            let line = serde_json::to_string(row)
                .map_err(|e| MuxError::Registry(format!("encode row: {}", e)))?;
            writeln!(file, "{}", line).map_err(io_err)?;
        }
        file.sync_all().map_err(io_err)?;
        std::fs::rename(&temp_path, &self.path).map_err(io_err)?;
        Ok(())
    }
}

fn format_timestamp(ts: i64) -> String {
    match Local.timestamp_opt(ts, 0).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => format!("@{}", ts),
    }
}
