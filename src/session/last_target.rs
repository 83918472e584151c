//! Last Target Tracking
//!
//! Single-slot durable pointer to the most recently connected target, used
//! as a default when callers omit one. Falls back to the registry row with
//! the newest `registered_at` when the slot is empty.

use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::registry::ConnectionRegistry;
use crate::config::Config;
use crate::error::{MuxError, Result};
use crate::ssh::target::Target;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LastTargetRecord {
    target: String,
    /// Unix seconds when the slot was written.
    set_at: i64,
}

pub struct LastTargetTracker {
    path: PathBuf,
    registry: ConnectionRegistry,
}

impl LastTargetTracker {
    pub fn new(config: &Config) -> Self {
        Self {
            path: config.last_target_path(),
            registry: ConnectionRegistry::new(config),
        }
    }

    /// Overwrite the slot with this target. Atomic: temp file, then rename.
    pub fn set(&self, target: &Target) -> Result<()> {
        let record = LastTargetRecord {
            target: target.raw().to_string(),
            set_at: Utc::now().timestamp(),
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string(&record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&temp_path, json)?;
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    /// The most recent target: the slot if present, otherwise the newest
    /// registry row. Fails with [`MuxError::NoLastTarget`] only when both
    /// sources are empty.
    pub fn get(&self) -> Result<String> {
        if let Some(target) = self.read_slot() {
            return Ok(target);
        }

        let newest = self
            .registry
            .rows()?
            .into_iter()
            .max_by_key(|r| r.registered_at)
            .map(|r| r.target);
        newest.ok_or(MuxError::NoLastTarget)
    }

    /// Read the slot; a corrupt record is deleted and treated as absent.
    fn read_slot(&self) -> Option<String> {
        let contents = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str::<LastTargetRecord>(&contents) {
            Ok(record) => Some(record.target),
            Err(e) => {
                debug!("[LastTarget] corrupt slot, discarding: {}", e);
                let _ = std::fs::remove_file(&self.path);
                None
            }
        }
    }
}
