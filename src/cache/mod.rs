//! Device-Type Cache
//!
//! Remembers the classification result (OS/platform family) for each target
//! across invocations, one JSON file per target keyed by the connection id.
//!
//! # Design
//! - Entries carry a format version; only entries matching
//!   [`CACHE_VERSION`] are honored.
//! - Writes are atomic (temp file + rename) so a reader never observes a
//!   half-written entry.
//! - Corruption self-heals: an unreadable, unparsable, or version-mismatched
//!   file is deleted and treated as a miss, forcing re-detection rather than
//!   trusting unreadable state.
//! - Every save runs the size-management pass first (see [`maintenance`]).

pub mod maintenance;

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{MuxError, Result};
use crate::ssh::target::Target;

/// Current cache entry format version. Entries written by other versions are
/// discarded on load.
pub const CACHE_VERSION: u32 = 2;

/// One cached classification result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub device_type: String,
    /// Unix seconds of the detection that produced this entry.
    pub detected_at: i64,
    /// How the classification was obtained ("probe", "rule", "ai", ...).
    pub method: String,
    pub version: u32,
    /// The raw target string the entry belongs to.
    pub target: String,
}

/// Cache population counts, partitioned by entry state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub valid: usize,
    pub expired: usize,
    pub invalid: usize,
    pub ttl_secs: u64,
    pub location: PathBuf,
}

pub struct DeviceTypeCache {
    config: Config,
}

impl DeviceTypeCache {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn dir(&self) -> &Path {
        &self.config.cache_dir
    }

    fn entry_path(&self, target: &Target) -> PathBuf {
        self.config
            .cache_dir
            .join(format!("{}.json", target.connection_id()))
    }

    /// Persist a classification result for a target, overwriting any
    /// previous entry. On I/O failure prior content is left untouched.
    pub async fn save(&self, target: &Target, device_type: &str, method: &str) -> Result<()> {
        // Size cap first, so the cache never grows past its bound. Its
        // failure must not block the save.
        if let Err(e) =
            maintenance::enforce_size_limit(&self.config.cache_dir, self.config.cache_max_entries)
                .await
        {
            warn!("[Cache] size enforcement failed: {}", e);
        }

        let entry = CacheEntry {
            device_type: device_type.to_string(),
            detected_at: Utc::now().timestamp(),
            method: method.to_string(),
            version: CACHE_VERSION,
            target: target.raw().to_string(),
        };

        self.write_atomic(target, &entry)
            .await
            .map_err(|source| MuxError::CacheWriteFailed {
                target: target.raw().to_string(),
                source,
            })
    }

    async fn write_atomic(&self, target: &Target, entry: &CacheEntry) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.config.cache_dir).await?;

        let path = self.entry_path(target);
        let temp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        tokio::fs::rename(&temp_path, &path).await?;

        debug!("[Cache] saved {} = {}", target, entry.device_type);
        Ok(())
    }

    /// Load the entry for a target.
    ///
    /// Returns `None` for an absent, unreadable, unparsable, or
    /// version-mismatched file; every such file except an absent one is
    /// deleted as a side effect so the next detection starts clean.
    pub async fn load(&self, target: &Target) -> Option<CacheEntry> {
        let path = self.entry_path(target);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                debug!("[Cache] unreadable entry {:?}: {}", path, e);
                self.discard(&path).await;
                return None;
            }
        };

        let entry: CacheEntry = match serde_json::from_str(&contents) {
            Ok(entry) => entry,
            Err(e) => {
                debug!("[Cache] unparsable entry {:?}: {}", path, e);
                self.discard(&path).await;
                return None;
            }
        };

        if entry.version != CACHE_VERSION {
            debug!(
                "[Cache] version mismatch for {:?}: {} != {}",
                path, entry.version, CACHE_VERSION
            );
            self.discard(&path).await;
            return None;
        }
        if entry.device_type.is_empty() {
            self.discard(&path).await;
            return None;
        }

        Some(entry)
    }

    async fn discard(&self, path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("[Cache] failed to delete stale entry {:?}: {}", path, e);
            }
        }
    }

    /// Whether the entry for a target is past its TTL. Missing or
    /// unreadable entries count as expired: re-detection over trust.
    pub async fn is_expired(&self, target: &Target) -> bool {
        match self.load(target).await {
            Some(entry) => entry_expired(&entry, self.config.cache_ttl.as_secs()),
            None => true,
        }
    }

    /// The cached device type, only if present, parsable, and fresh.
    pub async fn get_valid(&self, target: &Target) -> Result<String> {
        match self.load(target).await {
            Some(entry) if !entry_expired(&entry, self.config.cache_ttl.as_secs()) => {
                Ok(entry.device_type)
            }
            _ => Err(MuxError::CacheMiss(target.raw().to_string())),
        }
    }

    /// Delete the entry for a target. Returns whether one existed.
    pub async fn clear(&self, target: &Target) -> Result<bool> {
        match tokio::fs::remove_file(self.entry_path(target)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Every parsable, version-matching entry in the cache directory.
    pub async fn list_all(&self) -> Result<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        for path in self.entry_files()? {
            let Ok(contents) = std::fs::read_to_string(&path) else {
                continue;
            };
            if let Ok(entry) = serde_json::from_str::<CacheEntry>(&contents) {
                if entry.version == CACHE_VERSION {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }

    /// Population counts partitioned into valid / expired / structurally
    /// invalid, plus the configured TTL and storage location.
    pub async fn stats(&self) -> Result<CacheStats> {
        let ttl_secs = self.config.cache_ttl.as_secs();
        let mut stats = CacheStats {
            valid: 0,
            expired: 0,
            invalid: 0,
            ttl_secs,
            location: self.config.cache_dir.clone(),
        };

        for path in self.entry_files()? {
            let parsed = std::fs::read_to_string(&path)
                .ok()
                .and_then(|c| serde_json::from_str::<CacheEntry>(&c).ok())
                .filter(|e| e.version == CACHE_VERSION && !e.device_type.is_empty());
            match parsed {
                Some(entry) if entry_expired(&entry, ttl_secs) => stats.expired += 1,
                Some(_) => stats.valid += 1,
                None => stats.invalid += 1,
            }
        }
        Ok(stats)
    }

    /// Kick off a detached warm pass over the most recently used entries.
    /// Purely a first-read latency optimization; failures are ignored.
    pub fn spawn_warm(&self) {
        maintenance::spawn_warm(self.config.cache_dir.clone(), self.config.warm_limit);
    }

    fn entry_files(&self) -> Result<Vec<PathBuf>> {
        let entries = match std::fs::read_dir(&self.config.cache_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect())
    }
}

fn entry_expired(entry: &CacheEntry, ttl_secs: u64) -> bool {
    let age = Utc::now().timestamp().saturating_sub(entry.detected_at);
    age > ttl_secs as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_cache(dir: &Path) -> DeviceTypeCache {
        let mut config = Config::default();
        config.cache_dir = dir.to_path_buf();
        DeviceTypeCache::new(config)
    }

    fn test_cache_with_ttl(dir: &Path, ttl: Duration) -> DeviceTypeCache {
        let mut config = Config::default();
        config.cache_dir = dir.to_path_buf();
        config.cache_ttl = ttl;
        DeviceTypeCache::new(config)
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let temp = tempfile::tempdir().unwrap();
        let cache = test_cache(temp.path());
        let target = Target::parse("root@web1").unwrap();

        cache.save(&target, "linux", "ai").await.unwrap();

        let entry = cache.load(&target).await.unwrap();
        assert_eq!(entry.device_type, "linux");
        assert_eq!(entry.method, "ai");
        assert_eq!(entry.version, CACHE_VERSION);
        assert_eq!(entry.target, "root@web1");

        assert_eq!(cache.get_valid(&target).await.unwrap(), "linux");
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let temp = tempfile::tempdir().unwrap();
        let cache = test_cache(temp.path());
        let target = Target::parse("root@web1").unwrap();
        assert!(cache.load(&target).await.is_none());
        assert!(cache.is_expired(&target).await);
    }

    #[tokio::test]
    async fn test_version_mismatch_is_miss_and_deletes() {
        let temp = tempfile::tempdir().unwrap();
        let cache = test_cache(temp.path());
        let target = Target::parse("root@web1").unwrap();

        cache.save(&target, "linux", "probe").await.unwrap();

        // Rewrite the entry with a stale version stamp.
        let path = cache.entry_path(&target);
        let mut entry: CacheEntry =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        entry.version = CACHE_VERSION - 1;
        std::fs::write(&path, serde_json::to_string(&entry).unwrap()).unwrap();

        assert!(cache.load(&target).await.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_garbage_entry_is_miss_and_deletes() {
        let temp = tempfile::tempdir().unwrap();
        let cache = test_cache(temp.path());
        let target = Target::parse("root@web1").unwrap();

        let path = cache.entry_path(&target);
        std::fs::create_dir_all(temp.path()).unwrap();
        std::fs::write(&path, "{ truncated").unwrap();

        assert!(cache.load(&target).await.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let temp = tempfile::tempdir().unwrap();
        let cache = test_cache_with_ttl(temp.path(), Duration::from_secs(86_400));
        let target = Target::parse("root@web1").unwrap();

        cache.save(&target, "linux", "probe").await.unwrap();

        // Backdate the entry beyond the TTL.
        let path = cache.entry_path(&target);
        let mut entry: CacheEntry =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        entry.detected_at = Utc::now().timestamp() - 90_000;
        std::fs::write(&path, serde_json::to_string(&entry).unwrap()).unwrap();

        assert!(cache.is_expired(&target).await);
        assert!(matches!(
            cache.get_valid(&target).await,
            Err(MuxError::CacheMiss(_))
        ));
    }

    #[tokio::test]
    async fn test_recent_entry_is_valid() {
        let temp = tempfile::tempdir().unwrap();
        let cache = test_cache_with_ttl(temp.path(), Duration::from_secs(86_400));
        let target = Target::parse("root@web1").unwrap();

        cache.save(&target, "linux", "probe").await.unwrap();

        let path = cache.entry_path(&target);
        let mut entry: CacheEntry =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        entry.detected_at = Utc::now().timestamp() - 1000;
        std::fs::write(&path, serde_json::to_string(&entry).unwrap()).unwrap();

        assert!(!cache.is_expired(&target).await);
        assert_eq!(cache.get_valid(&target).await.unwrap(), "linux");
    }

    #[tokio::test]
    async fn test_clear() {
        let temp = tempfile::tempdir().unwrap();
        let cache = test_cache(temp.path());
        let target = Target::parse("root@web1").unwrap();

        assert!(!cache.clear(&target).await.unwrap());
        cache.save(&target, "linux", "probe").await.unwrap();
        assert!(cache.clear(&target).await.unwrap());
        assert!(cache.load(&target).await.is_none());
    }

    #[tokio::test]
    async fn test_stats_partitions() {
        let temp = tempfile::tempdir().unwrap();
        let cache = test_cache_with_ttl(temp.path(), Duration::from_secs(86_400));

        let valid = Target::parse("root@valid").unwrap();
        cache.save(&valid, "linux", "probe").await.unwrap();

        let expired = Target::parse("root@expired").unwrap();
        cache.save(&expired, "macos", "probe").await.unwrap();
        let path = cache.entry_path(&expired);
        let mut entry: CacheEntry =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        entry.detected_at = Utc::now().timestamp() - 90_000;
        std::fs::write(&path, serde_json::to_string(&entry).unwrap()).unwrap();

        std::fs::write(temp.path().join("deadbeef.json"), "garbage").unwrap();

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.valid, 1);
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.invalid, 1);
        assert_eq!(stats.ttl_secs, 86_400);
        assert_eq!(stats.location, temp.path());
    }

    #[tokio::test]
    async fn test_list_all_skips_invalid() {
        let temp = tempfile::tempdir().unwrap();
        let cache = test_cache(temp.path());
        let target = Target::parse("root@web1").unwrap();
        cache.save(&target, "linux", "probe").await.unwrap();
        std::fs::write(temp.path().join("junk.json"), "garbage").unwrap();

        let all = cache.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].device_type, "linux");
    }
}
