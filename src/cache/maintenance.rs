//! Cache Maintenance
//!
//! Size-bounded eviction and an opportunistic warm pass. Both are
//! best-effort: eviction failures are reported to the caller only so it can
//! log them, and the warm pass swallows everything.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

/// Extra entries removed beyond the overage, so back-to-back saves don't
/// retrigger the pass on every write.
fn eviction_slack(max_entries: usize) -> usize {
    max_entries / 10 + 1
}

/// Delete oldest-by-mtime cache files until the count is comfortably under
/// `max_entries`. Returns how many files were removed.
pub async fn enforce_size_limit(dir: &Path, max_entries: usize) -> std::io::Result<usize> {
    let mut files = entry_files_by_mtime(dir)?;
    if files.len() <= max_entries {
        return Ok(0);
    }

    let overage = files.len() - max_entries;
    let to_remove = (overage + eviction_slack(max_entries)).min(files.len());
    files.truncate(to_remove);

    let mut removed = 0;
    for (path, _) in files {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            // Another process may have evicted it first.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!("[Cache] eviction of {:?} failed: {}", path, e),
        }
    }
    debug!("[Cache] size pass evicted {} entries", removed);
    Ok(removed)
}

/// Opportunistically read the most recently modified cache files to pull
/// them into the OS file cache. Contents are discarded; failures ignored.
pub async fn warm(dir: &Path, limit: usize) {
    let Ok(mut files) = entry_files_by_mtime(dir) else {
        return;
    };
    files.reverse(); // newest first
    for (path, _) in files.into_iter().take(limit) {
        let _ = tokio::fs::read(&path).await;
    }
}

/// Run [`warm`] on a detached task so the caller never waits on it.
pub fn spawn_warm(dir: PathBuf, limit: usize) {
    tokio::spawn(async move {
        warm(&dir, limit).await;
    });
}

/// Cache entry files sorted oldest-first by modification time.
fn entry_files_by_mtime(dir: &Path) -> std::io::Result<Vec<(PathBuf, SystemTime)>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut files = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let mtime = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        files.push((path, mtime));
    }
    files.sort_by_key(|(_, mtime)| *mtime);
    Ok(files)
}
