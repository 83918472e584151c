//! Connection Pool Capacity
//!
//! Hard cap on concurrently tracked connections, enforced across process
//! restarts through the durable registry: oldest registrations are evicted
//! first, and their sockets torn down.

use tracing::info;

use super::registry::{ConnectionRegistry, RegistryRow};
use super::sweeper::Sweeper;
use crate::config::Config;
use crate::error::Result;
use crate::ssh::target::Target;

pub struct PoolManager {
    registry: ConnectionRegistry,
    sweeper: Sweeper,
}

impl PoolManager {
    pub fn new(config: Config) -> Self {
        Self {
            registry: ConnectionRegistry::new(&config),
            sweeper: Sweeper::new(config),
        }
    }

    /// Bring the registry back under `max_connections` rows, evicting the
    /// smallest `registered_at` first. Returns the evicted rows.
    ///
    /// Invoked on every successful registration; concurrent enforcement
    /// from other processes is redundant but safe (deletes are idempotent).
    pub async fn enforce_capacity(&self, max_connections: usize) -> Result<Vec<RegistryRow>> {
        let mut rows = self.registry.rows()?;
        if rows.len() <= max_connections {
            return Ok(Vec::new());
        }

        rows.sort_by_key(|r| r.registered_at);
        let overage = rows.len() - max_connections;
        let evicted: Vec<RegistryRow> = rows.drain(..overage).collect();

        for row in &evicted {
            info!(
                "[Pool] evicting {} (registered at {})",
                row.target, row.registered_at
            );
            self.registry.remove_id(&row.connection_id)?;
            let target = Target::parse(&row.target).ok();
            self.sweeper
                .remove_connection(&row.connection_id, target.as_ref())
                .await;
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.socket_dir = dir.to_path_buf();
        config.cache_dir = dir.join("cache");
        config.check_timeout = std::time::Duration::from_secs(2);
        config
    }

    fn backdate(registry: &ConnectionRegistry, target: &Target, ts: i64) {
        // Rewrite the row with a controlled timestamp.
        let path = registry.path().to_path_buf();
        let contents = std::fs::read_to_string(&path).unwrap();
        let rewritten: Vec<String> = contents
            .lines()
            .map(|line| {
                let mut row: RegistryRow = serde_json::from_str(line).unwrap();
                if row.target == target.raw() {
                    row.registered_at = ts;
                }
                serde_json::to_string(&row).unwrap()
            })
            .collect();
        std::fs::write(&path, rewritten.join("\n") + "\n").unwrap();
    }

    #[tokio::test]
    async fn test_under_capacity_is_untouched() {
        let temp = tempfile::tempdir().unwrap();
        let config = test_config(temp.path());
        let registry = ConnectionRegistry::new(&config);
        registry.register(&Target::parse("root@a").unwrap()).unwrap();

        let evicted = PoolManager::new(config).enforce_capacity(5).await.unwrap();
        assert!(evicted.is_empty());
        assert_eq!(registry.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_evicts_oldest_first() {
        let temp = tempfile::tempdir().unwrap();
        let config = test_config(temp.path());
        let registry = ConnectionRegistry::new(&config);

        let old = Target::parse("root@old").unwrap();
        let mid = Target::parse("root@mid").unwrap();
        let new = Target::parse("root@new").unwrap();
        for t in [&old, &mid, &new] {
            registry.register(t).unwrap();
        }
        backdate(&registry, &old, 1_000);
        backdate(&registry, &mid, 2_000);
        backdate(&registry, &new, 3_000);

        let evicted = PoolManager::new(config).enforce_capacity(2).await.unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].target, "root@old");

        let remaining: Vec<String> = registry
            .rows()
            .unwrap()
            .into_iter()
            .map(|r| r.target)
            .collect();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.contains(&"root@mid".to_string()));
        assert!(remaining.contains(&"root@new".to_string()));
    }

    #[tokio::test]
    async fn test_never_leaves_more_than_max() {
        let temp = tempfile::tempdir().unwrap();
        let config = test_config(temp.path());
        let registry = ConnectionRegistry::new(&config);

        for i in 0..6 {
            let target = Target::parse(&format!("root@host{}", i)).unwrap();
            registry.register(&target).unwrap();
            backdate(&registry, &target, 1_000 + i);
        }

        PoolManager::new(config).enforce_capacity(3).await.unwrap();
        assert_eq!(registry.count().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_eviction_removes_socket_file() {
        let temp = tempfile::tempdir().unwrap();
        let config = test_config(temp.path());
        let registry = ConnectionRegistry::new(&config);
        let store = crate::ssh::control::ControlSocketStore::new(&config);
        store.ensure_dir().await.unwrap();

        let old = Target::parse("root@old").unwrap();
        let new = Target::parse("root@new").unwrap();
        registry.register(&old).unwrap();
        registry.register(&new).unwrap();
        backdate(&registry, &old, 1_000);
        backdate(&registry, &new, 2_000);
        std::fs::write(store.socket_path(&old.connection_id()), b"").unwrap();

        PoolManager::new(config).enforce_capacity(1).await.unwrap();
        assert!(!store.socket_exists(&old.connection_id()));
    }
}
