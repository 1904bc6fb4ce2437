// Coordinator configuration.
//
// Connection settings are per shard; behavior tunables (lock timeout, retry
// budget, liveness cadence) live on the top-level config with defaults that
// match a local three-shard deployment.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{IsolationLevel, ShardId};

/// Connection settings for one shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    /// Bounded connect timeout in seconds (never more than 10).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

impl ShardConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.min(10))
    }
}

/// Top-level coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Shard id → connection settings.
    pub shards: BTreeMap<ShardId, ShardConfig>,

    /// The shard holding every row (authoritative for scans).
    pub central_shard: ShardId,

    /// Session isolation used when the caller does not specify one.
    pub isolation_default: IsolationLevel,

    /// Distributed lock acquisition timeout in seconds.
    pub lock_timeout_seconds: u64,

    /// Maximum replay attempts before a recovery entry is marked FAILED.
    pub max_recovery_retries: u32,

    /// Background liveness probe interval in seconds.
    pub liveness_interval_seconds: u64,

    /// Liveness snapshot cache TTL in seconds.
    pub liveness_cache_ttl_seconds: u64,

    /// Consecutive mutex-held drain skips before a warning is logged.
    pub mutex_warn_after: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        let mut shards = BTreeMap::new();
        for (id, port, database) in [
            (1u32, 3306u16, "node1_db"),
            (2, 3307, "node2_db"),
            (3, 3308, "node3_db"),
        ] {
            shards.insert(
                id,
                ShardConfig {
                    host: "localhost".to_string(),
                    port,
                    user: "user".to_string(),
                    password: "rootpass".to_string(),
                    database: database.to_string(),
                    connect_timeout_secs: 10,
                },
            );
        }
        Self {
            shards,
            central_shard: 1,
            isolation_default: IsolationLevel::RepeatableRead,
            lock_timeout_seconds: 30,
            max_recovery_retries: 3,
            liveness_interval_seconds: 5,
            liveness_cache_ttl_seconds: 2,
            mutex_warn_after: 10,
        }
    }
}

impl CoordinatorConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_seconds)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_seconds)
    }

    pub fn liveness_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.liveness_cache_ttl_seconds)
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.shards.keys().copied().collect()
    }
}

/// Generates a session identity distinct per application instance.
///
/// The identity is stored in `distributed_lock.holder_id` rows, so it must
/// survive as a plain string and stay unique across concurrent instances.
pub fn generate_session_id(prefix: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &id[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = CoordinatorConfig::default();
        assert_eq!(cfg.shard_ids(), vec![1, 2, 3]);
        assert_eq!(cfg.central_shard, 1);
        assert_eq!(cfg.lock_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.max_recovery_retries, 3);
    }

    #[test]
    fn test_connect_timeout_bounded() {
        let mut cfg = CoordinatorConfig::default();
        let shard = cfg.shards.get_mut(&1).unwrap();
        shard.connect_timeout_secs = 60;
        assert_eq!(shard.connect_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_session_ids_distinct() {
        let a = generate_session_id("app");
        let b = generate_session_id("app");
        assert_ne!(a, b);
        assert!(a.starts_with("app-"));
    }

    #[test]
    fn test_config_roundtrip() {
        let cfg = CoordinatorConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: CoordinatorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.shards.len(), 3);
        assert_eq!(back.isolation_default, IsolationLevel::RepeatableRead);
    }
}
