//! Configuration for shardkv replicas
//!
//! Protocol timing constants shared by every component, plus the serde
//! config describing one replica group.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Number of shards the key space is partitioned into.
///
/// Shared with the shard master; a key maps to `[0, NSHARDS)` via
/// [`crate::common::key2shard`].
pub const NSHARDS: usize = 10;

/// Leader heartbeat interval.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(90);

/// How often a leader's per-peer replication task wakes to check the
/// heartbeat deadline.
pub const LEADER_PEER_TICK: Duration = Duration::from_millis(5);

/// Election timeouts are drawn uniformly from `[ELECTION_TIMEOUT_MIN,
/// ELECTION_TIMEOUT_MAX)` milliseconds.
pub const ELECTION_TIMEOUT_MIN_MS: u64 = 500;
pub const ELECTION_TIMEOUT_MAX_MS: u64 = 800;

/// How long an RPC handler waits at the apply rendezvous before telling
/// the client to retry elsewhere.
pub const AWAIT_APPLY_TIMEOUT: Duration = Duration::from_millis(800);

/// Shard-master polling interval (leader only).
pub const CONFIG_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Per-RPC timeout used by the client proxy.
pub const CLIENT_RPC_TIMEOUT: Duration = Duration::from_millis(200);

/// Snapshot when the persisted Raft state reaches this fraction of
/// `max_raft_state`.
pub const SNAPSHOT_THRESHOLD_RATIO: f64 = 0.95;

/// Delay between full passes over a destination group during migration.
pub const MIGRATE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Configuration for one replica group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Group id (gid 0 is reserved for "no owner")
    pub gid: u64,

    /// Addresses of the group's replicas, in peer order
    pub servers: Vec<String>,

    /// Snapshot when Raft state reaches this size in bytes (-1 disables)
    #[serde(default = "default_max_raft_state")]
    pub max_raft_state: i64,

    /// Directory for per-replica persistent state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_max_raft_state() -> i64 {
    -1
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./shardkv-data")
}
fn default_log_level() -> String {
    "info".to_string()
}

impl ServerConfig {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save to file
    pub fn to_file(&self, path: impl AsRef<std::path::Path>) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.gid == 0 {
            return Err(crate::Error::InvalidConfig(
                "gid 0 is reserved for unowned shards".into(),
            ));
        }
        if self.servers.is_empty() {
            return Err(crate::Error::InvalidConfig("servers is required".into()));
        }
        if self.max_raft_state < -1 || self.max_raft_state == 0 {
            return Err(crate::Error::InvalidConfig(
                "max_raft_state must be positive or -1".into(),
            ));
        }
        Ok(())
    }
}
