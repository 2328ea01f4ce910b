//! Common utilities and types shared across shardkv

pub mod config;
pub mod error;
pub mod hash;

pub use config::{
    ServerConfig, AWAIT_APPLY_TIMEOUT, CLIENT_RPC_TIMEOUT, CONFIG_POLL_INTERVAL,
    ELECTION_TIMEOUT_MAX_MS, ELECTION_TIMEOUT_MIN_MS, HEARTBEAT_INTERVAL, LEADER_PEER_TICK,
    MIGRATE_RETRY_DELAY, NSHARDS, SNAPSHOT_THRESHOLD_RATIO,
};
pub use error::{Error, Result};
pub use hash::{generate_client_id, key2shard};
