//! Replicated commands and the group RPC messages
//!
//! Every state change in a group travels the Raft log as an [`Op`],
//! including shard hand-off completions: that is the only way all replicas
//! observe the same ordering of shard transitions relative to client writes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::common::Result;
use crate::master::ShardConfig;

/// A command in the Raft log, matched exhaustively at apply time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    Get {
        key: String,
        client_id: u64,
        serial: u64,
    },
    Put {
        key: String,
        value: String,
        client_id: u64,
        serial: u64,
    },
    Append {
        key: String,
        value: String,
        client_id: u64,
        serial: u64,
    },
    /// Absorb the next configuration. Carries the full payload so applying
    /// it never reads from the shard master and stays deterministic across
    /// replicas.
    ApplyConfig { config: ShardConfig },
    /// The destination group confirmed receipt of `shard`; drop it locally.
    ExportComplete {
        shard: usize,
        cfg: u64,
        kvmap: HashMap<String, String>,
    },
    /// Merge a received shard and start serving it.
    ImportComplete {
        shard: usize,
        cfg: u64,
        kvmap: HashMap<String, String>,
        duplicates: HashMap<u64, u64>,
    },
}

impl Op {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Error tags surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrCode {
    Ok,
    NoKey,
    WrongGroup,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetArgs {
    pub key: String,
    pub client_id: u64,
    pub serial: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetReply {
    pub wrong_leader: bool,
    pub err: ErrCode,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PutAppendOp {
    Put,
    Append,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutAppendArgs {
    pub key: String,
    pub value: String,
    pub op: PutAppendOp,
    pub client_id: u64,
    pub serial: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutAppendReply {
    pub wrong_leader: bool,
    pub err: ErrCode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateShardArgs {
    pub config_version: u64,
    pub shard: usize,
    pub kvmap: HashMap<String, String>,
    pub duplicates: HashMap<u64, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateShardReply {
    pub wrong_leader: bool,
    pub err: ErrCode,
}
