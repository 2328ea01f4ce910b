//! Replicated key-value state machine
//!
//! One [`KvState`] per replica, mutated only by the apply task, in log
//! order. Two replicas that have applied the same log prefix hold identical
//! state: the map, the per-shard duplicate table, the shard status array,
//! and the latest absorbed configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::common::{key2shard, Result, NSHARDS};
use crate::group::op::Op;
use crate::master::{GroupId, ShardConfig};

/// Where a shard stands at this group, driven only by applied commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardStatus {
    /// Owned and serving.
    Available,
    /// Lost in the latest configuration; hand-off to the new owner pending.
    Exporting,
    /// Gained in the latest configuration; waiting for the previous owner's
    /// data.
    Importing,
    /// Not ours.
    NotOwned,
}

impl std::fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardStatus::Available => write!(f, "available"),
            ShardStatus::Exporting => write!(f, "exporting"),
            ShardStatus::Importing => write!(f, "importing"),
            ShardStatus::NotOwned => write!(f, "notowned"),
        }
    }
}

/// A shard hand-off the leader must drive after absorbing a configuration.
#[derive(Debug, Clone)]
pub struct ExportTask {
    pub shard: usize,
    pub cfg: u64,
    pub dest_gid: GroupId,
    pub servers: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotBlob {
    kvmap: HashMap<String, String>,
    snapshot_index: u64,
    duplicates: Vec<HashMap<u64, u64>>,
    status: [ShardStatus; NSHARDS],
    latest_cfg: ShardConfig,
}

pub struct KvState {
    gid: GroupId,
    kvmap: HashMap<String, String>,
    /// Per shard: client id → last applied serial. Travels with the shard
    /// on migration.
    duplicates: Vec<HashMap<u64, u64>>,
    status: [ShardStatus; NSHARDS],
    latest_cfg: ShardConfig,
    snapshot_index: u64,
}

impl KvState {
    pub fn new(gid: GroupId) -> Self {
        Self {
            gid,
            kvmap: HashMap::new(),
            duplicates: vec![HashMap::new(); NSHARDS],
            status: [ShardStatus::NotOwned; NSHARDS],
            latest_cfg: ShardConfig::default(),
            snapshot_index: 0,
        }
    }

    pub fn status(&self, shard: usize) -> ShardStatus {
        self.status[shard]
    }

    pub fn status_for_key(&self, key: &str) -> ShardStatus {
        self.status[key2shard(key)]
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.kvmap.get(key)
    }

    pub fn latest_cfg(&self) -> &ShardConfig {
        &self.latest_cfg
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    pub fn transfer_in_progress(&self) -> bool {
        self.status
            .iter()
            .any(|s| matches!(s, ShardStatus::Exporting | ShardStatus::Importing))
    }

    /// Every key of `shard` held locally.
    pub fn shard_data(&self, shard: usize) -> HashMap<String, String> {
        self.kvmap
            .iter()
            .filter(|(k, _)| key2shard(k) == shard)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn shard_duplicates(&self, shard: usize) -> HashMap<u64, u64> {
        self.duplicates[shard].clone()
    }

    /// Apply a `Put` or `Append`, suppressing client retries.
    ///
    /// The shard must be available or still exporting; an op that slipped
    /// past a reconfiguration is dropped rather than planted in a shard this
    /// group no longer holds.
    pub fn apply_client_op(&mut self, op: &Op) {
        let (key, value, client_id, serial, append) = match op {
            Op::Put {
                key,
                value,
                client_id,
                serial,
            } => (key, value, *client_id, *serial, false),
            Op::Append {
                key,
                value,
                client_id,
                serial,
            } => (key, value, *client_id, *serial, true),
            _ => return,
        };

        let shard = key2shard(key);
        if !matches!(
            self.status[shard],
            ShardStatus::Available | ShardStatus::Exporting
        ) {
            debug!(
                gid = self.gid,
                shard,
                status = %self.status[shard],
                "dropping write to a shard this group does not hold"
            );
            return;
        }
        if self.duplicates[shard].get(&client_id) == Some(&serial) {
            return;
        }

        if append {
            self.kvmap
                .entry(key.clone())
                .or_default()
                .push_str(value);
        } else {
            self.kvmap.insert(key.clone(), value.clone());
        }
        self.duplicates[shard].insert(client_id, serial);
    }

    /// Absorb a configuration, strictly in order and only at quiescence.
    ///
    /// Returns the hand-offs to start; the caller drives them only on the
    /// Raft leader.
    pub fn apply_config(&mut self, cfg: &ShardConfig) -> Vec<ExportTask> {
        if cfg.num != self.latest_cfg.num + 1 || self.transfer_in_progress() {
            return Vec::new();
        }
        self.absorb_config(cfg)
    }

    fn absorb_config(&mut self, cfg: &ShardConfig) -> Vec<ExportTask> {
        let mut exports = Vec::new();
        for shard in 0..NSHARDS {
            let old = self.latest_cfg.shards[shard];
            let new = cfg.shards[shard];
            let status = self.status[shard];

            if old == self.gid && new != self.gid {
                match status {
                    ShardStatus::Available => {
                        self.status[shard] = ShardStatus::Exporting;
                        info!(gid = self.gid, shard, dest = new, cfg = cfg.num, "shard lost, exporting");
                        exports.push(ExportTask {
                            shard,
                            cfg: cfg.num,
                            dest_gid: new,
                            servers: cfg.groups.get(&new).cloned().unwrap_or_default(),
                        });
                    }
                    ShardStatus::Importing => {
                        // The transfer was retracted before its data arrived.
                        info!(gid = self.gid, shard, owner = new, "in-flight import superseded");
                        self.status[shard] = ShardStatus::NotOwned;
                    }
                    _ => {
                        warn!(
                            gid = self.gid,
                            shard,
                            status = %status,
                            "lost a shard that was not available; marking not owned"
                        );
                        self.status[shard] = ShardStatus::NotOwned;
                    }
                }
            } else if old != self.gid && new == self.gid && status == ShardStatus::NotOwned {
                if old == 0 {
                    // First owner; there is nothing to migrate.
                    self.status[shard] = ShardStatus::Available;
                    info!(gid = self.gid, shard, cfg = cfg.num, "shard created");
                } else {
                    self.status[shard] = ShardStatus::Importing;
                    info!(gid = self.gid, shard, from = old, cfg = cfg.num, "shard gained, importing");
                }
            }
        }

        self.latest_cfg = cfg.clone();
        exports
    }

    /// The destination confirmed the shard; delete its keys here.
    ///
    /// Deletion goes by shard membership of the local map, so writes that
    /// landed between the migration send and this completion cannot leak.
    pub fn export_complete(&mut self, shard: usize, cfg: u64) {
        if self.status[shard] == ShardStatus::Exporting {
            self.kvmap.retain(|k, _| key2shard(k) != shard);
            self.status[shard] = ShardStatus::NotOwned;
            info!(gid = self.gid, shard, cfg, "export complete");
        } else {
            warn!(
                gid = self.gid,
                shard,
                status = %self.status[shard],
                "export completion for a shard not exporting"
            );
        }
    }

    /// Merge a received shard and open it for serving.
    pub fn import_complete(
        &mut self,
        shard: usize,
        cfg: u64,
        kvmap: &HashMap<String, String>,
        duplicates: &HashMap<u64, u64>,
    ) {
        if self.status[shard] == ShardStatus::Importing {
            for (k, v) in kvmap {
                if key2shard(k) == shard {
                    self.kvmap.insert(k.clone(), v.clone());
                }
            }
            for (client, serial) in duplicates {
                self.duplicates[shard].insert(*client, *serial);
            }
            info!(gid = self.gid, shard, cfg, "import complete");
        } else {
            // Rare: a duplicate completion or a superseded transfer whose
            // data arrived anyway. Take the data and repair to available.
            warn!(
                gid = self.gid,
                shard,
                status = %self.status[shard],
                "import completion while not importing; forcing available"
            );
            for (k, v) in kvmap {
                if key2shard(k) == shard {
                    self.kvmap.insert(k.clone(), v.clone());
                }
            }
        }
        self.status[shard] = ShardStatus::Available;
    }

    // === Snapshots ===

    pub fn encode_snapshot(&mut self, at_index: u64) -> Result<Vec<u8>> {
        self.snapshot_index = at_index;
        let blob = SnapshotBlob {
            kvmap: self.kvmap.clone(),
            snapshot_index: self.snapshot_index,
            duplicates: self.duplicates.clone(),
            status: self.status,
            latest_cfg: self.latest_cfg.clone(),
        };
        Ok(serde_json::to_vec(&blob)?)
    }

    pub fn load_snapshot(&mut self, data: &[u8]) -> Result<()> {
        let blob: SnapshotBlob = serde_json::from_slice(data)?;
        self.kvmap = blob.kvmap;
        self.snapshot_index = blob.snapshot_index;
        self.duplicates = blob.duplicates;
        self.status = blob.status;
        self.latest_cfg = blob.latest_cfg;
        Ok(())
    }
}
