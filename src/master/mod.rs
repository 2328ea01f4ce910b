//! Shard master interface
//!
//! The shard master is an external oracle producing a monotonically numbered
//! sequence of shard-to-group assignments. Replica groups and clients consume
//! it through the [`ShardMaster`] trait; [`LocalMaster`] is the in-process
//! implementation used by the test harness, fed an explicit configuration
//! sequence (the placement algorithm itself lives outside this crate).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::common::{Result, NSHARDS};

/// Replica-group identifier. Gid 0 is reserved: a shard assigned to group 0
/// has no owner.
pub type GroupId = u64;

/// A versioned shard-to-group assignment plus group membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Strictly increasing version; 0 is the pre-initial zero configuration.
    pub num: u64,
    /// Owner group per shard.
    pub shards: [GroupId; NSHARDS],
    /// Servers of each serving group.
    pub groups: HashMap<GroupId, Vec<String>>,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            num: 0,
            shards: [0; NSHARDS],
            groups: HashMap::new(),
        }
    }
}

impl ShardConfig {
    /// The group owning `shard` under this configuration.
    pub fn owner(&self, shard: usize) -> GroupId {
        self.shards[shard]
    }
}

/// Consumed interface of the shard master.
#[async_trait]
pub trait ShardMaster: Send + Sync {
    /// Fetch configuration `num`; `-1` (or any number past the newest)
    /// yields the newest.
    async fn query(&self, num: i64) -> Result<ShardConfig>;
}

/// In-process shard master serving a test-driven configuration sequence.
pub struct LocalMaster {
    configs: RwLock<Vec<ShardConfig>>,
}

impl LocalMaster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            configs: RwLock::new(vec![ShardConfig::default()]),
        })
    }

    /// Append the next configuration; returns its number.
    pub fn install(
        &self,
        shards: [GroupId; NSHARDS],
        groups: HashMap<GroupId, Vec<String>>,
    ) -> u64 {
        let mut configs = self.configs.write().unwrap();
        let num = configs.len() as u64;
        configs.push(ShardConfig {
            num,
            shards,
            groups,
        });
        num
    }

    pub fn latest_num(&self) -> u64 {
        self.configs.read().unwrap().len() as u64 - 1
    }
}

#[async_trait]
impl ShardMaster for LocalMaster {
    async fn query(&self, num: i64) -> Result<ShardConfig> {
        let configs = self.configs.read().unwrap();
        if num < 0 || num as usize >= configs.len() {
            Ok(configs.last().cloned().unwrap_or_default())
        } else {
            Ok(configs[num as usize].clone())
        }
    }
}
