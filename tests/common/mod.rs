//! Test harness: multi-group clusters over the in-process network

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use shardkv::common::ServerConfig;
use shardkv::{
    Clerk, GroupId, GroupServer, LocalMaster, MemNetwork, Persister, ShardStatus, NSHARDS,
};

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct GroupReplicas {
    addrs: Vec<String>,
    servers: Vec<Option<Arc<GroupServer>>>,
}

pub struct TestCluster {
    pub net: Arc<MemNetwork>,
    pub master: Arc<LocalMaster>,
    groups: HashMap<GroupId, GroupReplicas>,
    dir: TempDir,
    max_raft_state: i64,
}

impl TestCluster {
    /// Bring up `replicas` servers for each listed group. No shards are
    /// owned until a configuration is installed.
    pub fn new(gids: &[GroupId], replicas: usize, max_raft_state: i64) -> Self {
        init_tracing();
        let mut cluster = Self {
            net: MemNetwork::new(),
            master: LocalMaster::new(),
            groups: HashMap::new(),
            dir: tempfile::tempdir().expect("tempdir"),
            max_raft_state,
        };
        for &gid in gids {
            let config = ServerConfig {
                gid,
                servers: (0..replicas).map(|i| format!("g{gid}-{i}")).collect(),
                max_raft_state,
                data_dir: cluster.dir.path().to_path_buf(),
                log_level: "debug".to_string(),
            };
            config.validate().expect("valid group config");
            cluster.groups.insert(
                gid,
                GroupReplicas {
                    addrs: config.servers,
                    servers: (0..replicas).map(|_| None).collect(),
                },
            );
            for i in 0..replicas {
                cluster.start_server(gid, i);
            }
        }
        cluster
    }

    fn persist_path(&self, gid: GroupId, i: usize) -> PathBuf {
        self.dir.path().join(format!("g{gid}-{i}.state"))
    }

    pub fn start_server(&mut self, gid: GroupId, i: usize) {
        let addrs = self.groups[&gid].addrs.clone();
        let peers = addrs.iter().map(|a| self.net.raft_end(a)).collect();
        let persister =
            Arc::new(Persister::open(self.persist_path(gid, i)).expect("open persister"));
        let server = GroupServer::new(
            gid,
            i,
            peers,
            persister,
            self.max_raft_state,
            self.master.clone(),
            self.net.clone(),
        )
        .expect("start group server");

        self.net.register_raft(&addrs[i], server.raft().clone());
        self.net.register_group(&addrs[i], server.clone());
        self.groups.get_mut(&gid).unwrap().servers[i] = Some(server);
    }

    pub fn kill_server(&mut self, gid: GroupId, i: usize) {
        let addr = self.groups[&gid].addrs[i].clone();
        self.net.remove(&addr);
        if let Some(server) = self.groups.get_mut(&gid).unwrap().servers[i].take() {
            server.kill();
        }
    }

    pub async fn restart_server(&mut self, gid: GroupId, i: usize) {
        self.kill_server(gid, i);
        // Let the old replica's tasks observe the shutdown before the
        // restarted one reopens the same persister file.
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.start_server(gid, i);
    }

    pub fn server(&self, gid: GroupId, i: usize) -> Option<Arc<GroupServer>> {
        self.groups[&gid].servers[i].clone()
    }

    pub fn replica_count(&self, gid: GroupId) -> usize {
        self.groups[&gid].addrs.len()
    }

    pub fn live_servers(&self, gid: GroupId) -> Vec<Arc<GroupServer>> {
        self.groups[&gid].servers.iter().flatten().cloned().collect()
    }

    /// Install the next configuration assigning shards per `assignment`.
    /// Every group of the cluster is listed in the membership table.
    pub fn install_config(&self, assignment: [GroupId; NSHARDS]) -> u64 {
        let groups = self
            .groups
            .iter()
            .map(|(gid, replicas)| (*gid, replicas.addrs.clone()))
            .collect();
        self.master.install(assignment, groups)
    }

    pub fn clerk(&self) -> Clerk {
        Clerk::new(self.master.clone(), self.net.clone())
    }

    /// Index of the current leader of `gid`, waiting for one to emerge.
    pub async fn wait_for_leader(&self, gid: GroupId) -> usize {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            for (i, server) in self.groups[&gid].servers.iter().enumerate() {
                if let Some(server) = server {
                    if server.raft().is_leader() {
                        return i;
                    }
                }
            }
            if tokio::time::Instant::now() > deadline {
                panic!("no leader elected for group {gid}");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Wait until every live replica of every group has absorbed
    /// configuration `num` and no shard is mid-transfer.
    pub async fn wait_for_config(&self, num: u64) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        loop {
            let settled = self.groups.values().all(|replicas| {
                replicas.servers.iter().flatten().all(|server| {
                    server.latest_config_num() == num && !server.transfer_in_progress()
                })
            });
            if settled {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("cluster did not settle on configuration {num}");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Invariant: at any quiescent instant, each shard is available (or
    /// still exporting) at exactly one group.
    pub fn assert_single_owner_per_shard(&self) {
        for shard in 0..NSHARDS {
            let mut owners = Vec::new();
            for (gid, replicas) in &self.groups {
                // Sample one live replica per group; quiesced replicas agree.
                if let Some(server) = replicas.servers.iter().flatten().next() {
                    let status = server.shard_status(shard);
                    if matches!(status, ShardStatus::Available | ShardStatus::Exporting) {
                        owners.push(*gid);
                    }
                }
            }
            assert_eq!(
                owners.len(),
                1,
                "shard {shard} owned by {owners:?}, expected exactly one group"
            );
        }
    }
}
