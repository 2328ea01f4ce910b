//! In-process network for clusters under test
//!
//! Endpoints resolve their target at every call, so unregistering a replica
//! makes it unreachable mid-flight, the way a crashed process would be. The
//! same address can carry both a Raft endpoint and a group endpoint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::common::{Error, Result};
use crate::group::server::GroupServer;
use crate::net::{GroupRpc, RaftTransport, Resolver};
use crate::raft::message::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply,
    RequestVoteArgs, RequestVoteReply,
};
use crate::raft::Raft;

#[derive(Default)]
struct Registry {
    rafts: HashMap<String, Arc<Raft>>,
    groups: HashMap<String, Arc<GroupServer>>,
}

/// Registry of live replicas, addressed by name.
#[derive(Default)]
pub struct MemNetwork {
    registry: Mutex<Registry>,
}

impl MemNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register_raft(&self, addr: impl Into<String>, raft: Arc<Raft>) {
        self.registry.lock().unwrap().rafts.insert(addr.into(), raft);
    }

    pub fn register_group(&self, addr: impl Into<String>, server: Arc<GroupServer>) {
        self.registry
            .lock()
            .unwrap()
            .groups
            .insert(addr.into(), server);
    }

    /// Remove a replica from the network entirely (crash simulation).
    pub fn remove(&self, addr: &str) {
        let mut registry = self.registry.lock().unwrap();
        registry.rafts.remove(addr);
        registry.groups.remove(addr);
    }

    /// A Raft endpoint for `addr`. The target may be registered later; the
    /// lookup happens per call.
    pub fn raft_end(self: &Arc<Self>, addr: &str) -> Arc<dyn RaftTransport> {
        Arc::new(MemRaftEnd {
            net: self.clone(),
            target: addr.to_string(),
        })
    }

    fn lookup_raft(&self, addr: &str) -> Result<Arc<Raft>> {
        self.registry
            .lock()
            .unwrap()
            .rafts
            .get(addr)
            .cloned()
            .ok_or_else(|| Error::Unreachable(addr.to_string()))
    }
}

impl Resolver for MemNetwork {
    fn group_end(&self, addr: &str) -> Option<Arc<dyn GroupRpc>> {
        let server = self.registry.lock().unwrap().groups.get(addr).cloned()?;
        let end: Arc<dyn GroupRpc> = server;
        Some(end)
    }
}

struct MemRaftEnd {
    net: Arc<MemNetwork>,
    target: String,
}

#[async_trait]
impl RaftTransport for MemRaftEnd {
    async fn request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteReply> {
        let target = self.net.lookup_raft(&self.target)?;
        tokio::task::yield_now().await;
        Ok(target.handle_request_vote(args))
    }

    async fn append_entries(&self, args: AppendEntriesArgs) -> Result<AppendEntriesReply> {
        let target = self.net.lookup_raft(&self.target)?;
        tokio::task::yield_now().await;
        Ok(target.handle_append_entries(args))
    }

    async fn install_snapshot(&self, args: InstallSnapshotArgs) -> Result<InstallSnapshotReply> {
        let target = self.net.lookup_raft(&self.target)?;
        tokio::task::yield_now().await;
        Ok(target.handle_install_snapshot(args))
    }
}
