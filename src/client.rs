//! Client proxy
//!
//! A [`Clerk`] maps each key to its shard, resolves the owning group from a
//! cached configuration, and walks the group's servers until the leader
//! answers. `ErrWrongGroup` triggers a re-query of the shard master. The
//! same `(client_id, serial)` pair rides every retry of an operation, so
//! the group's duplicate table applies it at most once.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::common::{generate_client_id, key2shard, CLIENT_RPC_TIMEOUT};
use crate::group::op::{ErrCode, GetArgs, PutAppendArgs, PutAppendOp};
use crate::master::{ShardConfig, ShardMaster};
use crate::net::{GroupRpc, Resolver};

const CONFIG_REFRESH_BACKOFF: Duration = Duration::from_millis(100);

pub struct Clerk {
    master: Arc<dyn ShardMaster>,
    resolver: Arc<dyn Resolver>,
    config: ShardConfig,
    client_id: u64,
    next_serial: u64,
}

enum Outcome {
    Done(Option<String>),
    WrongGroup,
    NoLeader,
}

impl Clerk {
    pub fn new(master: Arc<dyn ShardMaster>, resolver: Arc<dyn Resolver>) -> Self {
        let client_id = generate_client_id();
        debug!(client_id, "new clerk");
        Self {
            master,
            resolver,
            config: ShardConfig::default(),
            client_id,
            next_serial: 1,
        }
    }

    /// Fetch the value for a key; `None` when the key does not exist.
    /// Retries until the owning group's leader answers.
    pub async fn get(&mut self, key: &str) -> Option<String> {
        let serial = self.next_serial;
        let args = GetArgs {
            key: key.to_string(),
            client_id: self.client_id,
            serial,
        };

        loop {
            let outcome = self
                .try_group(key, |end| {
                    let args = args.clone();
                    async move {
                        let reply = end.get(args).await.ok()?;
                        if reply.wrong_leader {
                            return None;
                        }
                        Some(match reply.err {
                            ErrCode::Ok => Outcome::Done(Some(reply.value)),
                            ErrCode::NoKey => Outcome::Done(None),
                            ErrCode::WrongGroup => Outcome::WrongGroup,
                        })
                    }
                })
                .await;

            match outcome {
                Outcome::Done(value) => {
                    self.next_serial += 1;
                    return value;
                }
                Outcome::WrongGroup | Outcome::NoLeader => self.refresh_config().await,
            }
        }
    }

    pub async fn put(&mut self, key: &str, value: &str) {
        self.put_append(key, value, PutAppendOp::Put).await
    }

    pub async fn append(&mut self, key: &str, value: &str) {
        self.put_append(key, value, PutAppendOp::Append).await
    }

    async fn put_append(&mut self, key: &str, value: &str, op: PutAppendOp) {
        let serial = self.next_serial;
        let args = PutAppendArgs {
            key: key.to_string(),
            value: value.to_string(),
            op,
            client_id: self.client_id,
            serial,
        };

        loop {
            let outcome = self
                .try_group(key, |end| {
                    let args = args.clone();
                    async move {
                        let reply = end.put_append(args).await.ok()?;
                        if reply.wrong_leader {
                            return None;
                        }
                        Some(match reply.err {
                            ErrCode::Ok => Outcome::Done(None),
                            ErrCode::WrongGroup => Outcome::WrongGroup,
                            ErrCode::NoKey => Outcome::Done(None),
                        })
                    }
                })
                .await;

            match outcome {
                Outcome::Done(_) => {
                    self.next_serial += 1;
                    return;
                }
                Outcome::WrongGroup | Outcome::NoLeader => self.refresh_config().await,
            }
        }
    }

    /// Walk the owning group's servers round-robin with a per-RPC timeout.
    /// `None` from the per-server closure means "try the next server".
    async fn try_group<F, Fut>(&self, key: &str, call: F) -> Outcome
    where
        F: Fn(Arc<dyn GroupRpc>) -> Fut,
        Fut: std::future::Future<Output = Option<Outcome>>,
    {
        let shard = key2shard(key);
        let gid = self.config.shards[shard];
        if gid == 0 {
            return Outcome::NoLeader;
        }
        let Some(servers) = self.config.groups.get(&gid) else {
            return Outcome::NoLeader;
        };

        for addr in servers {
            let Some(end) = self.resolver.group_end(addr) else {
                continue;
            };
            match tokio::time::timeout(CLIENT_RPC_TIMEOUT, call(end)).await {
                Ok(Some(outcome)) => return outcome,
                Ok(None) => continue,
                Err(_) => continue,
            }
        }
        Outcome::NoLeader
    }

    async fn refresh_config(&mut self) {
        tokio::time::sleep(CONFIG_REFRESH_BACKOFF).await;
        if let Ok(config) = self.master.query(-1).await {
            self.config = config;
        }
    }
}
