//! Replica-group server
//!
//! Ties one Raft replica to the key-value state machine and drives shard
//! reconfiguration: the leader polls the shard master, submits `ApplyConfig`
//! ops, ships lost shards to their new owners, and confirms hand-offs
//! through the log so every replica sees the same transition order.
//!
//! Lock discipline: handlers go lock → validate → build op → unlock →
//! start → await → lock → read result → unlock. Neither the state lock nor
//! the waiter lock is ever held across `start()` or a blocking receive.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::common::{
    key2shard, Error, Result, AWAIT_APPLY_TIMEOUT, CONFIG_POLL_INTERVAL, MIGRATE_RETRY_DELAY,
    NSHARDS, SNAPSHOT_THRESHOLD_RATIO,
};
use crate::group::op::{
    ErrCode, GetArgs, GetReply, MigrateShardArgs, MigrateShardReply, Op, PutAppendArgs,
    PutAppendOp, PutAppendReply,
};
use crate::group::state::{ExportTask, KvState, ShardStatus};
use crate::group::waiter::{Applied, WaiterMap};
use crate::master::{GroupId, ShardMaster};
use crate::net::{GroupRpc, RaftTransport, Resolver};
use crate::raft::message::ApplyMsg;
use crate::raft::{Persister, Raft};

/// One replica of a replica group.
pub struct GroupServer {
    me: usize,
    gid: GroupId,
    rf: Arc<Raft>,
    state: Mutex<KvState>,
    waiters: Mutex<WaiterMap>,
    master: Arc<dyn ShardMaster>,
    resolver: Arc<dyn Resolver>,
    max_raft_state: i64,
    /// Shards with a live migration sender on this replica.
    exports_in_flight: Mutex<HashSet<usize>>,
    shutdown: watch::Sender<bool>,
}

impl GroupServer {
    /// Start a replica: restore any snapshot, bring up Raft, and spawn the
    /// apply task and the shard-master poller. A snapshot that fails to
    /// decode aborts initialization.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gid: GroupId,
        me: usize,
        peers: Vec<Arc<dyn RaftTransport>>,
        persister: Arc<Persister>,
        max_raft_state: i64,
        master: Arc<dyn ShardMaster>,
        resolver: Arc<dyn Resolver>,
    ) -> Result<Arc<Self>> {
        let mut state = KvState::new(gid);
        let snapshot = persister.read_snapshot();
        if !snapshot.is_empty() {
            state.load_snapshot(&snapshot)?;
        }

        let (apply_tx, apply_rx) = mpsc::channel(256);
        let rf = Raft::new(peers, me, persister, apply_tx)?;
        let (shutdown, _) = watch::channel(false);

        let server = Arc::new(Self {
            me,
            gid,
            rf,
            state: Mutex::new(state),
            waiters: Mutex::new(WaiterMap::new()),
            master,
            resolver,
            max_raft_state,
            exports_in_flight: Mutex::new(HashSet::new()),
            shutdown,
        });

        tokio::spawn(server.clone().apply_task(apply_rx));
        tokio::spawn(server.clone().poll_task());
        Ok(server)
    }

    pub fn gid(&self) -> GroupId {
        self.gid
    }

    pub fn raft(&self) -> &Arc<Raft> {
        &self.rf
    }

    // === Introspection (status surfaces and tests) ===

    pub fn latest_config_num(&self) -> u64 {
        self.state.lock().unwrap().latest_cfg().num
    }

    pub fn shard_status(&self, shard: usize) -> ShardStatus {
        self.state.lock().unwrap().status(shard)
    }

    pub fn transfer_in_progress(&self) -> bool {
        self.state.lock().unwrap().transfer_in_progress()
    }

    /// Read a key straight from this replica's applied state, bypassing
    /// Raft. Reflects whatever this replica has applied so far.
    pub fn local_value(&self, key: &str) -> Option<String> {
        self.state.lock().unwrap().get(key).cloned()
    }

    /// Stop this replica and its Raft instance.
    pub fn kill(&self) {
        let _ = self.shutdown.send(true);
        self.rf.kill();
    }

    fn is_killed(&self) -> bool {
        *self.shutdown.borrow()
    }

    // === Client RPC handlers ===

    pub async fn handle_get(&self, args: GetArgs) -> GetReply {
        const WRONG_LEADER: GetReply = GetReply {
            wrong_leader: true,
            err: ErrCode::Ok,
            value: String::new(),
        };

        if self.is_killed() || !self.rf.is_leader() {
            return WRONG_LEADER;
        }
        {
            let state = self.state.lock().unwrap();
            if state.status_for_key(&args.key) != ShardStatus::Available {
                return GetReply {
                    wrong_leader: false,
                    err: ErrCode::WrongGroup,
                    value: String::new(),
                };
            }
        }

        let op = Op::Get {
            key: args.key.clone(),
            client_id: args.client_id,
            serial: args.serial,
        };
        if self.start_and_wait(op).await.is_err() {
            return WRONG_LEADER;
        }

        let state = self.state.lock().unwrap();
        if state.status_for_key(&args.key) != ShardStatus::Available {
            // Ownership moved while we waited; the client must re-resolve.
            return WRONG_LEADER;
        }
        match state.get(&args.key) {
            Some(value) => GetReply {
                wrong_leader: false,
                err: ErrCode::Ok,
                value: value.clone(),
            },
            None => GetReply {
                wrong_leader: false,
                err: ErrCode::NoKey,
                value: String::new(),
            },
        }
    }

    pub async fn handle_put_append(&self, args: PutAppendArgs) -> PutAppendReply {
        const WRONG_LEADER: PutAppendReply = PutAppendReply {
            wrong_leader: true,
            err: ErrCode::Ok,
        };

        if self.is_killed() || !self.rf.is_leader() {
            return WRONG_LEADER;
        }
        {
            let state = self.state.lock().unwrap();
            if state.status_for_key(&args.key) != ShardStatus::Available {
                return PutAppendReply {
                    wrong_leader: false,
                    err: ErrCode::WrongGroup,
                };
            }
        }

        let op = match args.op {
            PutAppendOp::Put => Op::Put {
                key: args.key.clone(),
                value: args.value,
                client_id: args.client_id,
                serial: args.serial,
            },
            PutAppendOp::Append => Op::Append {
                key: args.key.clone(),
                value: args.value,
                client_id: args.client_id,
                serial: args.serial,
            },
        };
        if self.start_and_wait(op).await.is_err() {
            return WRONG_LEADER;
        }

        let state = self.state.lock().unwrap();
        if state.status_for_key(&args.key) != ShardStatus::Available {
            return WRONG_LEADER;
        }
        PutAppendReply {
            wrong_leader: false,
            err: ErrCode::Ok,
        }
    }

    // === Inter-group migration ===

    /// Receive a shard from its previous owner.
    pub async fn handle_migrate_shard(&self, args: MigrateShardArgs) -> MigrateShardReply {
        const WRONG_LEADER: MigrateShardReply = MigrateShardReply {
            wrong_leader: true,
            err: ErrCode::Ok,
        };
        const OK: MigrateShardReply = MigrateShardReply {
            wrong_leader: false,
            err: ErrCode::Ok,
        };

        if self.is_killed() || !self.rf.is_leader() {
            return WRONG_LEADER;
        }
        {
            let state = self.state.lock().unwrap();
            if state.status(args.shard) == ShardStatus::Available {
                // The transfer already landed; the sender retried.
                return OK;
            }
        }

        let kvmap: HashMap<String, String> = args
            .kvmap
            .into_iter()
            .filter(|(k, _)| key2shard(k) == args.shard)
            .collect();
        let op = Op::ImportComplete {
            shard: args.shard,
            cfg: args.config_version,
            kvmap,
            duplicates: args.duplicates,
        };

        // Only reply OK once the import is committed and applied; the
        // sender deletes its copy on the strength of this reply.
        match self.start_and_wait(op).await {
            Ok(_) => OK,
            Err(_) => WRONG_LEADER,
        }
    }

    /// Ship `task.shard` to its new owner group, retrying across its servers
    /// until one confirms, then tell our own group to drop the shard.
    async fn run_export(self: Arc<Self>, task: ExportTask) {
        let (kvmap, duplicates) = {
            let state = self.state.lock().unwrap();
            (state.shard_data(task.shard), state.shard_duplicates(task.shard))
        };
        let args = MigrateShardArgs {
            config_version: task.cfg,
            shard: task.shard,
            kvmap,
            duplicates,
        };
        debug!(
            gid = self.gid,
            me = self.me,
            shard = task.shard,
            dest = task.dest_gid,
            cfg = task.cfg,
            "sending shard"
        );

        let mut shutdown_rx = self.shutdown.subscribe();
        'retry: loop {
            for addr in &task.servers {
                if self.is_killed() || !self.rf.is_leader() {
                    // A new leader re-drives this export from its poller.
                    break 'retry;
                }
                let Some(end) = self.resolver.group_end(addr) else {
                    continue;
                };
                match end.migrate_shard(args.clone()).await {
                    Ok(reply) if !reply.wrong_leader && reply.err == ErrCode::Ok => {
                        let op = Op::ExportComplete {
                            shard: task.shard,
                            cfg: task.cfg,
                            kvmap: args.kvmap.clone(),
                        };
                        match op.encode() {
                            Ok(data) => {
                                let _ = self.rf.start(data);
                            }
                            Err(e) => warn!(error = %e, "failed to encode export completion"),
                        }
                        break 'retry;
                    }
                    Ok(reply) if reply.err == ErrCode::WrongGroup => {
                        warn!(
                            gid = self.gid,
                            shard = task.shard,
                            dest = task.dest_gid,
                            "destination group rejected a shard it was assigned"
                        );
                    }
                    _ => {}
                }
            }
            tokio::select! {
                _ = shutdown_rx.changed() => break 'retry,
                _ = tokio::time::sleep(MIGRATE_RETRY_DELAY) => {}
            }
        }

        self.exports_in_flight.lock().unwrap().remove(&task.shard);
    }

    fn spawn_export(self: &Arc<Self>, task: ExportTask) {
        {
            let mut in_flight = self.exports_in_flight.lock().unwrap();
            if !in_flight.insert(task.shard) {
                return;
            }
        }
        let server = self.clone();
        tokio::spawn(async move { server.run_export(task).await });
    }

    /// Restart senders for shards still marked exporting, so a leadership
    /// change mid-migration does not strand them. Duplicate deliveries are
    /// absorbed by the idempotent receiver.
    fn redrive_exports(self: &Arc<Self>) {
        let tasks: Vec<ExportTask> = {
            let state = self.state.lock().unwrap();
            let cfg = state.latest_cfg();
            (0..NSHARDS)
                .filter(|&shard| state.status(shard) == ShardStatus::Exporting)
                .filter_map(|shard| {
                    let dest_gid = cfg.shards[shard];
                    let servers = cfg.groups.get(&dest_gid).cloned()?;
                    Some(ExportTask {
                        shard,
                        cfg: cfg.num,
                        dest_gid,
                        servers,
                    })
                })
                .collect()
        };
        for task in tasks {
            self.spawn_export(task);
        }
    }

    // === Rendezvous ===

    /// Submit an op and wait for the apply task to deliver the entry at the
    /// index `start` returned. Fails when the term moved on, the waiter was
    /// displaced, or the wait timed out; callers answer `wrong_leader` in
    /// every such case and the client retries.
    async fn start_and_wait(&self, op: Op) -> Result<Applied> {
        let data = op.encode()?;
        let Some((index, term)) = self.rf.start(data) else {
            return Err(Error::NotLeader);
        };
        let rx = self.waiters.lock().unwrap().register(index);

        match tokio::time::timeout(AWAIT_APPLY_TIMEOUT, rx).await {
            Ok(Ok(applied)) if applied.term == term => Ok(applied),
            Ok(_) => Err(Error::NotLeader),
            Err(_) => Err(Error::Timeout("apply rendezvous".into())),
        }
    }

    // === Apply pipeline consumer ===

    async fn apply_task(self: Arc<Self>, mut apply_rx: mpsc::Receiver<ApplyMsg>) {
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                msg = apply_rx.recv() => match msg {
                    Some(msg) => self.handle_apply(msg),
                    None => return,
                },
            }
        }
    }

    fn handle_apply(self: &Arc<Self>, msg: ApplyMsg) {
        match msg {
            ApplyMsg::Snapshot { data } => {
                let mut state = self.state.lock().unwrap();
                if let Err(e) = state.load_snapshot(&data) {
                    warn!(gid = self.gid, me = self.me, error = %e, "failed to load snapshot");
                }
            }
            ApplyMsg::Command { index, term, data } => {
                let op = match Op::decode(&data) {
                    Ok(op) => op,
                    Err(e) => {
                        warn!(gid = self.gid, index, error = %e, "undecodable log entry");
                        return;
                    }
                };

                let mut exports = Vec::new();
                {
                    let mut state = self.state.lock().unwrap();
                    match &op {
                        Op::Get { .. } => {}
                        Op::Put { .. } | Op::Append { .. } => state.apply_client_op(&op),
                        Op::ApplyConfig { config } => exports = state.apply_config(config),
                        Op::ExportComplete { shard, cfg, .. } => {
                            state.export_complete(*shard, *cfg)
                        }
                        Op::ImportComplete {
                            shard,
                            cfg,
                            kvmap,
                            duplicates,
                        } => state.import_complete(*shard, *cfg, kvmap, duplicates),
                    }
                    self.maybe_snapshot(&mut state, index);
                }

                if !exports.is_empty() && self.rf.is_leader() {
                    for task in exports {
                        self.spawn_export(task);
                    }
                }

                self.waiters
                    .lock()
                    .unwrap()
                    .complete(index, Applied { index, term, op });
            }
        }
    }

    fn maybe_snapshot(&self, state: &mut KvState, index: u64) {
        if self.max_raft_state == -1 {
            return;
        }
        let threshold = (SNAPSHOT_THRESHOLD_RATIO * self.max_raft_state as f64) as usize;
        if self.rf.state_size() < threshold {
            return;
        }
        match state.encode_snapshot(index) {
            Ok(blob) => {
                if let Err(e) = self.rf.persist_and_save_snapshot(index, blob) {
                    warn!(gid = self.gid, me = self.me, error = %e, "failed to save snapshot");
                }
            }
            Err(e) => warn!(gid = self.gid, me = self.me, error = %e, "failed to encode snapshot"),
        }
    }

    // === Shard-master poller (leader only) ===

    async fn poll_task(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut tick = tokio::time::interval(CONFIG_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                _ = tick.tick() => {}
            }
            if self.is_killed() {
                return;
            }
            if !self.rf.is_leader() {
                continue;
            }

            self.redrive_exports();

            let newest = match self.master.query(-1).await {
                Ok(cfg) => cfg,
                Err(e) => {
                    debug!(gid = self.gid, error = %e, "shard master unavailable");
                    continue;
                }
            };

            // Submit every missing configuration in order; the state machine
            // absorbs them one at a time, at quiescence.
            let mut next = self.state.lock().unwrap().latest_cfg().num + 1;
            while next <= newest.num {
                let config = if next == newest.num {
                    newest.clone()
                } else {
                    match self.master.query(next as i64).await {
                        Ok(cfg) => cfg,
                        Err(_) => break,
                    }
                };
                let op = Op::ApplyConfig { config };
                let Ok(data) = op.encode() else { break };
                if self.rf.start(data).is_none() {
                    break;
                }
                next += 1;
            }
        }
    }
}

#[async_trait]
impl GroupRpc for GroupServer {
    async fn get(&self, args: GetArgs) -> Result<GetReply> {
        Ok(self.handle_get(args).await)
    }

    async fn put_append(&self, args: PutAppendArgs) -> Result<PutAppendReply> {
        Ok(self.handle_put_append(args).await)
    }

    async fn migrate_shard(&self, args: MigrateShardArgs) -> Result<MigrateShardReply> {
        Ok(self.handle_migrate_shard(args).await)
    }
}
