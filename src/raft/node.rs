//! Raft consensus core
//!
//! One [`Raft`] instance per replica. A single mutex guards all shared
//! state; it is never held across an RPC send or a send on the apply
//! channel. Long-running tasks per replica: the election-timeout loop, the
//! apply pipeline, and (on leaders) one replication task per follower.
//!
//! The log is mutated on exactly three paths: `start` on the leader, the
//! AppendEntries receiver on followers, and the snapshot/install-snapshot
//! truncation. All three run under the replica mutex.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::common::{
    Result, ELECTION_TIMEOUT_MAX_MS, ELECTION_TIMEOUT_MIN_MS, HEARTBEAT_INTERVAL, LEADER_PEER_TICK,
};
use crate::net::{call_with_retry, RaftTransport, RPC_ATTEMPTS};
use crate::raft::log::RaftLog;
use crate::raft::message::{
    AppendEntriesArgs, AppendEntriesReply, ApplyMsg, InstallSnapshotArgs, InstallSnapshotReply,
    LogEntry, RequestVoteArgs, RequestVoteReply,
};
use crate::raft::persist::Persister;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// State persisted to stable storage before answering any RPC.
#[derive(Serialize)]
struct PersistedStateRef<'a> {
    term: u64,
    voted_for: Option<usize>,
    log: &'a RaftLog,
}

#[derive(Deserialize)]
struct PersistedState {
    term: u64,
    voted_for: Option<usize>,
    log: RaftLog,
}

struct RaftInner {
    role: Role,
    term: u64,
    voted_for: Option<usize>,
    leader_id: Option<usize>,
    log: RaftLog,
    commit_index: u64,
    last_applied: u64,
    next_index: Vec<u64>,
    match_index: Vec<u64>,
    last_heartbeat: Instant,
    /// One signal sender per follower while leader; `None` otherwise.
    append_signals: Vec<Option<mpsc::UnboundedSender<()>>>,
}

/// A single Raft replica.
pub struct Raft {
    me: usize,
    peers: Vec<Arc<dyn RaftTransport>>,
    persister: Arc<Persister>,
    inner: Mutex<RaftInner>,
    apply_notify: Notify,
    apply_tx: mpsc::Sender<ApplyMsg>,
    shutdown: watch::Sender<bool>,
}

enum Batch {
    Snapshot(Vec<u8>),
    Entries(Vec<LogEntry>),
}

impl Raft {
    /// Create a replica, restore persisted state, and spawn its long-running
    /// tasks. Committed entries and snapshot loads are delivered on
    /// `apply_tx` in strict log order.
    pub fn new(
        peers: Vec<Arc<dyn RaftTransport>>,
        me: usize,
        persister: Arc<Persister>,
        apply_tx: mpsc::Sender<ApplyMsg>,
    ) -> Result<Arc<Self>> {
        let n = peers.len();
        let mut inner = RaftInner {
            role: Role::Follower,
            term: 0,
            voted_for: None,
            leader_id: None,
            log: RaftLog::new(),
            commit_index: 0,
            last_applied: 0,
            next_index: vec![0; n],
            match_index: vec![0; n],
            last_heartbeat: Instant::now(),
            append_signals: vec![None; n],
        };

        let state = persister.read_state();
        if !state.is_empty() {
            let restored: PersistedState = serde_json::from_slice(&state)?;
            inner.term = restored.term;
            inner.voted_for = restored.voted_for;
            inner.log = restored.log;
            // Everything in the snapshot is committed.
            inner.commit_index = inner.log.snapshot_index;
        }

        let (shutdown, _) = watch::channel(false);
        let rf = Arc::new(Self {
            me,
            peers,
            persister,
            inner: Mutex::new(inner),
            apply_notify: Notify::new(),
            apply_tx,
            shutdown,
        });

        tokio::spawn(rf.clone().election_loop());
        tokio::spawn(rf.clone().apply_loop());
        // Deliver a restored snapshot to the state machine right away.
        rf.apply_notify.notify_one();

        Ok(rf)
    }

    pub fn me(&self) -> usize {
        self.me
    }

    /// Current term and whether this replica believes it is the leader.
    pub fn state(&self) -> (u64, bool) {
        let inner = self.inner.lock().unwrap();
        (inner.term, inner.role == Role::Leader)
    }

    pub fn is_leader(&self) -> bool {
        self.inner.lock().unwrap().role == Role::Leader
    }

    /// Size in bytes of the persisted Raft state.
    pub fn state_size(&self) -> usize {
        self.persister.state_size()
    }

    /// Stop all tasks. Safe to call more than once.
    pub fn kill(&self) {
        let _ = self.shutdown.send(true);
    }

    fn is_killed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Begin agreement on a command. Returns the `(index, term)` the entry
    /// will occupy if it commits, or `None` when this replica is not the
    /// leader.
    pub fn start(self: &Arc<Self>, data: Vec<u8>) -> Option<(u64, u64)> {
        let mut inner = self.inner.lock().unwrap();
        if inner.role != Role::Leader || self.is_killed() {
            return None;
        }
        let index = inner.log.last_index() + 1;
        let term = inner.term;
        inner.log.append(LogEntry { index, term, data });
        self.persist(&inner);
        self.advance_commit(&mut inner);
        Self::signal_peers(&inner);
        Some((index, term))
    }

    /// The state-machine layer took a snapshot through `last_included_index`;
    /// discard the covered log prefix and persist the pair atomically.
    pub fn persist_and_save_snapshot(&self, last_included_index: u64, snapshot: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if last_included_index <= inner.log.snapshot_index {
            return Ok(());
        }
        let Some(term) = inner.log.term_at(last_included_index) else {
            // The index is not retained; a newer snapshot already covered it.
            return Ok(());
        };
        inner.log.compact_to(last_included_index, term);
        let state = self.encode_state(&inner)?;
        self.persister.save_state_and_snapshot(state, snapshot)
    }

    // === Persistence ===

    fn encode_state(&self, inner: &RaftInner) -> Result<Vec<u8>> {
        let state = PersistedStateRef {
            term: inner.term,
            voted_for: inner.voted_for,
            log: &inner.log,
        };
        Ok(serde_json::to_vec(&state)?)
    }

    fn persist(&self, inner: &RaftInner) {
        match self.encode_state(inner) {
            Ok(state) => {
                if let Err(e) = self.persister.save_state(state) {
                    error!(me = self.me, error = %e, "failed to persist raft state");
                }
            }
            Err(e) => error!(me = self.me, error = %e, "failed to encode raft state"),
        }
    }

    // === Role transitions ===

    fn step_down(inner: &mut RaftInner, term: u64) {
        inner.role = Role::Follower;
        inner.term = term;
        inner.voted_for = None;
        inner.leader_id = None;
        for signal in inner.append_signals.iter_mut() {
            *signal = None;
        }
    }

    fn become_leader(self: &Arc<Self>, inner: &mut RaftInner) {
        inner.role = Role::Leader;
        inner.leader_id = Some(self.me);
        let next = inner.log.last_index() + 1;
        for peer in 0..self.peers.len() {
            inner.next_index[peer] = next;
            inner.match_index[peer] = 0;
        }
        info!(me = self.me, term = inner.term, "elected leader");

        for peer in 0..self.peers.len() {
            if peer == self.me {
                continue;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            inner.append_signals[peer] = Some(tx);
            let rf = self.clone();
            let term = inner.term;
            tokio::spawn(async move { rf.replicate_loop(peer, term, rx).await });
        }
    }

    fn signal_peers(inner: &RaftInner) {
        for signal in inner.append_signals.iter().flatten() {
            let _ = signal.send(());
        }
    }

    // === RPC handlers ===

    pub fn handle_request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply {
        let mut inner = self.inner.lock().unwrap();
        let up_to_date = inner.log.up_to_date(args.last_log_index, args.last_log_term);

        if args.term > inner.term {
            Self::step_down(&mut inner, args.term);
        }

        let mut granted = false;
        if args.term >= inner.term
            && (inner.voted_for.is_none() || inner.voted_for == Some(args.candidate_id))
            && up_to_date
        {
            inner.voted_for = Some(args.candidate_id);
            // Granting a vote counts as hearing from a viable leader.
            inner.last_heartbeat = Instant::now();
            granted = true;
        }

        debug!(
            me = self.me,
            candidate = args.candidate_id,
            term = args.term,
            granted,
            "vote requested"
        );
        self.persist(&inner);
        RequestVoteReply {
            term: inner.term,
            vote_granted: granted,
        }
    }

    pub fn handle_append_entries(&self, args: AppendEntriesArgs) -> AppendEntriesReply {
        let mut inner = self.inner.lock().unwrap();
        if args.term < inner.term {
            return AppendEntriesReply {
                term: inner.term,
                success: false,
                conflict_term: 0,
                conflict_index: 0,
            };
        }

        Self::step_down(&mut inner, args.term);
        inner.leader_id = Some(args.leader_id);
        // Mark the vote so this replica cannot vote for someone else in the
        // leader's term after stepping down.
        inner.voted_for = Some(args.leader_id);
        inner.last_heartbeat = Instant::now();

        let reply = self.merge_entries(&mut inner, &args);
        self.persist(&inner);
        reply
    }

    fn merge_entries(&self, inner: &mut RaftInner, args: &AppendEntriesArgs) -> AppendEntriesReply {
        let term = inner.term;

        // The leader is probing entries this replica has already discarded;
        // point it just past the snapshot instead of looping.
        if args.prev_log_index < inner.log.snapshot_index {
            return AppendEntriesReply {
                term,
                success: false,
                conflict_term: 0,
                conflict_index: inner.log.snapshot_index + 1,
            };
        }

        if !inner.log.matches(args.prev_log_index, args.prev_log_term) {
            let conflict_term = inner
                .log
                .term_at(args.prev_log_index)
                .unwrap_or_else(|| inner.log.last_term());
            let conflict_index = inner
                .log
                .first_index_of_term(conflict_term)
                .unwrap_or(inner.log.snapshot_index + 1);
            return AppendEntriesReply {
                term,
                success: false,
                conflict_term,
                conflict_index,
            };
        }

        // Overwrite from the first position where the logs diverge; entries
        // already consistent are left alone so a stale append cannot drop
        // newer ones.
        for (i, entry) in args.entries.iter().enumerate() {
            let consistent = inner
                .log
                .entry(entry.index)
                .map(|local| local.term == entry.term)
                .unwrap_or(false);
            if !consistent {
                inner.log.truncate_from(entry.index);
                inner.log.extend(&args.entries[i..]);
                break;
            }
        }

        if args.leader_commit > inner.commit_index {
            let last = inner.log.last_index();
            inner.commit_index = args.leader_commit.min(last);
            self.apply_notify.notify_one();
        }

        AppendEntriesReply {
            term,
            success: true,
            conflict_term: 0,
            conflict_index: 0,
        }
    }

    pub fn handle_install_snapshot(&self, args: InstallSnapshotArgs) -> InstallSnapshotReply {
        let mut inner = self.inner.lock().unwrap();
        if self.is_killed() || args.term < inner.term {
            return InstallSnapshotReply { term: inner.term };
        }

        Self::step_down(&mut inner, args.term);
        inner.leader_id = Some(args.leader_id);
        inner.voted_for = Some(args.leader_id);
        inner.last_heartbeat = Instant::now();

        if args.last_included_index > inner.log.snapshot_index {
            info!(
                me = self.me,
                last_included_index = args.last_included_index,
                "installing snapshot"
            );
            if inner.log.term_at(args.last_included_index) == Some(args.last_included_term) {
                // The snapshot covers a prefix of this log; keep the rest.
                inner
                    .log
                    .compact_to(args.last_included_index, args.last_included_term);
            } else {
                inner
                    .log
                    .reset_to(args.last_included_index, args.last_included_term);
            }
            let commit = inner.commit_index.max(args.last_included_index);
            inner.commit_index = commit;
            // Force the apply pipeline to redeliver the snapshot.
            inner.last_applied = 0;

            match self.encode_state(&inner) {
                Ok(state) => {
                    if let Err(e) = self.persister.save_state_and_snapshot(state, args.data) {
                        error!(me = self.me, error = %e, "failed to persist snapshot");
                    }
                }
                Err(e) => error!(me = self.me, error = %e, "failed to encode raft state"),
            }
            self.apply_notify.notify_one();
        } else {
            self.persist(&inner);
        }

        InstallSnapshotReply { term: inner.term }
    }

    // === Elections ===

    fn random_election_timeout() -> Duration {
        let ms = rand::thread_rng().gen_range(ELECTION_TIMEOUT_MIN_MS..ELECTION_TIMEOUT_MAX_MS);
        Duration::from_millis(ms)
    }

    async fn election_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            let timeout = Self::random_election_timeout();
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                _ = tokio::time::sleep(timeout) => {}
            }
            if self.is_killed() {
                return;
            }
            let campaign = {
                let inner = self.inner.lock().unwrap();
                inner.role != Role::Leader && inner.last_heartbeat.elapsed() >= timeout
            };
            if campaign {
                let rf = self.clone();
                tokio::spawn(async move { rf.begin_election().await });
            }
        }
    }

    async fn begin_election(self: Arc<Self>) {
        if self.is_killed() {
            return;
        }
        let (args, term) = {
            let mut inner = self.inner.lock().unwrap();
            inner.role = Role::Candidate;
            inner.term += 1;
            inner.voted_for = Some(self.me);
            inner.leader_id = None;
            self.persist(&inner);
            debug!(me = self.me, term = inner.term, "starting election");
            (
                RequestVoteArgs {
                    term: inner.term,
                    candidate_id: self.me,
                    last_log_index: inner.log.last_index(),
                    last_log_term: inner.log.last_term(),
                },
                inner.term,
            )
        };

        // Count our own vote; a single-replica group elects itself.
        let votes = Arc::new(AtomicUsize::new(1));
        if self.peers.len() == 1 {
            let mut inner = self.inner.lock().unwrap();
            if inner.term == term && inner.role == Role::Candidate {
                self.become_leader(&mut inner);
            }
            return;
        }

        for peer in 0..self.peers.len() {
            if peer == self.me {
                continue;
            }
            let rf = self.clone();
            let args = args.clone();
            let votes = votes.clone();
            tokio::spawn(async move { rf.solicit_vote(peer, args, term, votes).await });
        }
    }

    async fn solicit_vote(
        self: Arc<Self>,
        peer: usize,
        args: RequestVoteArgs,
        term: u64,
        votes: Arc<AtomicUsize>,
    ) {
        let end = self.peers[peer].clone();
        let reply = match call_with_retry(
            || {
                let end = end.clone();
                let args = args.clone();
                async move { end.request_vote(args).await }
            },
            RPC_ATTEMPTS,
        )
        .await
        {
            Ok(reply) => reply,
            Err(_) => return,
        };

        let mut inner = self.inner.lock().unwrap();
        if reply.term > inner.term {
            Self::step_down(&mut inner, reply.term);
            self.persist(&inner);
            return;
        }
        if inner.term != term || inner.role != Role::Candidate {
            return;
        }
        if reply.vote_granted {
            let count = votes.fetch_add(1, Ordering::SeqCst) + 1;
            if count > self.peers.len() / 2 {
                self.become_leader(&mut inner);
            }
        }
    }

    // === Replication (leader only) ===

    async fn replicate_loop(
        self: Arc<Self>,
        peer: usize,
        term: u64,
        mut signal_rx: mpsc::UnboundedReceiver<()>,
    ) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut tick = tokio::time::interval(LEADER_PEER_TICK);
        let mut last_sent: Option<Instant> = None;

        loop {
            {
                let inner = self.inner.lock().unwrap();
                if inner.role != Role::Leader || inner.term != term {
                    return;
                }
            }
            if self.is_killed() {
                return;
            }

            tokio::select! {
                _ = shutdown_rx.changed() => return,
                signal = signal_rx.recv() => {
                    if signal.is_none() {
                        return;
                    }
                    last_sent = Some(Instant::now());
                    self.send_append(peer, term).await;
                }
                _ = tick.tick() => {
                    let due = last_sent
                        .map(|at| at.elapsed() >= HEARTBEAT_INTERVAL)
                        .unwrap_or(true);
                    if due {
                        last_sent = Some(Instant::now());
                        self.send_append(peer, term).await;
                    }
                }
            }
        }
    }

    async fn send_append(self: &Arc<Self>, peer: usize, term: u64) {
        enum Action {
            Skip,
            Snapshot,
            Append(AppendEntriesArgs),
        }

        let action = {
            let inner = self.inner.lock().unwrap();
            if inner.role != Role::Leader || inner.term != term {
                Action::Skip
            } else if inner.next_index[peer] <= inner.log.snapshot_index {
                // The next entry for this follower was discarded into a
                // snapshot; ship the snapshot instead.
                Action::Snapshot
            } else {
                let next = inner.next_index[peer];
                let prev_log_index = next - 1;
                let prev_log_term = inner.log.term_at(prev_log_index).unwrap_or(0);
                Action::Append(AppendEntriesArgs {
                    term,
                    leader_id: self.me,
                    prev_log_index,
                    prev_log_term,
                    entries: inner.log.entries_from(next).to_vec(),
                    leader_commit: inner.commit_index,
                })
            }
        };
        let args = match action {
            Action::Skip => return,
            Action::Snapshot => {
                self.send_snapshot(peer, term).await;
                return;
            }
            Action::Append(args) => args,
        };

        let end = self.peers[peer].clone();
        let reply = match call_with_retry(
            || {
                let end = end.clone();
                let args = args.clone();
                async move { end.append_entries(args).await }
            },
            RPC_ATTEMPTS,
        )
        .await
        {
            Ok(reply) => reply,
            Err(_) => return,
        };

        let mut inner = self.inner.lock().unwrap();
        if inner.role != Role::Leader || inner.term != term || self.is_killed() {
            return;
        }
        if reply.term > inner.term {
            Self::step_down(&mut inner, reply.term);
            self.persist(&inner);
            return;
        }

        if reply.success {
            if !args.entries.is_empty() {
                let matched = args.prev_log_index + args.entries.len() as u64;
                if matched > inner.match_index[peer] {
                    inner.match_index[peer] = matched;
                }
                let next = inner.match_index[peer] + 1;
                inner.next_index[peer] = next;
                self.advance_commit(&mut inner);
            }
        } else {
            let last = inner.log.last_index();
            inner.next_index[peer] = reply.conflict_index.min(last).max(1);
            // Retry immediately with the corrected position.
            if let Some(signal) = &inner.append_signals[peer] {
                let _ = signal.send(());
            }
        }
    }

    async fn send_snapshot(self: &Arc<Self>, peer: usize, term: u64) {
        let args = {
            let inner = self.inner.lock().unwrap();
            if inner.role != Role::Leader || inner.term != term {
                return;
            }
            InstallSnapshotArgs {
                term,
                leader_id: self.me,
                last_included_index: inner.log.snapshot_index,
                last_included_term: inner.log.snapshot_term,
                data: self.persister.read_snapshot(),
            }
        };
        debug!(me = self.me, peer, "sending snapshot");

        let end = self.peers[peer].clone();
        let reply = match call_with_retry(
            || {
                let end = end.clone();
                let args = args.clone();
                async move { end.install_snapshot(args).await }
            },
            RPC_ATTEMPTS,
        )
        .await
        {
            Ok(reply) => reply,
            Err(_) => return,
        };

        let mut inner = self.inner.lock().unwrap();
        if reply.term > inner.term {
            Self::step_down(&mut inner, reply.term);
            self.persist(&inner);
            return;
        }
        if inner.role != Role::Leader || inner.term != term {
            return;
        }
        inner.next_index[peer] = args.last_included_index + 1;
        if let Some(signal) = &inner.append_signals[peer] {
            let _ = signal.send(());
        }
    }

    /// Advance `commit_index` to the highest index replicated on a strict
    /// majority. Entries from prior terms are never committed by counting
    /// replicas.
    fn advance_commit(&self, inner: &mut RaftInner) {
        let majority = self.peers.len() / 2 + 1;
        let mut n = inner.log.last_index();
        while n > inner.commit_index {
            if inner.log.term_at(n) == Some(inner.term) {
                let count = 1 + (0..self.peers.len())
                    .filter(|&p| p != self.me && inner.match_index[p] >= n)
                    .count();
                if count >= majority {
                    inner.commit_index = n;
                    self.apply_notify.notify_one();
                    break;
                }
            }
            n -= 1;
        }
    }

    // === Apply pipeline ===

    async fn apply_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                _ = self.apply_notify.notified() => {}
            }
            loop {
                let batch = self.next_batch();
                match batch {
                    None => break,
                    Some(Batch::Snapshot(data)) => {
                        if self.apply_tx.send(ApplyMsg::Snapshot { data }).await.is_err() {
                            return;
                        }
                    }
                    Some(Batch::Entries(entries)) => {
                        for entry in entries {
                            let msg = ApplyMsg::Command {
                                index: entry.index,
                                term: entry.term,
                                data: entry.data,
                            };
                            if self.apply_tx.send(msg).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Compute the next slice to deliver, under the lock, without blocking
    /// on the downstream channel.
    fn next_batch(&self) -> Option<Batch> {
        let mut inner = self.inner.lock().unwrap();
        let snapshot_index = inner.log.snapshot_index;
        if inner.last_applied < snapshot_index {
            inner.last_applied = snapshot_index;
            return Some(Batch::Snapshot(self.persister.read_snapshot()));
        }
        if inner.commit_index > inner.last_applied {
            let from = inner.last_applied + 1;
            let commit = inner.commit_index;
            let entries: Vec<LogEntry> = inner
                .log
                .entries_from(from)
                .iter()
                .take_while(|e| e.index <= commit)
                .cloned()
                .collect();
            if let Some(last) = entries.last() {
                inner.last_applied = last.index;
                return Some(Batch::Entries(entries));
            }
        }
        None
    }
}

impl Drop for Raft {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
