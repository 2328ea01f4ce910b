//! Raft wire messages
//!
//! Typed serde structures for the three inter-replica RPCs plus the log
//! entry and the apply-channel message delivered to the state machine.

use serde::{Deserialize, Serialize};

/// A single log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Index in the log (1-based, strictly monotonic)
    pub index: u64,
    /// Term when the entry was received by the leader
    pub term: u64,
    /// Opaque command bytes, decoded by the state-machine layer
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: usize,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: usize,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    /// Term of the conflicting entry on rejection (0 when unknown)
    pub conflict_term: u64,
    /// First index the leader should retry from on rejection
    pub conflict_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotArgs {
    pub term: u64,
    pub leader_id: usize,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotReply {
    pub term: u64,
}

/// Message delivered on the apply channel, in strict log order.
#[derive(Debug, Clone)]
pub enum ApplyMsg {
    /// A committed log entry.
    Command { index: u64, term: u64, data: Vec<u8> },
    /// The state machine must replace its state from this snapshot.
    Snapshot { data: Vec<u8> },
}
