//! # shardkv
//!
//! A fault-tolerant, sharded key-value store on a Raft replication core:
//! - Raft consensus per replica group (election, replication, snapshots)
//! - Linearizable `Get` / `Put` / `Append` with at-most-once semantics
//! - Shard migration between groups, driven through the replicated log
//! - Crash-safe persistence with atomic state+snapshot pair writes
//!
//! ## Architecture
//!
//! ```text
//!                  ┌───────────────────────┐
//!                  │      Shard master      │
//!                  │ (config oracle, polled │
//!                  │   by group leaders)    │
//!                  └───────────┬────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          │                   │                   │
//!   ┌──────▼──────┐     ┌──────▼──────┐     ┌──────▼──────┐
//!   │  Group 100  │     │  Group 101  │     │  Group 102  │
//!   │ Raft x3     │◄───►│ Raft x3     │◄───►│ Raft x3     │
//!   │ shards {..} │ mig │ shards {..} │ mig │ shards {..} │
//!   └─────────────┘     └─────────────┘     └─────────────┘
//! ```
//!
//! A client maps its key to a shard, asks the cached configuration which
//! group owns it, and talks to that group's leader. The leader funnels the
//! op through Raft; the apply pipeline delivers it to every replica's state
//! machine in the same order. Configuration changes and shard hand-offs ride
//! the same log, so ownership transitions are ordered against client writes.

pub mod client;
pub mod common;
pub mod group;
pub mod master;
pub mod net;
pub mod raft;

pub use client::Clerk;
pub use common::{key2shard, Error, Result, NSHARDS};
pub use group::{GroupServer, ShardStatus};
pub use master::{GroupId, LocalMaster, ShardConfig, ShardMaster};
pub use net::{MemNetwork, Resolver};
pub use raft::{Persister, Raft};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
