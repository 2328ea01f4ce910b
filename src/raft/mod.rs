//! Raft replication core: consensus node, log, wire messages, and stable
//! storage.

pub mod log;
pub mod message;
pub mod node;
pub mod persist;

pub use message::ApplyMsg;
pub use node::{Raft, Role};
pub use persist::Persister;
