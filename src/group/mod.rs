//! Replica group: the replicated KV state machine, the commands it applies,
//! the handler/apply rendezvous, and the server driving reconfiguration.

pub mod op;
pub mod server;
pub mod state;
pub mod waiter;

pub use op::{ErrCode, Op, PutAppendOp};
pub use server::GroupServer;
pub use state::{KvState, ShardStatus};
