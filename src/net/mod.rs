//! RPC seams and glue
//!
//! The concrete transport lives outside this crate; these traits are the
//! boundary. [`RaftTransport`] carries the three inter-replica RPCs,
//! [`GroupRpc`] the client-facing and inter-group operations. The in-process
//! [`MemNetwork`] implementation backs every integration test.

mod memory;

pub use memory::MemNetwork;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::common::Result;
use crate::group::op::{
    GetArgs, GetReply, MigrateShardArgs, MigrateShardReply, PutAppendArgs, PutAppendReply,
};
use crate::raft::message::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply,
    RequestVoteArgs, RequestVoteReply,
};

/// Attempts per inter-replica RPC before the caller's own loop takes over.
pub const RPC_ATTEMPTS: usize = 3;

/// Delay between attempts.
pub const RPC_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Endpoint for the Raft RPCs of a single peer.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteReply>;
    async fn append_entries(&self, args: AppendEntriesArgs) -> Result<AppendEntriesReply>;
    async fn install_snapshot(&self, args: InstallSnapshotArgs) -> Result<InstallSnapshotReply>;
}

/// Endpoint for the operations a replica group serves.
#[async_trait]
pub trait GroupRpc: Send + Sync {
    async fn get(&self, args: GetArgs) -> Result<GetReply>;
    async fn put_append(&self, args: PutAppendArgs) -> Result<PutAppendReply>;
    async fn migrate_shard(&self, args: MigrateShardArgs) -> Result<MigrateShardReply>;
}

/// Turns a server address from a [`crate::master::ShardConfig`] into a live
/// endpoint, the moment it is needed. A crashed or unknown server resolves
/// to `None`.
pub trait Resolver: Send + Sync {
    fn group_end(&self, addr: &str) -> Option<Arc<dyn GroupRpc>>;
}

/// Retry a call a few times so one dropped message does not stall the
/// caller's whole tick. Non-retryable errors surface immediately.
pub async fn call_with_retry<T, F, Fut>(mut call: F, attempts: usize) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last = None;
    for attempt in 0..attempts {
        match call().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                tokio::time::sleep(RPC_RETRY_DELAY).await;
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or_else(|| crate::Error::Other("no rpc attempts made".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failure() {
        let calls = AtomicUsize::new(0);
        let result = call_with_retry(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::Unreachable("peer".into()))
                    } else {
                        Ok(n)
                    }
                }
            },
            RPC_ATTEMPTS,
        )
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let result: Result<()> = call_with_retry(
            || async { Err(Error::Unreachable("peer".into())) },
            RPC_ATTEMPTS,
        )
        .await;
        assert!(matches!(result, Err(Error::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_non_retryable_surfaces_immediately() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = call_with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Corrupted("bad".into())) }
            },
            RPC_ATTEMPTS,
        )
        .await;
        assert!(matches!(result, Err(Error::Corrupted(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
