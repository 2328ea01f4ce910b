//! Handler/apply rendezvous
//!
//! Each RPC handler registers a one-shot waiter under the log index its
//! command was started at; the apply task is the sole completer and removes
//! the entry as it fires. Registering over a stale index drops the previous
//! sender, which wakes that handler with an error instead of leaving it to
//! time out.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::group::op::Op;

/// What the apply task observed for one log index.
#[derive(Debug)]
pub struct Applied {
    pub index: u64,
    pub term: u64,
    pub op: Op,
}

#[derive(Default)]
pub struct WaiterMap {
    waiters: HashMap<u64, oneshot::Sender<Applied>>,
}

impl WaiterMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, index: u64) -> oneshot::Receiver<Applied> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(index, tx);
        rx
    }

    pub fn complete(&mut self, index: u64, applied: Applied) {
        if let Some(tx) = self.waiters.remove(&index) {
            // The handler may have timed out and gone away; that is fine.
            let _ = tx.send(applied);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_op(serial: u64) -> Op {
        Op::Get {
            key: "k".into(),
            client_id: 1,
            serial,
        }
    }

    #[tokio::test]
    async fn test_rendezvous_delivers() {
        let mut waiters = WaiterMap::new();
        let rx = waiters.register(4);
        waiters.complete(
            4,
            Applied {
                index: 4,
                term: 2,
                op: get_op(1),
            },
        );

        let applied = rx.await.unwrap();
        assert_eq!(applied.index, 4);
        assert_eq!(applied.term, 2);
    }

    #[tokio::test]
    async fn test_complete_without_waiter_is_noop() {
        let mut waiters = WaiterMap::new();
        waiters.complete(
            9,
            Applied {
                index: 9,
                term: 1,
                op: get_op(1),
            },
        );
    }

    #[tokio::test]
    async fn test_reregister_wakes_stale_waiter() {
        let mut waiters = WaiterMap::new();
        let stale = waiters.register(4);
        let fresh = waiters.register(4);

        // The stale handler learns immediately that its entry was displaced.
        assert!(stale.await.is_err());

        waiters.complete(
            4,
            Applied {
                index: 4,
                term: 3,
                op: get_op(2),
            },
        );
        assert_eq!(fresh.await.unwrap().term, 3);
    }
}
