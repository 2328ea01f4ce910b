//! Raft-level integration: elections, replication, failover, persistence,
//! and snapshot catch-up over the in-process network.

mod common;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use shardkv::raft::{ApplyMsg, Persister, Raft};
use shardkv::MemNetwork;

type AppliedLog = Arc<Mutex<Vec<ApplyMsg>>>;

struct RaftNode {
    raft: Arc<Raft>,
    applied: AppliedLog,
}

fn start_raft(net: &Arc<MemNetwork>, addrs: &[String], me: usize, dir: &Path) -> RaftNode {
    let peers = addrs.iter().map(|a| net.raft_end(a)).collect();
    let persister = Arc::new(
        Persister::open(dir.join(format!("{}.state", addrs[me]))).expect("open persister"),
    );
    let (tx, mut rx) = mpsc::channel(64);
    let raft = Raft::new(peers, me, persister, tx).expect("start raft");
    net.register_raft(&addrs[me], raft.clone());

    let applied: AppliedLog = Arc::new(Mutex::new(Vec::new()));
    let sink = applied.clone();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            sink.lock().unwrap().push(msg);
        }
    });

    RaftNode { raft, applied }
}

fn addrs(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("raft-{i}")).collect()
}

async fn wait_leader(nodes: &[Option<RaftNode>]) -> usize {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        for (i, node) in nodes.iter().enumerate() {
            if let Some(node) = node {
                if node.raft.is_leader() {
                    return i;
                }
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no leader elected"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn applied_commands(log: &AppliedLog) -> Vec<Vec<u8>> {
    log.lock()
        .unwrap()
        .iter()
        .filter_map(|msg| match msg {
            ApplyMsg::Command { data, .. } => Some(data.clone()),
            ApplyMsg::Snapshot { .. } => None,
        })
        .collect()
}

fn applied_snapshots(log: &AppliedLog) -> Vec<Vec<u8>> {
    log.lock()
        .unwrap()
        .iter()
        .filter_map(|msg| match msg {
            ApplyMsg::Snapshot { data } => Some(data.clone()),
            ApplyMsg::Command { .. } => None,
        })
        .collect()
}

async fn wait_applied(log: &AppliedLog, data: &[u8]) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if applied_commands(log).iter().any(|d| d == data) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "command {:?} never applied",
            String::from_utf8_lossy(data)
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_initial_election() {
    common::init_tracing();
    let net = MemNetwork::new();
    let dir = tempfile::tempdir().unwrap();
    let addrs = addrs(3);
    let nodes: Vec<Option<RaftNode>> = (0..3)
        .map(|i| Some(start_raft(&net, &addrs, i, dir.path())))
        .collect();

    let leader = wait_leader(&nodes).await;

    // Exactly one leader, and every replica agrees on its term.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let leaders: Vec<usize> = nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.as_ref().unwrap().raft.is_leader())
        .map(|(i, _)| i)
        .collect();
    assert_eq!(leaders, vec![leader]);

    let (term, _) = nodes[leader].as_ref().unwrap().raft.state();
    for node in nodes.iter().flatten() {
        assert_eq!(node.raft.state().0, term);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replication_to_all() {
    common::init_tracing();
    let net = MemNetwork::new();
    let dir = tempfile::tempdir().unwrap();
    let addrs = addrs(3);
    let nodes: Vec<Option<RaftNode>> = (0..3)
        .map(|i| Some(start_raft(&net, &addrs, i, dir.path())))
        .collect();

    let leader = wait_leader(&nodes).await;
    let (index, _) = nodes[leader]
        .as_ref()
        .unwrap()
        .raft
        .start(b"set x=42".to_vec())
        .expect("leader accepts start");
    assert_eq!(index, 1);

    for node in nodes.iter().flatten() {
        wait_applied(&node.applied, b"set x=42").await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_follower_rejects_start() {
    common::init_tracing();
    let net = MemNetwork::new();
    let dir = tempfile::tempdir().unwrap();
    let addrs = addrs(3);
    let nodes: Vec<Option<RaftNode>> = (0..3)
        .map(|i| Some(start_raft(&net, &addrs, i, dir.path())))
        .collect();

    let leader = wait_leader(&nodes).await;
    for (i, node) in nodes.iter().enumerate() {
        if i != leader {
            assert!(node.as_ref().unwrap().raft.start(b"nope".to_vec()).is_none());
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leader_failover_and_rejoin() {
    common::init_tracing();
    let net = MemNetwork::new();
    let dir = tempfile::tempdir().unwrap();
    let addrs = addrs(3);
    let mut nodes: Vec<Option<RaftNode>> = (0..3)
        .map(|i| Some(start_raft(&net, &addrs, i, dir.path())))
        .collect();

    let leader = wait_leader(&nodes).await;
    nodes[leader]
        .as_ref()
        .unwrap()
        .raft
        .start(b"first".to_vec())
        .unwrap();
    for node in nodes.iter().flatten() {
        wait_applied(&node.applied, b"first").await;
    }

    // Crash the leader; the survivors elect a new one and keep committing.
    net.remove(&addrs[leader]);
    nodes[leader].take().unwrap().raft.kill();

    let new_leader = wait_leader(&nodes).await;
    assert_ne!(new_leader, leader);
    nodes[new_leader]
        .as_ref()
        .unwrap()
        .raft
        .start(b"second".to_vec())
        .unwrap();
    for node in nodes.iter().flatten() {
        wait_applied(&node.applied, b"second").await;
    }

    // The crashed replica rejoins from its persisted state and catches up.
    nodes[leader] = Some(start_raft(&net, &addrs, leader, dir.path()));
    let rejoined = nodes[leader].as_ref().unwrap();
    wait_applied(&rejoined.applied, b"first").await;
    wait_applied(&rejoined.applied, b"second").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_uncommitted_entries_overwritten() {
    common::init_tracing();
    let net = MemNetwork::new();
    let dir = tempfile::tempdir().unwrap();
    let addrs = addrs(3);
    let mut nodes: Vec<Option<RaftNode>> = (0..3)
        .map(|i| Some(start_raft(&net, &addrs, i, dir.path())))
        .collect();

    let leader = wait_leader(&nodes).await;
    let followers: Vec<usize> = (0..3).filter(|&i| i != leader).collect();

    // Cut the leader off, then let it append an entry it can never commit.
    for &f in &followers {
        net.remove(&addrs[f]);
    }
    nodes[leader]
        .as_ref()
        .unwrap()
        .raft
        .start(b"orphan".to_vec())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    net.remove(&addrs[leader]);
    nodes[leader].take().unwrap().raft.kill();
    for &f in &followers {
        let node = nodes[f].take().unwrap();
        node.raft.kill();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The two followers restart, form a majority, and commit their own
    // entry at the orphan's index.
    for &f in &followers {
        nodes[f] = Some(start_raft(&net, &addrs, f, dir.path()));
    }
    let new_leader = wait_leader(&nodes).await;
    nodes[new_leader]
        .as_ref()
        .unwrap()
        .raft
        .start(b"winner".to_vec())
        .unwrap();

    // The deposed leader comes back; its orphan is overwritten.
    nodes[leader] = Some(start_raft(&net, &addrs, leader, dir.path()));
    for node in nodes.iter().flatten() {
        wait_applied(&node.applied, b"winner").await;
        assert!(
            !applied_commands(&node.applied).iter().any(|d| d == b"orphan"),
            "uncommitted entry must never apply"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_snapshot_catchup_for_lagging_replica() {
    common::init_tracing();
    let net = MemNetwork::new();
    let dir = tempfile::tempdir().unwrap();
    let addrs = addrs(3);
    let mut nodes: Vec<Option<RaftNode>> = (0..3)
        .map(|i| Some(start_raft(&net, &addrs, i, dir.path())))
        .collect();

    let leader = wait_leader(&nodes).await;
    let laggard = (0..3).find(|&i| i != leader).unwrap();

    for n in 0..5u8 {
        nodes[leader]
            .as_ref()
            .unwrap()
            .raft
            .start(vec![b'a', n])
            .unwrap();
    }
    for node in nodes.iter().flatten() {
        wait_applied(&node.applied, &[b'a', 4]).await;
    }

    // One replica falls behind while the others move on.
    net.remove(&addrs[laggard]);
    nodes[laggard].take().unwrap().raft.kill();

    let leader = wait_leader(&nodes).await;
    let mut last_index = 0;
    for n in 0..20u8 {
        let (index, _) = nodes[leader]
            .as_ref()
            .unwrap()
            .raft
            .start(vec![b'b', n])
            .unwrap();
        last_index = index;
    }
    for node in nodes.iter().flatten() {
        wait_applied(&node.applied, &[b'b', 19]).await;
    }

    // Compact everything applied so far on both live replicas; whichever
    // leads afterwards has lost the log prefix, so the laggard can only
    // catch up via InstallSnapshot.
    let snapshot = b"state-through-compaction".to_vec();
    for node in nodes.iter().flatten() {
        node.raft
            .persist_and_save_snapshot(last_index, snapshot.clone())
            .unwrap();
    }

    nodes[laggard] = Some(start_raft(&net, &addrs, laggard, dir.path()));
    let rejoined = nodes[laggard].as_ref().unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if applied_snapshots(&rejoined.applied)
            .iter()
            .any(|d| d == &snapshot)
        {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "lagging replica never received the snapshot"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Entries appended after the snapshot still flow to it.
    let leader = wait_leader(&nodes).await;
    nodes[leader]
        .as_ref()
        .unwrap()
        .raft
        .start(b"post-snapshot".to_vec())
        .unwrap();
    wait_applied(&rejoined.applied, b"post-snapshot").await;
}
