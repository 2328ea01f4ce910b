//! End-to-end scenarios over full replica groups: basic ops, shard
//! migration, and wrong-group rejection.

mod common;

use std::time::Duration;

use common::TestCluster;
use shardkv::group::op::{ErrCode, GetArgs};
use shardkv::{key2shard, ShardStatus, NSHARDS};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_put_append_get_single_group() {
    let cluster = TestCluster::new(&[100], 3, -1);
    cluster.install_config([100; NSHARDS]);
    cluster.wait_for_config(1).await;

    let mut clerk = cluster.clerk();
    clerk.put("a", "1").await;
    clerk.append("a", "2").await;

    assert_eq!(clerk.get("a").await, Some("12".to_string()));
    assert_eq!(clerk.get("b").await, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overwrite_and_many_keys() {
    let cluster = TestCluster::new(&[100], 3, -1);
    cluster.install_config([100; NSHARDS]);
    cluster.wait_for_config(1).await;

    let mut clerk = cluster.clerk();
    for i in 0..20 {
        clerk.put(&format!("key-{i}"), &format!("v{i}")).await;
    }
    clerk.put("key-7", "rewritten").await;

    assert_eq!(clerk.get("key-7").await, Some("rewritten".to_string()));
    assert_eq!(clerk.get("key-19").await, Some("v19".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_migration_moves_data() {
    let cluster = TestCluster::new(&[100, 200], 3, -1);
    cluster.install_config([100; NSHARDS]);
    cluster.wait_for_config(1).await;

    let mut clerk = cluster.clerk();
    clerk.put("x", "v").await;

    // Move x's shard to the other group; the clerk re-resolves on its own.
    let shard = key2shard("x");
    let mut assignment = [100; NSHARDS];
    assignment[shard] = 200;
    cluster.install_config(assignment);
    cluster.wait_for_config(2).await;

    assert_eq!(clerk.get("x").await, Some("v".to_string()));

    for server in cluster.live_servers(200) {
        assert_eq!(server.shard_status(shard), ShardStatus::Available);
    }
    for server in cluster.live_servers(100) {
        assert_eq!(server.shard_status(shard), ShardStatus::NotOwned);
    }
    cluster.assert_single_owner_per_shard();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_importing_shard_rejects_reads() {
    let mut cluster = TestCluster::new(&[100, 200], 3, -1);
    cluster.install_config([100; NSHARDS]);
    cluster.wait_for_config(1).await;

    let mut clerk = cluster.clerk();
    clerk.put("k", "v").await;

    // The old owner goes dark, so the hand-off can never complete and the
    // new owner stays importing.
    for i in 0..cluster.replica_count(100) {
        cluster.kill_server(100, i);
    }
    let shard = key2shard("k");
    let mut assignment = [100; NSHARDS];
    assignment[shard] = 200;
    cluster.install_config(assignment);

    let leader = cluster.wait_for_leader(200).await;
    let server = cluster.server(200, leader).unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while server.shard_status(shard) != ShardStatus::Importing {
        assert!(
            tokio::time::Instant::now() < deadline,
            "new owner never started importing"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let reply = server
        .handle_get(GetArgs {
            key: "k".to_string(),
            client_id: 1,
            serial: 1,
        })
        .await;
    assert!(!reply.wrong_leader);
    assert_eq!(reply.err, ErrCode::WrongGroup);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_clients() {
    let cluster = TestCluster::new(&[100], 3, -1);
    cluster.install_config([100; NSHARDS]);
    cluster.wait_for_config(1).await;

    let mut writers = Vec::new();
    for client in 0..4 {
        let mut clerk = cluster.clerk();
        writers.push(tokio::spawn(async move {
            let key = format!("counter-{client}");
            for i in 0..10 {
                clerk.append(&key, &format!("[{i}]")).await;
            }
        }));
    }
    for writer in writers {
        writer.await.unwrap();
    }

    let mut clerk = cluster.clerk();
    let expected: String = (0..10).map(|i| format!("[{i}]")).collect();
    for client in 0..4 {
        assert_eq!(
            clerk.get(&format!("counter-{client}")).await,
            Some(expected.clone())
        );
    }
}
