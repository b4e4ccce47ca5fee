//! Restart: term and vote survive via the metadata store, and WAL replay
//! rebuilds the pending map so the node rejoins without redelivery of
//! everything.

mod common;

use raftlet::storage::WalLog;
use raftlet::BootstrapInfo;

use common::expect_committed;
use common::fast_config;
use common::start_cluster;
use common::start_node_with_storage;

#[tokio::test]
async fn test_follower_restart_resumes_from_its_log() {
    let mut cluster = start_cluster(&["node-a", "node-b", "node-c"], fast_config()).await;
    let leader = cluster.wait_for_leader().await;

    let mut last = None;
    for i in 1..=5 {
        last = Some(expect_committed(
            cluster.write(&leader, format!("w{i}").as_bytes()).await,
        ));
    }
    let last = last.unwrap();

    let restarting = ["node-a", "node-b", "node-c"]
        .into_iter()
        .find(|uuid| *uuid != leader)
        .unwrap();
    cluster.wait_for_committed_index(restarting, last.index).await;

    // Take the node down, remembering what bootstrap would recover: the
    // OpId of the last applied entry, read back from the log.
    let (wal, meta, committed_op, term_before) = {
        let node = cluster.node(restarting);
        let committed = node.core.committed_index();
        let committed_op = node
            .wal
            .read_op(committed)
            .expect("read")
            .expect("committed entry is in the log")
            .id;
        let term = node.core.current_term();
        cluster.router.partition(restarting);
        cluster.router.deregister(restarting);
        (node.wal.clone(), node.meta.clone(), committed_op, term)
    };
    cluster.nodes.remove(restarting).unwrap().core.shutdown().await;

    // Progress continues without it.
    let newer = expect_committed(cluster.write(&leader, b"while-down").await);

    // Restart on the same storage: the log tail above the recovered
    // committed index comes back as pending ops.
    let last_in_wal = wal.last_op_id();
    let node = start_node_with_storage(
        &cluster.router,
        restarting,
        cluster.config.clone(),
        fast_config(),
        wal,
        meta,
        BootstrapInfo {
            committed_op_id: committed_op,
        },
    );
    assert_eq!(node.core.committed_index(), committed_op.index);
    assert!(node.core.current_term() >= term_before, "terms are durable");
    assert!(last_in_wal.index >= committed_op.index);
    cluster.nodes.insert(restarting.to_string(), node);

    cluster.router.heal(restarting);
    cluster.wait_for_committed_index(restarting, newer.index).await;
}
