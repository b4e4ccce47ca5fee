//! A partitioned follower negotiates its way back and catches up without
//! duplicate applies.

mod common;

use tracing_test::traced_test;

use common::expect_committed;
use common::fast_config;
use common::start_cluster;

#[tokio::test]
#[traced_test]
async fn test_lagging_follower_catches_up_after_heal() {
    let cluster = start_cluster(&["node-a", "node-b", "node-c"], fast_config()).await;
    let leader = cluster.wait_for_leader().await;

    // One committed write while everyone is connected.
    expect_committed(cluster.write(&leader, b"w1").await);

    let lagging = ["node-a", "node-b", "node-c"]
        .into_iter()
        .find(|uuid| *uuid != leader)
        .unwrap();
    cluster.router.partition(lagging);

    // Replication proceeds on the remaining majority.
    let mut last = None;
    for i in 2..=8 {
        last = Some(expect_committed(
            cluster.write(&leader, format!("w{i}").as_bytes()).await,
        ));
    }
    let last = last.unwrap();

    cluster.router.heal(lagging);
    cluster.wait_for_committed_index(lagging, last.index).await;
    cluster.wait_for_applied(lagging, 8).await;

    // No duplicated applies, and byte-for-byte the same order as a healthy
    // follower.
    let healthy = ["node-a", "node-b", "node-c"]
        .into_iter()
        .find(|uuid| *uuid != leader && *uuid != lagging)
        .unwrap();
    cluster.wait_for_applied(healthy, 8).await;
    assert_eq!(
        cluster.node(lagging).applied_payloads(),
        cluster.node(healthy).applied_payloads()
    );
    assert_eq!(cluster.node(lagging).applied_payloads().len(), 8);
}
