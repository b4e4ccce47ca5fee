//! Membership changes: add a PreVoter, watch it catch up and get promoted,
//! and exercise the CAS guard.

mod common;

use std::time::Duration;

use tokio::time::sleep;
use tokio::time::timeout;

use common::expect_committed;
use common::fast_config;
use common::start_cluster;
use common::start_node;
use raftlet::consensus::error_code_for;
use raftlet::proto::ChangeConfigRequest;
use raftlet::proto::ChangeConfigType;
use raftlet::proto::ConsensusErrorCode;
use raftlet::proto::MemberType;
use raftlet::proto::RaftPeer;

fn add_server_request(
    leader: &str,
    uuid: &str,
    cas: Option<u64>,
) -> ChangeConfigRequest {
    ChangeConfigRequest {
        tablet_id: common::TABLET_ID.to_string(),
        dest_uuid: leader.to_string(),
        change_type: ChangeConfigType::AddServer as i32,
        server: Some(RaftPeer {
            uuid: uuid.to_string(),
            address: format!("{uuid}.local:7100"),
            member_type: MemberType::PreVoter as i32,
        }),
        cas_config_opid_index: cas,
    }
}

#[tokio::test]
async fn test_add_server_catches_up_and_promotes() {
    let mut cluster = start_cluster(&["node-a", "node-b", "node-c"], fast_config()).await;
    let leader = cluster.wait_for_leader().await;
    expect_committed(cluster.write(&leader, b"before-add").await);

    // The new node boots with the old config; it learns the rest through
    // replicated config changes.
    let node_d = start_node(
        &cluster.router,
        "node-d",
        cluster.config.clone(),
        fast_config(),
    );
    cluster.nodes.insert("node-d".to_string(), node_d);

    let pending = cluster
        .node(&leader)
        .core
        .change_config(add_server_request(&leader, "node-d", None))
        .expect("add accepted");
    assert!(pending.has_peer("node-d"));
    assert_eq!(
        pending.peer("node-d").unwrap().member_type(),
        MemberType::PreVoter
    );

    // The PreVoter catches up, gets promoted automatically, and the final
    // committed config carries four voters.
    timeout(Duration::from_secs(10), async {
        loop {
            let config = cluster
                .node(&leader)
                .core
                .committed_config()
                .expect("config");
            if config.peer("node-d").map(|p| p.member_type()) == Some(MemberType::Voter) {
                return config;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("node-d promoted to voter");

    let config = cluster.node(&leader).core.committed_config().unwrap();
    assert_eq!(config.voter_count(), 4);
    assert!(!config.has_peer_in_transit());
    assert!(config.opid_index > 0);

    // The grown cluster still replicates end to end.
    let op = expect_committed(cluster.write(&leader, b"after-add").await);
    cluster.wait_for_committed_index("node-d", op.index).await;
}

#[tokio::test]
async fn test_change_config_cas_mismatch_rejected() {
    let cluster = start_cluster(&["node-a", "node-b", "node-c"], fast_config()).await;
    let leader = cluster.wait_for_leader().await;
    expect_committed(cluster.write(&leader, b"probe").await);

    let committed = cluster.node(&leader).core.committed_config().unwrap();
    let err = cluster
        .node(&leader)
        .core
        .change_config(add_server_request(
            &leader,
            "node-x",
            Some(committed.opid_index + 42),
        ))
        .unwrap_err();
    assert_eq!(error_code_for(&err), ConsensusErrorCode::CasFailed);
}

#[tokio::test]
async fn test_remove_server_requires_membership() {
    let cluster = start_cluster(&["node-a", "node-b", "node-c"], fast_config()).await;
    let leader = cluster.wait_for_leader().await;
    expect_committed(cluster.write(&leader, b"probe").await);

    // Removing an unknown server fails cleanly.
    let err = cluster
        .node(&leader)
        .core
        .change_config(ChangeConfigRequest {
            tablet_id: common::TABLET_ID.to_string(),
            dest_uuid: leader.clone(),
            change_type: ChangeConfigType::RemoveServer as i32,
            server: Some(RaftPeer {
                uuid: "node-x".to_string(),
                address: String::new(),
                member_type: MemberType::UnknownMember as i32,
            }),
            cas_config_opid_index: None,
        })
        .unwrap_err();
    assert_eq!(
        error_code_for(&err),
        ConsensusErrorCode::RemoveChangeConfigNotPresent
    );

    // A leader cannot remove itself.
    let err = cluster
        .node(&leader)
        .core
        .change_config(ChangeConfigRequest {
            tablet_id: common::TABLET_ID.to_string(),
            dest_uuid: leader.clone(),
            change_type: ChangeConfigType::RemoveServer as i32,
            server: Some(RaftPeer {
                uuid: leader.clone(),
                address: String::new(),
                member_type: MemberType::Voter as i32,
            }),
            cas_config_opid_index: None,
        })
        .unwrap_err();
    assert_eq!(error_code_for(&err), ConsensusErrorCode::LeaderNeedsStepDown);
}

#[tokio::test]
async fn test_step_down_refused_for_lagging_protege() {
    let cluster = start_cluster(&["node-a", "node-b", "node-c"], fast_config()).await;
    let leader = cluster.wait_for_leader().await;

    let lagging = ["node-a", "node-b", "node-c"]
        .into_iter()
        .find(|uuid| *uuid != leader)
        .unwrap();
    cluster.router.partition(lagging);
    // Committed on the remaining majority; the partitioned node missed it.
    expect_committed(cluster.write(&leader, b"ahead").await);

    let err = cluster
        .node(&leader)
        .core
        .step_down(raftlet::proto::StepDownRequest {
            tablet_id: common::TABLET_ID.to_string(),
            dest_uuid: leader.clone(),
            new_leader_uuid: Some(lagging.to_string()),
        })
        .await
        .unwrap_err();
    assert_eq!(
        error_code_for(&err),
        ConsensusErrorCode::LeaderNotReadyToStepDown
    );
    // The refusal must not have cost us leadership.
    assert_eq!(cluster.node(&leader).core.role(), raftlet::PeerRole::Leader);
}

#[tokio::test]
async fn test_step_down_hands_leadership_to_protege() {
    let cluster = start_cluster(&["node-a", "node-b", "node-c"], fast_config()).await;
    let old_leader = cluster.wait_for_leader().await;
    expect_committed(cluster.write(&old_leader, b"probe").await);

    let protege = ["node-a", "node-b", "node-c"]
        .into_iter()
        .find(|uuid| *uuid != old_leader)
        .unwrap();

    // The protege must be fully caught up before the handoff is accepted;
    // retry while replication drains.
    timeout(Duration::from_secs(10), async {
        loop {
            let result = cluster
                .node(&old_leader)
                .core
                .step_down(raftlet::proto::StepDownRequest {
                    tablet_id: common::TABLET_ID.to_string(),
                    dest_uuid: old_leader.clone(),
                    new_leader_uuid: Some(protege.to_string()),
                })
                .await;
            if result.is_ok() {
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("step down accepted");

    let new_leader = cluster.wait_for_leader().await;
    assert_eq!(new_leader, protege);
}
