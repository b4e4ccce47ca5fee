use std::sync::Arc;

use parking_lot::Mutex;

use super::ConsensusObserver;
use super::MajorityReplicated;
use super::MessageQueue;
use super::NextRequest;
use super::TriggerMode;
use crate::proto::ConsensusErrorCode;
use crate::proto::ConsensusErrorDetail;
use crate::proto::ConsensusResponse;
use crate::proto::ConsensusStatus;
use crate::proto::MemberType;
use crate::proto::OpId;
use crate::storage::InMemWal;
use crate::storage::WalLog;
use crate::test_utils::replicate_msg;
use crate::test_utils::test_peer;
use crate::test_utils::test_tablet_config;
use crate::test_utils::MockTypeConfig;
use crate::SystemHybridClock;
use crate::MINIMUM_OP_ID;

#[derive(Default)]
struct RecordingObserver {
    majority: Mutex<Vec<MajorityReplicated>>,
    failed: Mutex<Vec<String>>,
    higher_terms: Mutex<Vec<u64>>,
    promotions: Mutex<Vec<String>>,
}

impl ConsensusObserver for RecordingObserver {
    fn on_majority_replicated(
        &self,
        info: MajorityReplicated,
    ) {
        self.majority.lock().push(info);
    }

    fn on_follower_failed(
        &self,
        uuid: &str,
        _reason: &str,
    ) {
        self.failed.lock().push(uuid.to_string());
    }

    fn on_observed_higher_term(
        &self,
        term: u64,
    ) {
        self.higher_terms.lock().push(term);
    }

    fn on_promotion_ready(
        &self,
        uuid: &str,
    ) {
        self.promotions.lock().push(uuid.to_string());
    }
}

struct Fixture {
    queue: Arc<MessageQueue<MockTypeConfig>>,
    wal: Arc<InMemWal>,
    observer: Arc<RecordingObserver>,
}

fn leader_fixture() -> Fixture {
    let wal = Arc::new(InMemWal::new());
    let queue = MessageQueue::<MockTypeConfig>::new(
        "peer-a".to_string(),
        "peer-a.test.local:7100".to_string(),
        "tablet-1".to_string(),
        test_tablet_config().consensus,
        wal.clone(),
        Arc::new(SystemHybridClock),
    );
    let observer: Arc<RecordingObserver> = Arc::new(RecordingObserver::default());
    let observer_dyn: std::sync::Weak<dyn ConsensusObserver> =
        Arc::downgrade(&(observer.clone() as Arc<dyn ConsensusObserver>));
    queue.set_observer(observer_dyn);
    queue.init_leader_mode(1, 0, MINIMUM_OP_ID);
    queue.track_peer(test_peer("peer-b", MemberType::Voter));
    queue.track_peer(test_peer("peer-c", MemberType::Voter));
    Fixture {
        queue,
        wal,
        observer,
    }
}

fn append(
    fixture: &Fixture,
    term: u64,
    indices: std::ops::RangeInclusive<u64>,
) {
    let msgs: Vec<_> = indices
        .map(|i| Arc::new(replicate_msg(term, i, format!("p{i}").as_bytes())))
        .collect();
    fixture
        .queue
        .append_operations(msgs, Box::new(|result| assert!(result.is_ok())))
        .expect("append");
}

fn ok_response(
    uuid: &str,
    term: u64,
    last: OpId,
    committed: u64,
) -> ConsensusResponse {
    ConsensusResponse {
        responder_uuid: uuid.to_string(),
        responder_term: term,
        status: Some(ConsensusStatus {
            last_received: last,
            last_received_current_leader: last,
            last_committed_idx: committed,
            error: None,
        }),
    }
}

#[test]
fn test_request_contains_batch_and_preceding_id() {
    let fixture = leader_fixture();
    append(&fixture, 1, 1..=3);

    let next = fixture
        .queue
        .request_for_peer("peer-b", TriggerMode::NonEmptyOnly)
        .expect("request");
    let NextRequest::Send(prepared) = next else {
        panic!("expected a send");
    };
    assert_eq!(prepared.request.preceding_id, MINIMUM_OP_ID);
    assert_eq!(prepared.num_ops, 3);
    assert_eq!(prepared.request.ops[0].id, OpId::new(1, 1));
    assert_eq!(prepared.request.caller_uuid, "peer-a");
    assert!(prepared.request.leader_lease_duration_ms.is_some());
}

#[test]
fn test_empty_request_skipped_when_non_empty_only() {
    let fixture = leader_fixture();
    let next = fixture
        .queue
        .request_for_peer("peer-b", TriggerMode::NonEmptyOnly)
        .expect("request");
    assert!(matches!(next, NextRequest::Idle));

    // A heartbeat still goes out.
    let next = fixture
        .queue
        .request_for_peer("peer-b", TriggerMode::AlwaysSend)
        .expect("request");
    assert!(matches!(next, NextRequest::Send(_)));
}

#[test]
fn test_majority_watermark_needs_a_peer_ack() {
    let fixture = leader_fixture();
    append(&fixture, 1, 1..=2);
    // Local durability alone is 1 of 3 voters.
    assert_eq!(fixture.queue.majority_replicated(), MINIMUM_OP_ID);

    let grants = match fixture
        .queue
        .request_for_peer("peer-b", TriggerMode::NonEmptyOnly)
        .expect("request")
    {
        NextRequest::Send(prepared) => prepared.lease_grants,
        _ => panic!("expected send"),
    };
    let more = fixture.queue.response_from_peer(
        "peer-b",
        grants,
        &ok_response("peer-b", 1, OpId::new(1, 2), 0),
    );
    assert!(!more);

    assert_eq!(fixture.queue.majority_replicated(), OpId::new(1, 2));
    let majority = fixture.observer.majority.lock();
    assert_eq!(majority.len(), 1);
    assert_eq!(majority[0].op_id, OpId::new(1, 2));
    assert!(majority[0].lease_deadline.is_some());
}

#[test]
fn test_watermark_is_kth_largest_not_max() {
    let fixture = leader_fixture();
    append(&fixture, 1, 1..=4);

    let grants = super::LeaseGrants::default();
    // peer-b acks only op 1; local log has 4. Majority (2 of 3) = 1.
    fixture.queue.response_from_peer(
        "peer-b",
        grants,
        &ok_response("peer-b", 1, OpId::new(1, 1), 0),
    );
    assert_eq!(fixture.queue.majority_replicated(), OpId::new(1, 1));

    // peer-c acks op 3: sorted acks are [1, 3, 4] -> majority = 3.
    fixture.queue.response_from_peer(
        "peer-c",
        grants,
        &ok_response("peer-c", 1, OpId::new(1, 3), 0),
    );
    assert_eq!(fixture.queue.majority_replicated(), OpId::new(1, 3));
}

#[test]
fn test_preceding_mismatch_walks_next_index_back() {
    let fixture = leader_fixture();
    append(&fixture, 1, 1..=5);

    // The peer reports it never got anything from the current leader.
    let response = ConsensusResponse {
        responder_uuid: "peer-b".to_string(),
        responder_term: 1,
        status: Some(ConsensusStatus {
            last_received: OpId::new(1, 4),
            last_received_current_leader: OpId::new(1, 2),
            last_committed_idx: 0,
            error: Some(ConsensusErrorDetail::new(
                ConsensusErrorCode::PrecedingEntryDidntMatch,
                "",
            )),
        }),
    };
    let more = fixture
        .queue
        .response_from_peer("peer-b", super::LeaseGrants::default(), &response);
    assert!(more, "negotiation wants an immediate resend");
    assert_eq!(fixture.queue.peer_next_index("peer-b"), Some(3));
}

#[test]
fn test_higher_term_response_notifies_observer() {
    let fixture = leader_fixture();
    append(&fixture, 1, 1..=1);
    let more = fixture.queue.response_from_peer(
        "peer-b",
        super::LeaseGrants::default(),
        &ok_response("peer-b", 9, OpId::new(1, 1), 0),
    );
    assert!(!more);
    assert_eq!(*fixture.observer.higher_terms.lock(), vec![9]);
    // The stale ack must not move the watermark.
    assert_eq!(fixture.queue.majority_replicated(), MINIMUM_OP_ID);
}

#[test]
fn test_peer_below_retained_range_needs_remote_bootstrap() {
    let fixture = leader_fixture();
    append(&fixture, 1, 1..=6);
    fixture.wal.gc_up_to(4);
    fixture.queue.update_committed_index(4);

    // peer-b negotiated all the way back to index 1.
    let response = ConsensusResponse {
        responder_uuid: "peer-b".to_string(),
        responder_term: 1,
        status: Some(ConsensusStatus {
            last_received: OpId::new(1, 2),
            last_received_current_leader: MINIMUM_OP_ID,
            last_committed_idx: 0,
            error: Some(ConsensusErrorDetail::new(
                ConsensusErrorCode::PrecedingEntryDidntMatch,
                "",
            )),
        }),
    };
    fixture
        .queue
        .response_from_peer("peer-b", super::LeaseGrants::default(), &response);
    // next_index walked back to 2; entry 1 is gone from cache and log.
    let next = fixture
        .queue
        .request_for_peer("peer-b", TriggerMode::AlwaysSend)
        .expect("request");
    let NextRequest::RemoteBootstrap(request) = next else {
        panic!("expected remote bootstrap");
    };
    assert_eq!(request.dest_uuid, "peer-b");
    assert_eq!(request.bootstrap_source_uuid, "peer-a");

    // The flag is sticky until the peer answers an exchange.
    let next = fixture
        .queue
        .request_for_peer("peer-b", TriggerMode::AlwaysSend)
        .expect("request");
    assert!(matches!(next, NextRequest::RemoteBootstrap(_)));
}

#[test]
fn test_transit_peer_promotion_when_caught_up() {
    let fixture = leader_fixture();
    fixture
        .queue
        .track_peer(test_peer("peer-d", MemberType::PreVoter));
    append(&fixture, 1, 1..=2);

    fixture.queue.response_from_peer(
        "peer-d",
        super::LeaseGrants::default(),
        &ok_response("peer-d", 1, OpId::new(1, 2), 0),
    );
    let next = fixture
        .queue
        .request_for_peer("peer-d", TriggerMode::AlwaysSend)
        .expect("request");
    assert!(matches!(next, NextRequest::PromoteToFull { .. }));
}

#[test]
fn test_eviction_threshold_reports_follower() {
    let wal = Arc::new(InMemWal::new());
    let mut options = test_tablet_config().consensus;
    options.evict_failed_followers = true;
    options.follower_unreachable_max_missed_periods = 3;
    let queue = MessageQueue::<MockTypeConfig>::new(
        "peer-a".to_string(),
        "peer-a.test.local:7100".to_string(),
        "tablet-1".to_string(),
        options,
        wal,
        Arc::new(SystemHybridClock),
    );
    let observer: Arc<RecordingObserver> = Arc::new(RecordingObserver::default());
    let observer_dyn: std::sync::Weak<dyn ConsensusObserver> =
        Arc::downgrade(&(observer.clone() as Arc<dyn ConsensusObserver>));
    queue.set_observer(observer_dyn);
    queue.init_leader_mode(1, 0, MINIMUM_OP_ID);
    queue.track_peer(test_peer("peer-b", MemberType::Voter));

    queue.record_failed_exchange("peer-b");
    queue.record_failed_exchange("peer-b");
    assert!(observer.failed.lock().is_empty());
    queue.record_failed_exchange("peer-b");
    assert_eq!(*observer.failed.lock(), vec!["peer-b".to_string()]);

    // A response resets the counter.
    queue.notify_peer_is_responsive("peer-b");
    queue.record_failed_exchange("peer-b");
    assert_eq!(observer.failed.lock().len(), 1);
}

#[test]
fn test_next_index_invariant_holds() {
    let fixture = leader_fixture();
    append(&fixture, 1, 1..=3);
    let local = fixture.queue.local_last_enqueued().index;
    for uuid in ["peer-b", "peer-c"] {
        let next = fixture.queue.peer_next_index(uuid).unwrap();
        assert!(next <= local + 1, "next_index {next} > local+1");
    }
}
