//! Shared helpers for unit tests: a mock-backed `TypeConfig`, config/round
//! builders, and a scriptable engine operation.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tonic::async_trait;

use crate::consensus::ConsensusRound;
use crate::consensus::ReplicaState;
use crate::proto::ConsensusMetaDoc;
use crate::proto::MemberType;
use crate::proto::OpId;
use crate::proto::OperationType;
use crate::proto::QuorumConfig;
use crate::proto::RaftPeer;
use crate::proto::ReplicateMsg;
use crate::storage::InMemMetaStore;
use crate::storage::InMemWal;
use crate::tablet::CompletionStatus;
use crate::tablet::Operation;
use crate::tablet::ReplicaOperationBuilder;
use crate::ConsensusOptions;
use crate::MockPeerProxyFactory;
use crate::Result;
use crate::SystemHybridClock;
use crate::TabletConfig;
use crate::TypeConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct MockTypeConfig;

impl TypeConfig for MockTypeConfig {
    type Wal = InMemWal;
    type Meta = InMemMetaStore;
    type PF = MockPeerProxyFactory;
    type Clock = SystemHybridClock;
}

pub fn test_peer(
    uuid: &str,
    member_type: MemberType,
) -> RaftPeer {
    RaftPeer {
        uuid: uuid.to_string(),
        address: format!("{uuid}.test.local:7100"),
        member_type: member_type as i32,
    }
}

pub fn three_node_config() -> QuorumConfig {
    QuorumConfig {
        opid_index: 0,
        peers: vec![
            test_peer("peer-a", MemberType::Voter),
            test_peer("peer-b", MemberType::Voter),
            test_peer("peer-c", MemberType::Voter),
        ],
    }
}

pub fn single_node_config(uuid: &str) -> QuorumConfig {
    QuorumConfig {
        opid_index: 0,
        peers: vec![test_peer(uuid, MemberType::Voter)],
    }
}

pub fn test_meta(
    current_term: u64,
    committed_config: QuorumConfig,
) -> ConsensusMetaDoc {
    ConsensusMetaDoc {
        current_term,
        voted_for: None,
        committed_config,
        pending_config: None,
    }
}

/// Fast-clock options so timing-sensitive tests finish quickly.
pub fn test_tablet_config() -> TabletConfig {
    TabletConfig {
        consensus: ConsensusOptions {
            heartbeat_interval_ms: 50,
            leader_failure_max_missed_heartbeat_periods: 4.0,
            leader_lease_duration_ms: 500,
            ht_lease_duration_ms: 500,
            consensus_rpc_timeout_ms: 500,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn test_replica_state(
    uuid: &str,
    meta: ConsensusMetaDoc,
) -> ReplicaState<MockTypeConfig> {
    ReplicaState::new(
        "tablet-1".to_string(),
        uuid.to_string(),
        Arc::new(InMemMetaStore::default()),
        meta,
    )
}

pub fn replicate_msg(
    term: u64,
    index: u64,
    payload: &[u8],
) -> ReplicateMsg {
    ReplicateMsg {
        op_type: OperationType::Write as i32,
        id: OpId::new(term, index),
        hybrid_time: 1,
        committed_op_id: OpId::default(),
        payload: Bytes::copy_from_slice(payload),
        config: None,
    }
}

pub fn bound_round(
    term: u64,
    index: u64,
    payload: &[u8],
) -> Arc<ConsensusRound> {
    ConsensusRound::new_bound(Arc::new(replicate_msg(term, index, payload)), term)
}

/// Single-node core wired to mocks; the node elects itself instantly, so
/// leader-path tests need no network.
pub fn single_node_core(
    uuid: &str,
) -> Arc<crate::consensus::ConsensusCore<MockTypeConfig>> {
    let mut factory = MockPeerProxyFactory::new();
    factory.expect_proxy_for().returning(|_| {
        Err(crate::errors::SystemError::Network(crate::errors::NetworkError::Unreachable(
            "no network in unit tests".to_string(),
        ))
        .into())
    });
    crate::consensus::ConsensusCore::new(crate::consensus::ConsensusCoreArgs {
        tablet_id: "tablet-1".to_string(),
        local_uuid: uuid.to_string(),
        local_addr: format!("{uuid}.test.local:7100"),
        config: test_tablet_config(),
        initial_config: single_node_config(uuid),
        meta_store: Arc::new(InMemMetaStore::default()),
        wal: Arc::new(InMemWal::new()),
        proxy_factory: Arc::new(factory),
        clock: Arc::new(SystemHybridClock),
    })
    .expect("core")
}

/// Scriptable engine operation: optionally fails prepare, records applies,
/// and reports its completion over a oneshot.
pub struct TestOperation {
    op_type: OperationType,
    payload: Bytes,
    fail_prepare: bool,
    applied: Arc<AtomicUsize>,
    completion: Mutex<Option<oneshot::Sender<CompletionStatus>>>,
}

impl TestOperation {
    pub fn new(payload: &[u8]) -> (Box<dyn Operation>, oneshot::Receiver<CompletionStatus>) {
        Self::with_type(OperationType::Write, payload, false)
    }

    pub fn failing_prepare(
        payload: &[u8],
    ) -> (Box<dyn Operation>, oneshot::Receiver<CompletionStatus>) {
        Self::with_type(OperationType::Write, payload, true)
    }

    pub fn with_type(
        op_type: OperationType,
        payload: &[u8],
        fail_prepare: bool,
    ) -> (Box<dyn Operation>, oneshot::Receiver<CompletionStatus>) {
        let (tx, rx) = oneshot::channel();
        let op = Box::new(TestOperation {
            op_type,
            payload: Bytes::copy_from_slice(payload),
            fail_prepare,
            applied: Arc::new(AtomicUsize::new(0)),
            completion: Mutex::new(Some(tx)),
        });
        (op, rx)
    }
}

#[async_trait]
impl Operation for TestOperation {
    fn op_type(&self) -> OperationType {
        self.op_type
    }

    fn payload(&self) -> Bytes {
        self.payload.clone()
    }

    async fn prepare(&self) -> Result<()> {
        if self.fail_prepare {
            return Err(crate::Error::InvalidConfig("prepare scripted to fail".into()));
        }
        Ok(())
    }

    async fn apply(
        &self,
        _op_id: OpId,
        _hybrid_time: u64,
    ) -> Result<()> {
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn finish(
        &self,
        status: CompletionStatus,
    ) {
        if let Some(tx) = self.completion.lock().take() {
            let _ = tx.send(status);
        }
    }
}

/// Builder that records every applied payload, for ordering assertions.
pub struct RecordingBuilder {
    pub applied: Arc<Mutex<Vec<Bytes>>>,
}

impl RecordingBuilder {
    pub fn new() -> (Self, Arc<Mutex<Vec<Bytes>>>) {
        let applied = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                applied: applied.clone(),
            },
            applied,
        )
    }
}

impl ReplicaOperationBuilder for RecordingBuilder {
    fn build(
        &self,
        msg: &ReplicateMsg,
    ) -> Result<Box<dyn Operation>> {
        Ok(Box::new(RecordingOperation {
            payload: msg.payload.clone(),
            applied: self.applied.clone(),
        }))
    }
}

struct RecordingOperation {
    payload: Bytes,
    applied: Arc<Mutex<Vec<Bytes>>>,
}

#[async_trait]
impl Operation for RecordingOperation {
    fn op_type(&self) -> OperationType {
        OperationType::Write
    }

    fn payload(&self) -> Bytes {
        self.payload.clone()
    }

    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    async fn apply(
        &self,
        _op_id: OpId,
        _hybrid_time: u64,
    ) -> Result<()> {
        self.applied.lock().push(self.payload.clone());
        Ok(())
    }

    fn finish(
        &self,
        _status: CompletionStatus,
    ) {
    }
}
