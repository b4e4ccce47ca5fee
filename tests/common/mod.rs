//! In-process cluster harness: every node is a real `ConsensusCore` +
//! `Pipeline`; the "network" is a router that dispatches proxy calls
//! directly into the destination node, with per-node partitioning.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::DashSet;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tokio::time::timeout;
use tonic::async_trait;

use raftlet::consensus::ConsensusCore;
use raftlet::consensus::ConsensusCoreArgs;
use raftlet::proto::ConsensusMetaDoc;
use raftlet::proto::ConsensusRequest;
use raftlet::proto::ConsensusResponse;
use raftlet::proto::LeaderElectionLostRequest;
use raftlet::proto::MemberType;
use raftlet::proto::OpId;
use raftlet::proto::OperationType;
use raftlet::proto::QuorumConfig;
use raftlet::proto::RaftPeer;
use raftlet::proto::ReplicateMsg;
use raftlet::proto::RunLeaderElectionRequest;
use raftlet::proto::StartRemoteBootstrapRequest;
use raftlet::proto::VoteRequest;
use raftlet::proto::VoteResponse;
use raftlet::storage::InMemMetaStore;
use raftlet::storage::InMemWal;
use raftlet::tablet::CompletionStatus;
use raftlet::tablet::Operation;
use raftlet::tablet::Pipeline;
use raftlet::tablet::ReplicaOperationBuilder;
use raftlet::BootstrapInfo;
use raftlet::ConsensusOptions;
use raftlet::NetworkError;
use raftlet::PeerProxy;
use raftlet::PeerProxyFactory;
use raftlet::PeerRole;
use raftlet::Result;
use raftlet::SystemError;
use raftlet::SystemHybridClock;
use raftlet::TabletConfig;
use raftlet::TypeConfig;

pub const TABLET_ID: &str = "tablet-1";

// ---------------------------------------------------------------------
// Type config and loopback transport
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct LocalTypeConfig;

impl TypeConfig for LocalTypeConfig {
    type Wal = InMemWal;
    type Meta = InMemMetaStore;
    type PF = LocalRouterHandle;
    type Clock = SystemHybridClock;
}

/// Shared "switchboard": uuid → core, plus the set of partitioned nodes.
#[derive(Default)]
pub struct LocalRouter {
    nodes: DashMap<String, Arc<ConsensusCore<LocalTypeConfig>>>,
    down: DashSet<String>,
}

impl LocalRouter {
    pub fn register(
        &self,
        core: Arc<ConsensusCore<LocalTypeConfig>>,
    ) {
        self.nodes.insert(core.peer_uuid().to_string(), core);
    }

    pub fn deregister(
        &self,
        uuid: &str,
    ) {
        self.nodes.remove(uuid);
    }

    pub fn partition(
        &self,
        uuid: &str,
    ) {
        self.down.insert(uuid.to_string());
    }

    pub fn heal(
        &self,
        uuid: &str,
    ) {
        self.down.remove(uuid);
    }

    fn reachable(
        &self,
        src: &str,
        dest: &str,
    ) -> Result<Arc<ConsensusCore<LocalTypeConfig>>> {
        if self.down.contains(src) || self.down.contains(dest) {
            return Err(SystemError::Network(NetworkError::Unreachable(format!(
                "{src} -> {dest} partitioned"
            )))
            .into());
        }
        self.nodes
            .get(dest)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                SystemError::Network(NetworkError::Unreachable(format!("{dest} is gone"))).into()
            })
    }
}

/// Per-node factory: remembers which node is dialing.
#[derive(Clone)]
pub struct LocalRouterHandle {
    pub router: Arc<LocalRouter>,
    pub src: String,
}

impl PeerProxyFactory for LocalRouterHandle {
    fn proxy_for(
        &self,
        peer: &RaftPeer,
    ) -> Result<Arc<dyn PeerProxy>> {
        Ok(Arc::new(LocalPeerProxy {
            router: self.router.clone(),
            src: self.src.clone(),
            dest: peer.uuid.clone(),
        }))
    }
}

struct LocalPeerProxy {
    router: Arc<LocalRouter>,
    src: String,
    dest: String,
}

#[async_trait]
impl PeerProxy for LocalPeerProxy {
    async fn update_consensus(
        &self,
        request: ConsensusRequest,
    ) -> Result<ConsensusResponse> {
        let core = self.router.reachable(&self.src, &self.dest)?;
        core.update(request).await
    }

    async fn request_vote(
        &self,
        request: VoteRequest,
    ) -> Result<VoteResponse> {
        let core = self.router.reachable(&self.src, &self.dest)?;
        core.request_vote(request).await
    }

    async fn run_leader_election(
        &self,
        request: RunLeaderElectionRequest,
    ) -> Result<()> {
        let core = self.router.reachable(&self.src, &self.dest)?;
        core.handle_run_leader_election(request)
    }

    async fn leader_election_lost(
        &self,
        request: LeaderElectionLostRequest,
    ) -> Result<()> {
        let core = self.router.reachable(&self.src, &self.dest)?;
        core.handle_leader_election_lost(request);
        Ok(())
    }

    async fn start_remote_bootstrap(
        &self,
        _request: StartRemoteBootstrapRequest,
    ) -> Result<()> {
        // The harness has no tablet data to copy; catch-up runs through
        // normal appends.
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Engine stand-ins
// ---------------------------------------------------------------------

/// Write operation whose completion is reported over a oneshot.
pub struct TestWrite {
    payload: Bytes,
    completion: Mutex<Option<oneshot::Sender<CompletionStatus>>>,
}

impl TestWrite {
    pub fn new(payload: &[u8]) -> (Box<dyn Operation>, oneshot::Receiver<CompletionStatus>) {
        let (tx, rx) = oneshot::channel();
        (
            Box::new(TestWrite {
                payload: Bytes::copy_from_slice(payload),
                completion: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }
}

#[async_trait]
impl Operation for TestWrite {
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

/// Replica-side builder that records applied payloads in order.
pub struct RecordingBuilder {
    applied: Arc<Mutex<Vec<Bytes>>>,
}

struct RecordingOp {
    payload: Bytes,
    applied: Arc<Mutex<Vec<Bytes>>>,
}

impl ReplicaOperationBuilder for RecordingBuilder {
    fn build(
        &self,
        msg: &ReplicateMsg,
    ) -> Result<Box<dyn Operation>> {
        Ok(Box::new(RecordingOp {
            payload: msg.payload.clone(),
            applied: self.applied.clone(),
        }))
    }
}

#[async_trait]
impl Operation for RecordingOp {
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

// ---------------------------------------------------------------------
// Cluster harness
// ---------------------------------------------------------------------

pub struct TestNode {
    pub core: Arc<ConsensusCore<LocalTypeConfig>>,
    pub pipeline: Arc<Pipeline<LocalTypeConfig>>,
    pub wal: Arc<InMemWal>,
    pub meta: Arc<InMemMetaStore>,
    pub applied: Arc<Mutex<Vec<Bytes>>>,
}

impl TestNode {
    pub fn applied_payloads(&self) -> Vec<Bytes> {
        self.applied.lock().clone()
    }
}

pub struct LocalCluster {
    pub router: Arc<LocalRouter>,
    pub nodes: HashMap<String, TestNode>,
    pub config: QuorumConfig,
}

pub fn fast_config() -> TabletConfig {
    TabletConfig {
        consensus: ConsensusOptions {
            heartbeat_interval_ms: 40,
            leader_failure_max_missed_heartbeat_periods: 5.0,
            leader_lease_duration_ms: 400,
            ht_lease_duration_ms: 400,
            consensus_rpc_timeout_ms: 400,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn voters_config(uuids: &[&str]) -> QuorumConfig {
    QuorumConfig {
        opid_index: 0,
        peers: uuids
            .iter()
            .map(|uuid| RaftPeer {
                uuid: uuid.to_string(),
                address: format!("{uuid}.local:7100"),
                member_type: MemberType::Voter as i32,
            })
            .collect(),
    }
}

pub fn start_node(
    router: &Arc<LocalRouter>,
    uuid: &str,
    initial_config: QuorumConfig,
    tablet_config: TabletConfig,
) -> TestNode {
    start_node_with_storage(
        router,
        uuid,
        initial_config,
        tablet_config,
        Arc::new(InMemWal::new()),
        Arc::new(InMemMetaStore::default()),
        BootstrapInfo::default(),
    )
}

pub fn start_node_with_storage(
    router: &Arc<LocalRouter>,
    uuid: &str,
    initial_config: QuorumConfig,
    tablet_config: TabletConfig,
    wal: Arc<InMemWal>,
    meta: Arc<InMemMetaStore>,
    bootstrap: BootstrapInfo,
) -> TestNode {
    let core = ConsensusCore::new(ConsensusCoreArgs {
        tablet_id: TABLET_ID.to_string(),
        local_uuid: uuid.to_string(),
        local_addr: format!("{uuid}.local:7100"),
        config: tablet_config.clone(),
        initial_config,
        meta_store: meta.clone(),
        wal: wal.clone(),
        proxy_factory: Arc::new(LocalRouterHandle {
            router: router.clone(),
            src: uuid.to_string(),
        }),
        clock: Arc::new(SystemHybridClock),
    })
    .expect("core");

    let applied = Arc::new(Mutex::new(Vec::new()));
    let pipeline = Pipeline::new(
        core.clone(),
        tablet_config.pipeline,
        Box::new(RecordingBuilder {
            applied: applied.clone(),
        }),
    );
    core.start(bootstrap).expect("start");
    router.register(core.clone());

    TestNode {
        core,
        pipeline,
        wal,
        meta,
        applied,
    }
}

pub async fn start_cluster(
    uuids: &[&str],
    tablet_config: TabletConfig,
) -> LocalCluster {
    let router: Arc<LocalRouter> = Arc::new(LocalRouter::default());
    let config = voters_config(uuids);
    let mut nodes = HashMap::new();
    for uuid in uuids {
        nodes.insert(
            uuid.to_string(),
            start_node(&router, uuid, config.clone(), tablet_config.clone()),
        );
    }
    LocalCluster {
        router,
        nodes,
        config,
    }
}

impl LocalCluster {
    pub fn node(
        &self,
        uuid: &str,
    ) -> &TestNode {
        self.nodes.get(uuid).expect("known node")
    }

    /// Waits for exactly one reachable node to hold leadership.
    pub async fn wait_for_leader(&self) -> String {
        let deadline = Duration::from_secs(10);
        timeout(deadline, async {
            loop {
                let leaders: Vec<String> = self
                    .nodes
                    .iter()
                    .filter(|(uuid, node)| {
                        !self.router.down.contains(uuid.as_str())
                            && node.core.role() == PeerRole::Leader
                    })
                    .map(|(uuid, _)| uuid.clone())
                    .collect();
                if leaders.len() == 1 {
                    return leaders.into_iter().next().unwrap();
                }
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("a leader within 10s")
    }

    /// Submits a write through the leader's pipeline and waits for commit.
    pub async fn write(
        &self,
        leader: &str,
        payload: &[u8],
    ) -> CompletionStatus {
        let (op, completion) = TestWrite::new(payload);
        self.node(leader).pipeline.submit(op).expect("submit");
        timeout(Duration::from_secs(10), completion)
            .await
            .expect("write completes in time")
            .expect("completion delivered")
    }

    pub async fn wait_for_committed_index(
        &self,
        uuid: &str,
        index: u64,
    ) {
        let node = self.node(uuid);
        timeout(Duration::from_secs(10), async {
            while node.core.committed_index() < index {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "{uuid} stuck at committed index {} (wanted {index})",
                node.core.committed_index()
            )
        });
    }

    pub async fn wait_for_applied(
        &self,
        uuid: &str,
        count: usize,
    ) {
        let node = self.node(uuid);
        timeout(Duration::from_secs(10), async {
            while node.applied.lock().len() < count {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "{uuid} applied {} ops (wanted {count})",
                node.applied.lock().len()
            )
        });
    }
}

pub fn expect_committed(status: CompletionStatus) -> OpId {
    match status {
        CompletionStatus::Committed { op_id, .. } => op_id,
        CompletionStatus::Aborted { reason } => panic!("write aborted: {reason}"),
    }
}

/// Metadata snapshot helper for persistence assertions.
pub fn load_meta(node: &TestNode) -> ConsensusMetaDoc {
    use raftlet::storage::MetaStore;
    node.meta.load().expect("load").expect("present")
}
