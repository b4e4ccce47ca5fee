//! Per-tablet queue that pipelines appends to remote peers and tracks
//! replication watermarks.
//!
//! The leader runs it in `Leader` mode, where every successful peer ack
//! recomputes the majority-replicated watermark (the k-th largest
//! `last_received` across voters, k = floor(N/2)+1) and the majority lease
//! deadlines. Followers run it in `NonLeader` mode, where it only tracks
//! the local log watermark.
//!
//! The queue owns its own mutex and must never call into `ReplicaState`
//! while holding it: everything observable is computed under the lock and
//! fanned out through the (weak) observer afterwards.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use super::TriggerMode;
use crate::alias::CKOF;
use crate::alias::WOF;
use crate::config::ConsensusOptions;
use crate::errors::NetworkError;
use crate::errors::SystemError;
use crate::metrics::MAJORITY_DONE_OPS;
use crate::proto::ConsensusErrorCode;
use crate::proto::ConsensusRequest;
use crate::proto::ConsensusResponse;
use crate::proto::MemberType;
use crate::proto::OpId;
use crate::proto::QuorumConfig;
use crate::proto::RaftPeer;
use crate::proto::ReplicateMsg;
use crate::proto::StartRemoteBootstrapRequest;
use crate::storage::AppendCallback;
use crate::storage::LogCache;
use crate::utils::quorum::majority_watermark;
use crate::HybridClock;
use crate::Result;
use crate::TypeConfig;
use crate::WalLog;
use crate::MINIMUM_OP_ID;

/// Everything the core needs to hear about, fanned out off-lock.
pub trait ConsensusObserver: Send + Sync {
    /// The majority watermark advanced, carrying the lease deadlines a
    /// majority has acknowledged.
    fn on_majority_replicated(
        &self,
        info: MajorityReplicated,
    );

    /// A follower has been unreachable past the eviction threshold, or
    /// answered with the wrong server uuid.
    fn on_follower_failed(
        &self,
        uuid: &str,
        reason: &str,
    );

    /// A response carried a term higher than ours.
    fn on_observed_higher_term(
        &self,
        term: u64,
    );

    /// A peer in transit (PreVoter/PreObserver) has caught up and should be
    /// promoted to its full member type.
    fn on_promotion_ready(
        &self,
        uuid: &str,
    );
}

#[derive(Debug, Clone)]
pub struct MajorityReplicated {
    pub op_id: OpId,
    pub lease_deadline: Option<Instant>,
    pub ht_lease_expiration: Option<u64>,
}

/// Lease bounds granted in an outbound request, measured before the send so
/// the ack can never be more optimistic than what was offered.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeaseGrants {
    pub deadline: Option<Instant>,
    pub ht_expiration: Option<u64>,
}

/// What a peer pump should do next.
pub enum NextRequest {
    /// Nothing new for this peer and the trigger was `NonEmptyOnly`.
    Idle,
    /// Peer is too far behind the retained log; copy the tablet wholesale.
    RemoteBootstrap(StartRemoteBootstrapRequest),
    /// Peer caught up while still in transit; promote it.
    PromoteToFull { uuid: String },
    Send(Box<PreparedRequest>),
}

pub struct PreparedRequest {
    pub request: ConsensusRequest,
    pub lease_grants: LeaseGrants,
    pub num_ops: usize,
}

/// Per-remote bookkeeping, kept for the lifetime of the membership.
struct PeerTrack {
    peer: RaftPeer,
    next_index: u64,
    last_received: OpId,
    last_known_committed_index: u64,
    last_successful_communication: Instant,
    is_last_exchange_successful: bool,
    needs_remote_bootstrap: bool,
    consecutive_failed_exchanges: u64,
    acked_lease_deadline: Option<Instant>,
    acked_ht_lease_expiration: u64,
}

impl PeerTrack {
    fn new(
        peer: RaftPeer,
        next_index: u64,
    ) -> Self {
        Self {
            peer,
            next_index,
            last_received: MINIMUM_OP_ID,
            last_known_committed_index: 0,
            last_successful_communication: Instant::now(),
            is_last_exchange_successful: false,
            needs_remote_bootstrap: false,
            consecutive_failed_exchanges: 0,
            acked_lease_deadline: None,
            acked_ht_lease_expiration: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueMode {
    Leader,
    NonLeader,
}

struct QueueInner {
    mode: QueueMode,
    current_term: u64,
    committed_index: u64,
    peers: HashMap<String, PeerTrack>,
    cache: LogCache,
    /// Last op enqueued to the local log (readable from the cache).
    local_last_enqueued: OpId,
    /// Last op durable in the local log (counts as our own ack).
    local_durable: OpId,
    majority_replicated: OpId,
}

pub struct MessageQueue<T: TypeConfig> {
    local_uuid: String,
    local_addr: String,
    tablet_id: String,
    options: ConsensusOptions,
    wal: Arc<WOF<T>>,
    clock: Arc<CKOF<T>>,
    observer: Mutex<Option<Weak<dyn ConsensusObserver>>>,
    inner: Mutex<QueueInner>,
}

impl<T: TypeConfig> MessageQueue<T> {
    pub fn new(
        local_uuid: String,
        local_addr: String,
        tablet_id: String,
        options: ConsensusOptions,
        wal: Arc<WOF<T>>,
        clock: Arc<CKOF<T>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_uuid,
            local_addr,
            tablet_id,
            options,
            wal,
            clock,
            observer: Mutex::new(None),
            inner: Mutex::new(QueueInner {
                mode: QueueMode::NonLeader,
                current_term: 0,
                committed_index: 0,
                peers: HashMap::new(),
                cache: LogCache::default(),
                local_last_enqueued: MINIMUM_OP_ID,
                local_durable: MINIMUM_OP_ID,
                majority_replicated: MINIMUM_OP_ID,
            }),
        })
    }

    pub fn set_observer(
        &self,
        observer: Weak<dyn ConsensusObserver>,
    ) {
        *self.observer.lock() = Some(observer);
    }

    fn notify<F>(
        &self,
        f: F,
    ) where
        F: FnOnce(&dyn ConsensusObserver),
    {
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer.and_then(|w| w.upgrade()) {
            f(observer.as_ref());
        }
    }

    /// Switches to leader mode for `term`. Existing tracks are dropped; the
    /// caller re-tracks the peers of the active config.
    pub fn init_leader_mode(
        &self,
        term: u64,
        committed_index: u64,
        last_enqueued: OpId,
    ) {
        let mut inner = self.inner.lock();
        inner.mode = QueueMode::Leader;
        inner.current_term = term;
        inner.committed_index = committed_index;
        inner.local_last_enqueued = last_enqueued;
        if inner.local_durable < last_enqueued {
            inner.local_durable = self.wal.last_op_id();
        }
        inner.majority_replicated = MINIMUM_OP_ID;
        inner.peers.clear();
        debug!(
            "T {} P {}: queue in leader mode, term={}, committed_index={}",
            self.tablet_id, self.local_uuid, term, committed_index
        );
    }

    pub fn set_non_leader_mode(
        &self,
        term: u64,
    ) {
        let mut inner = self.inner.lock();
        inner.mode = QueueMode::NonLeader;
        inner.current_term = term;
        inner.peers.clear();
    }

    pub fn track_peer(
        &self,
        peer: RaftPeer,
    ) {
        let mut inner = self.inner.lock();
        let next_index = inner.local_last_enqueued.index + 1;
        inner
            .peers
            .entry(peer.uuid.clone())
            .or_insert_with(|| PeerTrack::new(peer, next_index));
    }

    pub fn untrack_peer(
        &self,
        uuid: &str,
    ) {
        self.inner.lock().peers.remove(uuid);
    }

    /// Re-syncs tracked member types after a config change without losing
    /// negotiated watermarks.
    pub fn update_tracked_peers(
        &self,
        config: &QuorumConfig,
    ) {
        let mut inner = self.inner.lock();
        let next_index = inner.local_last_enqueued.index + 1;
        inner
            .peers
            .retain(|uuid, _| config.has_peer(uuid) || uuid == &self.local_uuid);
        for peer in &config.peers {
            if peer.uuid == self.local_uuid {
                continue;
            }
            match inner.peers.get_mut(&peer.uuid) {
                Some(track) => track.peer = peer.clone(),
                None => {
                    inner
                        .peers
                        .insert(peer.uuid.clone(), PeerTrack::new(peer.clone(), next_index));
                }
            }
        }
    }

    /// Bootstrap-only: primes the local watermarks from the recovered log.
    pub fn prime_local(
        &self,
        last: OpId,
    ) {
        let mut inner = self.inner.lock();
        inner.local_last_enqueued = last;
        inner.local_durable = last;
    }

    /// Called by the core after the committed index advances, so subsequent
    /// requests and cache eviction see it.
    pub fn update_committed_index(
        &self,
        committed_index: u64,
    ) {
        let mut inner = self.inner.lock();
        if committed_index > inner.committed_index {
            inner.committed_index = committed_index;
            inner.cache.evict_up_to(committed_index);
        }
    }

    pub fn local_last_enqueued(&self) -> OpId {
        self.inner.lock().local_last_enqueued
    }

    pub fn majority_replicated(&self) -> OpId {
        self.inner.lock().majority_replicated
    }

    /// Enqueues messages to the local log. The queue keeps reference-counted
    /// ownership so peers can read them back without touching the log, and
    /// `callback` fires once the batch is durable.
    pub fn append_operations(
        self: &Arc<Self>,
        msgs: Vec<Arc<ReplicateMsg>>,
        callback: AppendCallback,
    ) -> Result<()> {
        if msgs.is_empty() {
            callback(Ok(()));
            return Ok(());
        }
        let last = msgs.last().map(|m| m.id).unwrap_or_default();
        {
            let mut inner = self.inner.lock();
            // A term boundary may overwrite a suffix: drop displaced entries
            // before inserting the replacements.
            if last.term > inner.local_last_enqueued.term
                && msgs[0].id.index <= inner.local_last_enqueued.index
            {
                inner.cache.truncate_after(msgs[0].id.index.saturating_sub(1));
            }
            for msg in &msgs {
                inner.cache.insert(msg.clone());
            }
            if last > inner.local_last_enqueued || last.index < inner.local_last_enqueued.index {
                inner.local_last_enqueued = last;
            }
        }

        let queue = Arc::downgrade(self);
        self.wal.append(
            msgs,
            Box::new(move |result| {
                if result.is_ok() {
                    if let Some(queue) = queue.upgrade() {
                        queue.local_append_durable(last);
                    }
                }
                callback(result);
            }),
        )
    }

    fn local_append_durable(
        &self,
        last: OpId,
    ) {
        let advanced = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if last > inner.local_durable {
                inner.local_durable = last;
            }
            self.recompute_majority(inner)
        };
        if let Some(info) = advanced {
            self.notify(|obs| obs.on_majority_replicated(info));
        }
    }

    /// Assembles the next request for `uuid`, or decides the pump should do
    /// something other than send.
    pub fn request_for_peer(
        &self,
        uuid: &str,
        trigger: TriggerMode,
    ) -> Result<NextRequest> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let committed_index = inner.committed_index;
        let local_last = inner.local_last_enqueued;
        let mode = inner.mode;
        let current_term = inner.current_term;

        let track = inner
            .peers
            .get_mut(uuid)
            .ok_or_else(|| SystemError::Network(NetworkError::PeerProxyNotFound(uuid.into())))?;

        if track.needs_remote_bootstrap {
            return Ok(self.remote_bootstrap_request(uuid));
        }

        if track.is_last_exchange_successful
            && track.last_received == local_last
            && matches!(
                track.peer.member_type(),
                MemberType::PreVoter | MemberType::PreObserver
            )
        {
            return Ok(NextRequest::PromoteToFull {
                uuid: uuid.to_string(),
            });
        }

        // A peer whose next entry has been garbage-collected cannot catch up
        // incrementally, no matter what its preceding id resolves to.
        let next_index = track.next_index;
        if mode == QueueMode::Leader
            && next_index <= local_last.index
            && next_index < self.wal.min_retained_index()
            && inner.cache.get(next_index).is_none()
        {
            track.needs_remote_bootstrap = true;
            warn!(
                "T {} P {}: peer {} needs op {} below retained range {}",
                self.tablet_id,
                self.local_uuid,
                uuid,
                next_index,
                self.wal.min_retained_index()
            );
            return Ok(self.remote_bootstrap_request(uuid));
        }

        // Resolve the entry immediately preceding next_index.
        let preceding_index = next_index.saturating_sub(1);
        let preceding_id = if preceding_index == 0 {
            MINIMUM_OP_ID
        } else if let Some(id) = inner.cache.op_id_at(preceding_index) {
            id
        } else if preceding_index == local_last.index {
            local_last
        } else {
            match self.wal.read_op(preceding_index)? {
                Some(msg) => msg.id,
                None => {
                    // Below the retained range: incremental catch-up is
                    // impossible.
                    track.needs_remote_bootstrap = true;
                    warn!(
                        "T {} P {}: peer {} needs entry {} below retained range {}",
                        self.tablet_id,
                        self.local_uuid,
                        uuid,
                        preceding_index,
                        self.wal.min_retained_index()
                    );
                    return Ok(self.remote_bootstrap_request(uuid));
                }
            }
        };

        let mut ops: Vec<ReplicateMsg> = Vec::new();
        if mode == QueueMode::Leader {
            let cached = inner
                .cache
                .read_from(next_index, self.options.max_ops_per_request);
            if !cached.is_empty() {
                ops = cached.iter().map(|m| (**m).clone()).collect();
            } else {
                // Cache miss (evicted but retained): fall back to the log.
                let mut index = next_index;
                while ops.len() < self.options.max_ops_per_request && index <= local_last.index {
                    match self.wal.read_op(index)? {
                        Some(msg) => ops.push((*msg).clone()),
                        None => break,
                    }
                    index += 1;
                }
            }
        }

        if ops.is_empty() && trigger == TriggerMode::NonEmptyOnly {
            return Ok(NextRequest::Idle);
        }

        let num_ops = ops.len();
        let now_ht = self.clock.now_ht();
        let mut lease_grants = LeaseGrants::default();
        let mut leader_lease_duration_ms = None;
        let mut ht_lease_expiration = None;
        if mode == QueueMode::Leader {
            if self.options.leader_lease_duration_ms > 0 {
                leader_lease_duration_ms = Some(self.options.leader_lease_duration_ms as u32);
                lease_grants.deadline =
                    Some(Instant::now() + self.options.leader_lease().expect("lease enabled"));
            }
            if self.options.ht_lease_duration_ms > 0 {
                let expiration = now_ht + self.options.ht_lease_duration_ms * 1000;
                ht_lease_expiration = Some(expiration);
                lease_grants.ht_expiration = Some(expiration);
            }
        }

        let request = ConsensusRequest {
            caller_uuid: self.local_uuid.clone(),
            caller_term: current_term,
            tablet_id: self.tablet_id.clone(),
            dest_uuid: uuid.to_string(),
            preceding_id,
            committed_index,
            ops,
            propagated_hybrid_time: Some(now_ht),
            propagated_safe_time: Some(now_ht),
            leader_lease_duration_ms,
            ht_lease_expiration,
        };
        trace!(
            "T {} P {}: request for {} with {} ops, preceding={}",
            self.tablet_id,
            self.local_uuid,
            uuid,
            num_ops,
            request.preceding_id
        );

        Ok(NextRequest::Send(Box::new(PreparedRequest {
            request,
            lease_grants,
            num_ops,
        })))
    }

    fn remote_bootstrap_request(
        &self,
        uuid: &str,
    ) -> NextRequest {
        NextRequest::RemoteBootstrap(StartRemoteBootstrapRequest {
            dest_uuid: uuid.to_string(),
            tablet_id: self.tablet_id.clone(),
            bootstrap_source_uuid: self.local_uuid.clone(),
            bootstrap_source_addr: self.local_addr.clone(),
        })
    }

    /// Ingests a peer's response. Returns true when the peer still has more
    /// ops waiting, so the pump should immediately send again.
    pub fn response_from_peer(
        &self,
        uuid: &str,
        lease_grants: LeaseGrants,
        response: &ConsensusResponse,
    ) -> bool {
        let (more_pending, advanced, higher_term) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let current_term = inner.current_term;
            let local_last = inner.local_last_enqueued;
            let Some(track) = inner.peers.get_mut(uuid) else {
                return false;
            };

            if response.responder_term > current_term {
                track.is_last_exchange_successful = false;
                (false, None, Some(response.responder_term))
            } else {
                let Some(status) = &response.status else {
                    track.is_last_exchange_successful = false;
                    return false;
                };

                match status.error.as_ref().map(|e| e.code()) {
                    Some(ConsensusErrorCode::PrecedingEntryDidntMatch) => {
                        // Negotiate: jump back to the peer's current-leader
                        // watermark when it has one, else walk back one.
                        let lrcl = status.last_received_current_leader;
                        track.next_index = if !lrcl.is_min() {
                            lrcl.index + 1
                        } else {
                            track.next_index.saturating_sub(1).max(1)
                        };
                        track.is_last_exchange_successful = false;
                        track.consecutive_failed_exchanges = 0;
                        debug!(
                            "T {} P {}: peer {} preceding mismatch, next_index -> {}",
                            self.tablet_id, self.local_uuid, uuid, track.next_index
                        );
                        (true, None, None)
                    }
                    Some(_) => {
                        // Logical error from a reachable peer: keep it
                        // trackable, let the heartbeater retry.
                        track.is_last_exchange_successful = false;
                        track.consecutive_failed_exchanges = 0;
                        (false, None, None)
                    }
                    None => {
                        track.last_received = status.last_received;
                        track.next_index = status.last_received.index + 1;
                        track.last_known_committed_index = status.last_committed_idx;
                        track.is_last_exchange_successful = true;
                        track.consecutive_failed_exchanges = 0;
                        track.last_successful_communication = Instant::now();
                        track.needs_remote_bootstrap = false;
                        if let Some(deadline) = lease_grants.deadline {
                            track.acked_lease_deadline = Some(deadline);
                        }
                        if let Some(ht) = lease_grants.ht_expiration {
                            track.acked_ht_lease_expiration = ht;
                        }
                        let more = track.next_index <= local_last.index;
                        let advanced = self.recompute_majority(inner);
                        (more, advanced, None)
                    }
                }
            }
        };

        if let Some(term) = higher_term {
            self.notify(|obs| obs.on_observed_higher_term(term));
        }
        if let Some(info) = advanced {
            self.notify(|obs| obs.on_majority_replicated(info));
        }
        more_pending
    }

    /// Resets the unreachability counter: the peer answered, even if with a
    /// logical error.
    pub fn notify_peer_is_responsive(
        &self,
        uuid: &str,
    ) {
        if let Some(track) = self.inner.lock().peers.get_mut(uuid) {
            track.consecutive_failed_exchanges = 0;
        }
    }

    /// Records a failed exchange; past the threshold the observer is asked
    /// to evict the follower.
    pub fn record_failed_exchange(
        &self,
        uuid: &str,
    ) {
        let report = {
            let mut inner = self.inner.lock();
            let Some(track) = inner.peers.get_mut(uuid) else {
                return;
            };
            track.is_last_exchange_successful = false;
            track.consecutive_failed_exchanges += 1;
            self.options.evict_failed_followers
                && track.consecutive_failed_exchanges
                    >= self.options.follower_unreachable_max_missed_periods
        };
        if report {
            self.notify(|obs| {
                obs.on_follower_failed(uuid, "unreachable past the eviction threshold")
            });
        }
    }

    pub fn report_failed_follower(
        &self,
        uuid: &str,
        reason: &str,
    ) {
        self.notify(|obs| obs.on_follower_failed(uuid, reason));
    }

    pub fn notify_promotion_ready(
        &self,
        uuid: &str,
    ) {
        self.notify(|obs| obs.on_promotion_ready(uuid));
    }

    /// Watermark of a named peer; test and introspection surface.
    pub fn peer_last_received(
        &self,
        uuid: &str,
    ) -> Option<OpId> {
        self.inner.lock().peers.get(uuid).map(|t| t.last_received)
    }

    pub fn peer_next_index(
        &self,
        uuid: &str,
    ) -> Option<u64> {
        self.inner.lock().peers.get(uuid).map(|t| t.next_index)
    }

    /// k-th largest voter watermark, including our own durable log position.
    fn recompute_majority(
        &self,
        inner: &mut QueueInner,
    ) -> Option<MajorityReplicated> {
        if inner.mode != QueueMode::Leader {
            return None;
        }

        let now = Instant::now();
        let now_ht = self.clock.now_ht();
        let mut indices: Vec<u64> = Vec::new();
        let mut lease_deadlines: Vec<Instant> = Vec::new();
        let mut ht_leases: Vec<u64> = Vec::new();

        // Our own vote: durable log position, and a self-granted lease.
        indices.push(inner.local_durable.index);
        if self.options.leader_lease_duration_ms > 0 {
            lease_deadlines.push(now + self.options.leader_lease().expect("lease enabled"));
        }
        if self.options.ht_lease_duration_ms > 0 {
            ht_leases.push(now_ht + self.options.ht_lease_duration_ms * 1000);
        }

        for track in inner.peers.values() {
            if track.peer.member_type() != MemberType::Voter {
                continue;
            }
            indices.push(track.last_received.index);
            if let Some(deadline) = track.acked_lease_deadline {
                lease_deadlines.push(deadline);
            }
            ht_leases.push(track.acked_ht_lease_expiration);
        }

        let watermark_index = majority_watermark(&indices)?;
        if watermark_index <= inner.majority_replicated.index {
            return None;
        }

        let term = inner
            .cache
            .term_of(watermark_index)
            .or_else(|| {
                (inner.local_durable.index == watermark_index).then_some(inner.local_durable.term)
            })
            .or_else(|| {
                self.wal
                    .read_op(watermark_index)
                    .ok()
                    .flatten()
                    .map(|m| m.id.term)
            })?;
        let op_id = OpId::new(term, watermark_index);
        inner.majority_replicated = op_id;
        MAJORITY_DONE_OPS.inc();

        Some(MajorityReplicated {
            op_id,
            lease_deadline: majority_watermark(&lease_deadlines),
            ht_lease_expiration: majority_watermark(&ht_leases).filter(|&ht| ht > 0),
        })
    }
}
