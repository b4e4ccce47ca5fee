//! The Raft orchestrator for one tablet.
//!
//! Owns the replica state, the message queue, and the peer set; exposes the
//! leader entry (`replicate_batch`), the follower entry (`update`), votes,
//! config changes, step-down, and elections. The follower path is
//! serialized by an update mutex that is always taken before the
//! replica-state mutex, never after.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::sync::Notify;
use tokio::time::sleep;
use tokio::time::sleep_until;
use tokio::time::timeout;
use tokio::time::Instant;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::ConsensusObserver;
use super::ConsensusRound;
use super::ElectionDecision;
use super::ElectionReason;
use super::FailureDetector;
use super::LeaseStatus;
use super::MajorityReplicated;
use super::MessageQueue;
use super::PeerManager;
use super::PeerRole;
use super::ReplicaState;
use super::RoundOutcome;
use super::TriggerMode;
use super::VoteCounter;
use crate::alias::CKOF;
use crate::alias::MSOF;
use crate::alias::PFOF;
use crate::alias::WOF;
use crate::config::TabletConfig;
use crate::errors::ConsensusError;
use crate::errors::ElectionError;
use crate::errors::MembershipError;
use crate::errors::NetworkError;
use crate::errors::ReplicationError;
use crate::errors::StateTransitionError;
use crate::errors::StorageError;
use crate::errors::SystemError;
use crate::metrics::ELECTIONS_STARTED;
use crate::metrics::ELECTIONS_WON;
use crate::metrics::FOLLOWER_EVICTIONS;
use crate::metrics::OPS_REPLICATED;
use crate::proto::ChangeConfigRequest;
use crate::proto::ChangeConfigType;
use crate::proto::ConsensusErrorCode;
use crate::proto::ConsensusErrorDetail;
use crate::proto::ConsensusMetaDoc;
use crate::proto::ConsensusRequest;
use crate::proto::ConsensusResponse;
use crate::proto::ConsensusStatus;
use crate::proto::LeaderElectionLostRequest;
use crate::proto::MemberType;
use crate::proto::OpId;
use crate::proto::OperationType;
use crate::proto::QuorumConfig;
use crate::proto::RaftPeer;
use crate::proto::ReplicateMsg;
use crate::proto::RunLeaderElectionRequest;
use crate::proto::StepDownRequest;
use crate::proto::VoteRequest;
use crate::proto::VoteResponse;
use crate::Error;
use crate::HybridClock;
use crate::MetaStore;
use crate::PeerProxyFactory;
use crate::Result;
use crate::StatusKind;
use crate::TypeConfig;
use crate::WalLog;
use crate::MINIMUM_OP_ID;

/// Routes replica-side operations (those not consumed by consensus itself)
/// to the tablet's prepare pipeline. Implemented by the operation pipeline;
/// held weakly to break the core↔pipeline cycle.
pub trait ReplicaOperationFactory: Send + Sync {
    fn start_replica_operation(
        &self,
        round: Arc<ConsensusRound>,
    ) -> Result<()>;
}

/// What bootstrap recovered before consensus starts.
#[derive(Debug, Clone, Copy, Default)]
pub struct BootstrapInfo {
    pub committed_op_id: OpId,
}

pub struct ConsensusCoreArgs<T: TypeConfig> {
    pub tablet_id: String,
    pub local_uuid: String,
    pub local_addr: String,
    pub config: TabletConfig,
    pub initial_config: QuorumConfig,
    pub meta_store: Arc<MSOF<T>>,
    pub wal: Arc<WOF<T>>,
    pub proxy_factory: Arc<PFOF<T>>,
    pub clock: Arc<CKOF<T>>,
}

pub struct ConsensusCore<T: TypeConfig> {
    tablet_id: String,
    local_uuid: String,
    config: TabletConfig,
    state: ReplicaState<T>,
    queue: Arc<MessageQueue<T>>,
    peer_manager: PeerManager<T>,
    proxy_factory: Arc<PFOF<T>>,
    wal: Arc<WOF<T>>,
    clock: Arc<CKOF<T>>,
    /// Serializes the follower ingest path; ordered strictly before the
    /// replica-state mutex.
    update_mutex: tokio::sync::Mutex<()>,
    detector: Arc<FailureDetector>,
    op_factory: Mutex<Option<Weak<dyn ReplicaOperationFactory>>>,
    lease_changed: Notify,
    /// Proteges that recently lost an election we instigated.
    protege_losses: Mutex<HashMap<String, Instant>>,
    pending_election_reason: Mutex<Option<ElectionReason>>,
    election_in_flight: AtomicBool,
    started: AtomicBool,
    weak_self: Mutex<Weak<ConsensusCore<T>>>,
}

impl<T: TypeConfig> ConsensusCore<T> {
    pub fn new(args: ConsensusCoreArgs<T>) -> Result<Arc<Self>> {
        args.config.validate()?;
        let meta = match args.meta_store.load()? {
            Some(meta) => meta,
            None => {
                args.initial_config
                    .validate()
                    .map_err(Error::InvalidConfig)?;
                let meta = ConsensusMetaDoc {
                    current_term: 0,
                    voted_for: None,
                    committed_config: args.initial_config.clone(),
                    pending_config: None,
                };
                args.meta_store.save(&meta)?;
                meta
            }
        };

        let queue = MessageQueue::<T>::new(
            args.local_uuid.clone(),
            args.local_addr.clone(),
            args.tablet_id.clone(),
            args.config.consensus.clone(),
            args.wal.clone(),
            args.clock.clone(),
        );
        let peer_manager = PeerManager::new(
            args.tablet_id.clone(),
            args.local_uuid.clone(),
            args.config.consensus.clone(),
            args.proxy_factory.clone(),
            queue.clone(),
        );
        let state = ReplicaState::new(
            args.tablet_id.clone(),
            args.local_uuid.clone(),
            args.meta_store.clone(),
            meta,
        );
        let detector = FailureDetector::new(args.config.consensus.election_timeout());

        let core = Arc::new(Self {
            tablet_id: args.tablet_id,
            local_uuid: args.local_uuid,
            config: args.config,
            state,
            queue: queue.clone(),
            peer_manager,
            proxy_factory: args.proxy_factory,
            wal: args.wal,
            clock: args.clock,
            update_mutex: tokio::sync::Mutex::new(()),
            detector,
            op_factory: Mutex::new(None),
            lease_changed: Notify::new(),
            protege_losses: Mutex::new(HashMap::new()),
            pending_election_reason: Mutex::new(None),
            election_in_flight: AtomicBool::new(false),
            started: AtomicBool::new(false),
            weak_self: Mutex::new(Weak::new()),
        });
        *core.weak_self.lock() = Arc::downgrade(&core);
        let observer: Weak<dyn ConsensusObserver> =
            Arc::downgrade(&(core.clone() as Arc<dyn ConsensusObserver>));
        queue.set_observer(observer);
        Ok(core)
    }

    pub fn tablet_id(&self) -> &str {
        &self.tablet_id
    }

    pub fn peer_uuid(&self) -> &str {
        &self.local_uuid
    }

    /// Connects the prepare pipeline that builds replica-side operations.
    /// Must happen before `start` so bootstrap replay can route orphans.
    pub fn set_operation_factory(
        &self,
        factory: Weak<dyn ReplicaOperationFactory>,
    ) {
        *self.op_factory.lock() = Some(factory);
    }

    /// Installs metadata, replays orphaned replicates as pending rounds,
    /// primes the committed index, and arms the failure detector.
    pub fn start(
        self: &Arc<Self>,
        bootstrap: BootstrapInfo,
    ) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ConsensusError::StateTransition(
                StateTransitionError::IllegalState {
                    expected: "Initialized",
                    actual: "Running",
                },
            )
            .into());
        }

        let last_logged = self.wal.last_op_id();
        self.state.start(last_logged)?;
        self.queue.prime_local(last_logged);

        let orphans = self
            .wal
            .orphaned_replicates(bootstrap.committed_op_id.index)?;
        {
            let mut rs = self.state.lock_for_update()?;
            rs.prime_committed(bootstrap.committed_op_id);
            for msg in orphans {
                // Replayed rounds were accepted in the term they carry.
                let round = ConsensusRound::new_bound(msg.clone(), msg.id.term);
                if !msg.is_consensus_only() {
                    self.start_replica_operation(&round)?;
                }
                rs.add_pending(round)?;
            }
            debug!(
                "T {} P {}: bootstrap replayed {} pending ops, committed={}",
                self.tablet_id,
                self.local_uuid,
                rs.pending_rounds(),
                bootstrap.committed_op_id
            );
        }

        let weak = self.weak_self.lock().clone();
        self.detector.start(Box::new(move || {
            if let Some(core) = weak.upgrade() {
                core.report_failure_detected();
            }
        }));
        self.detector.enable();
        info!(
            "T {} P {}: consensus started as replica",
            self.tablet_id, self.local_uuid
        );
        Ok(())
    }

    fn start_replica_operation(
        &self,
        round: &Arc<ConsensusRound>,
    ) -> Result<()> {
        let factory = self
            .op_factory
            .lock()
            .as_ref()
            .and_then(|w| w.upgrade())
            .ok_or_else(|| {
                Error::from(ConsensusError::Replication(ReplicationError::CannotPrepare {
                    op_id: round.id(),
                    reason: "operation factory not attached".to_string(),
                }))
            })?;
        factory.start_replica_operation(round.clone())
    }

    // ------------------------------------------------------------------
    // Leader path
    // ------------------------------------------------------------------

    /// Lock-free leadership probe for the hot path; binds the round to the
    /// observed term so a stale round aborts instead of committing.
    pub fn check_leadership_and_bind_term(
        &self,
        round: &ConsensusRound,
    ) -> Result<()> {
        self.state.check_leadership_and_bind_term(round)
    }

    /// Assigns sequential OpIds to the batch, registers the rounds, appends
    /// to the local log, and signals the peer pumps. On any failure the
    /// whole batch is unwound in reverse order.
    pub fn replicate_batch(
        &self,
        rounds: &[Arc<ConsensusRound>],
    ) -> Result<()> {
        if rounds.is_empty() {
            return Ok(());
        }
        let msgs = {
            let mut rs = self.state.lock_for_replicate()?;
            let term = rs.current_term();
            let committed = rs.last_committed();
            let (next_index, last_received, last_received_cl) = rs.id_cursor();

            let mut stamped: Vec<(Arc<ConsensusRound>, Arc<ReplicateMsg>)> = Vec::new();
            let mut msgs: Vec<Arc<ReplicateMsg>> = Vec::with_capacity(rounds.len());
            let mut failure: Option<Error> = None;
            for round in rounds {
                if round.bound_term() != term {
                    failure = Some(
                        ConsensusError::Replication(ReplicationError::StaleRoundTerm {
                            bound_term: round.bound_term(),
                            current_term: term,
                        })
                        .into(),
                    );
                    break;
                }
                let id = rs.new_id();
                let prev = round.stamp(id, self.clock.now_ht(), committed);
                stamped.push((round.clone(), prev));
                if let Err(e) = rs.add_pending(round.clone()) {
                    failure = Some(e);
                    break;
                }
                msgs.push(round.msg());
            }

            if let Some(e) = failure {
                for (round, prev) in stamped.into_iter().rev() {
                    rs.remove_pending(round.id().index);
                    round.restore(prev);
                }
                rs.restore_id_cursor(next_index, last_received, last_received_cl);
                return Err(e);
            }
            msgs
        };

        OPS_REPLICATED.inc_by(msgs.len() as u64);
        let rounds_for_log: Vec<Arc<ConsensusRound>> = rounds.to_vec();
        self.queue.append_operations(
            msgs,
            Box::new(move |result| fan_out_log_result(&rounds_for_log, result)),
        )?;
        self.peer_manager.signal_request(TriggerMode::NonEmptyOnly);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Follower path
    // ------------------------------------------------------------------

    /// Follower ingest. One Update at a time per tablet; responds only after
    /// the accepted ops are durable in the local log.
    pub async fn update(
        &self,
        request: ConsensusRequest,
    ) -> Result<ConsensusResponse> {
        let _updating = self.update_mutex.lock().await;

        if request.dest_uuid != self.local_uuid {
            return Ok(self.error_response(
                ConsensusErrorCode::WrongServerUuid,
                format!(
                    "request for {} arrived at {}",
                    request.dest_uuid, self.local_uuid
                ),
            ));
        }
        if request.tablet_id != self.tablet_id {
            return Ok(self.error_response(
                ConsensusErrorCode::TabletNotFound,
                format!("unknown tablet {}", request.tablet_id),
            ));
        }

        let mut outcomes = Vec::new();
        let mut election_after: Option<ElectionReason> = None;
        let (status, durable_rx, was_leader_stepdown) = {
            let mut rs = self.state.lock_for_update()?;
            let mut was_leader = false;

            // Term check. A stale caller is rejected; a newer term forces
            // adoption (and step-down if we were leading).
            if request.caller_term < rs.current_term() {
                let status = self.status_of(&rs, Some(ConsensusErrorCode::InvalidTerm), None);
                return Ok(self.response_with(rs.current_term(), status));
            }
            if request.caller_term > rs.current_term() {
                was_leader = rs.role() == PeerRole::Leader;
                rs.set_current_term(request.caller_term)?;
                rs.become_replica(Some(request.caller_uuid.clone()));
            } else if rs.role() == PeerRole::Leader {
                // Same term, two leaders: impossible unless the caller is
                // confused. Reject.
                let status = self.status_of(&rs, Some(ConsensusErrorCode::InvalidTerm), None);
                return Ok(self.response_with(rs.current_term(), status));
            }

            rs.set_leader_uuid(&request.caller_uuid);
            rs.note_leader_contact();
            rs.update_old_leader_lease(
                request
                    .leader_lease_duration_ms
                    .map(|ms| Duration::from_millis(ms as u64)),
                request.ht_lease_expiration,
            );

            // Dedup: skip everything already committed or already pending
            // with the same id; the effective preceding id advances past
            // every skipped op.
            let committed_index = rs.committed_index();
            let mut effective_preceding = request.preceding_id;
            let mut new_ops: Vec<&ReplicateMsg> = Vec::new();
            for op in &request.ops {
                if !new_ops.is_empty() {
                    new_ops.push(op);
                    continue;
                }
                if op.id.index <= committed_index {
                    effective_preceding = op.id;
                    continue;
                }
                if let Some(existing) = rs.pending_round_at(op.id.index) {
                    if existing.id() == op.id {
                        effective_preceding = op.id;
                        continue;
                    }
                }
                new_ops.push(op);
            }

            // Log-matching: the adjusted preceding entry must be committed
            // or pending with a matching term.
            let preceding_match = if effective_preceding.is_min()
                || effective_preceding.index <= rs.committed_index()
            {
                PrecedingMatch::Ok
            } else {
                match rs.pending_round_at(effective_preceding.index) {
                    Some(round) if round.id() == effective_preceding => PrecedingMatch::Ok,
                    Some(_) => PrecedingMatch::TermMismatch,
                    None => PrecedingMatch::Missing,
                }
            };
            match preceding_match {
                PrecedingMatch::Ok => {}
                PrecedingMatch::TermMismatch => {
                    // Divergent suffix: drop it so the retreating leader can
                    // overwrite, then ask it to walk back.
                    outcomes.extend(rs.abort_ops_after(effective_preceding.index - 1)?);
                    let status = self.status_of(
                        &rs,
                        Some(ConsensusErrorCode::PrecedingEntryDidntMatch),
                        None,
                    );
                    let term = rs.current_term();
                    drop(rs);
                    self.process_outcomes(outcomes);
                    self.after_leader_stepdown(was_leader);
                    self.detector.snooze();
                    return Ok(self.response_with(term, status));
                }
                PrecedingMatch::Missing => {
                    let status = self.status_of(
                        &rs,
                        Some(ConsensusErrorCode::PrecedingEntryDidntMatch),
                        None,
                    );
                    let term = rs.current_term();
                    drop(rs);
                    self.after_leader_stepdown(was_leader);
                    self.detector.snooze();
                    return Ok(self.response_with(term, status));
                }
            }

            // A term boundary may overwrite our uncommitted suffix: if the
            // first new op collides with a pending round from another term,
            // the displaced rounds are aborted before the overwrite lands.
            if let Some(first) = new_ops.first() {
                if let Some(existing) = rs.pending_round_at(first.id.index) {
                    if existing.id() != first.id {
                        outcomes.extend(rs.abort_ops_after(first.id.index - 1)?);
                        self.wal.truncate_after(first.id.index - 1)?;
                    }
                }
            }

            // Early commit: everything at or below the preceding id that the
            // leader already calls committed can be released now, before the
            // incoming prepares take memory.
            let early = effective_preceding.index.min(request.committed_index);
            if early > rs.committed_index() {
                outcomes.extend(rs.advance_committed_index(early)?);
            }

            // Enqueue prepares; stop early on memory pressure and let the
            // leader resend the rest.
            let soft_limit = self.config.pipeline.pending_ops_soft_limit_bytes;
            let mut prepared: Vec<Arc<ReplicateMsg>> = Vec::new();
            let mut reject: Option<(ConsensusErrorCode, String)> = None;
            for op in new_ops {
                if rs.pending_bytes() + op.payload.len() > soft_limit {
                    reject = Some((
                        ConsensusErrorCode::CannotPrepare,
                        format!(
                            "pending ops at {} bytes, soft limit {}",
                            rs.pending_bytes(),
                            soft_limit
                        ),
                    ));
                    break;
                }
                let msg = Arc::new(op.clone());
                let round = ConsensusRound::new_bound(msg.clone(), rs.current_term());
                if !msg.is_consensus_only() {
                    if let Err(e) = self.start_replica_operation(&round) {
                        warn!(
                            "T {} P {}: prepare rejected at {}: {e}",
                            self.tablet_id, self.local_uuid, op.id
                        );
                        reject = Some((ConsensusErrorCode::CannotPrepare, format!("{e}")));
                        break;
                    }
                }
                if msg.op_type() == OperationType::ChangeConfigOp {
                    if let Some(config) = &msg.config {
                        rs.set_pending_config(config.clone())?;
                    }
                }
                rs.add_pending(round)?;
                prepared.push(msg);
            }

            // Enqueue the accepted prefix to the local log.
            let durable_rx = if prepared.is_empty() {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                let rounds: Vec<Arc<ConsensusRound>> = prepared
                    .iter()
                    .filter_map(|m| rs.pending_round_at(m.id.index))
                    .collect();
                self.queue.append_operations(
                    prepared.clone(),
                    Box::new(move |result| {
                        let ok = result.is_ok();
                        fan_out_log_result(&rounds, result);
                        let _ = tx.send(ok);
                    }),
                )?;
                Some(rx)
            };

            // Commit watermark: never past what we actually enqueued.
            let last_enqueued = prepared
                .last()
                .map(|m| m.id)
                .unwrap_or(effective_preceding);
            let commit_target = request.committed_index.min(last_enqueued.index);
            if commit_target > rs.committed_index() {
                outcomes.extend(rs.advance_committed_index(commit_target)?);
            }

            if rs.take_pending_election_if_committed().is_some() {
                election_after = Some(
                    self.pending_election_reason
                        .lock()
                        .take()
                        .unwrap_or(ElectionReason::Instigated {
                            originator_uuid: None,
                        }),
                );
            }

            let status = self.status_of(
                &rs,
                reject.as_ref().map(|(code, _)| *code),
                reject.map(|(_, msg)| msg),
            );
            (status, durable_rx, was_leader)
        };

        self.process_outcomes(outcomes);
        self.after_leader_stepdown(was_leader_stepdown);
        self.detector.snooze();
        self.queue
            .update_committed_index(status.last_committed_idx);

        // Wait out local durability, snoozing the failure detector so the
        // follower does not election-timeout on its own log I/O.
        if let Some(mut rx) = durable_rx {
            loop {
                tokio::select! {
                    result = &mut rx => {
                        match result {
                            Ok(true) => break,
                            Ok(false) | Err(_) => {
                                return Err(SystemError::Storage(StorageError::LogAppend(
                                    "local log append failed".to_string(),
                                ))
                                .into());
                            }
                        }
                    }
                    _ = sleep(self.config.consensus.heartbeat_interval()) => {
                        self.detector.snooze();
                    }
                }
            }
        }

        if let Some(reason) = election_after {
            if let Some(core) = self.weak_self.lock().upgrade() {
                let _ = core.start_election(reason);
            }
        }

        let (_, term) = self.state.role_and_term();
        Ok(self.response_with(term, status))
    }

    fn status_of(
        &self,
        rs: &super::ReplicaGuard<'_, T>,
        code: Option<ConsensusErrorCode>,
        message: Option<String>,
    ) -> ConsensusStatus {
        ConsensusStatus {
            last_received: rs.last_received(),
            last_received_current_leader: rs.last_received_current_leader(),
            last_committed_idx: rs.committed_index(),
            error: code.map(|code| ConsensusErrorDetail::new(code, message.unwrap_or_default())),
        }
    }

    fn response_with(
        &self,
        term: u64,
        status: ConsensusStatus,
    ) -> ConsensusResponse {
        ConsensusResponse {
            responder_uuid: self.local_uuid.clone(),
            responder_term: term,
            status: Some(status),
        }
    }

    fn error_response(
        &self,
        code: ConsensusErrorCode,
        message: String,
    ) -> ConsensusResponse {
        let (_, term) = self.state.role_and_term();
        ConsensusResponse {
            responder_uuid: self.local_uuid.clone(),
            responder_term: term,
            status: Some(ConsensusStatus {
                last_received: MINIMUM_OP_ID,
                last_received_current_leader: MINIMUM_OP_ID,
                last_committed_idx: 0,
                error: Some(ConsensusErrorDetail::new(code, message)),
            }),
        }
    }

    /// Cleanup owed after stepping down from leadership mid-update.
    fn after_leader_stepdown(
        &self,
        was_leader: bool,
    ) {
        if !was_leader {
            return;
        }
        let (_, term) = self.state.role_and_term();
        self.queue.set_non_leader_mode(term);
        self.detector.enable();
        if let Some(core) = self.weak_self.lock().upgrade() {
            tokio::spawn(async move {
                core.peer_manager.close_all().await;
            });
        }
    }

    // ------------------------------------------------------------------
    // Votes
    // ------------------------------------------------------------------

    /// Vote handling must not starve the append path: if an Update is in
    /// progress the candidate is told to come back.
    pub async fn request_vote(
        &self,
        request: VoteRequest,
    ) -> Result<VoteResponse> {
        let Ok(_updating) = self.update_mutex.try_lock() else {
            return Ok(self.vote_response(false, Some(ConsensusErrorCode::ConsensusBusy), None));
        };

        let mut rs = self.state.lock_for_update()?;
        let mut was_leader = false;

        if request.candidate_term < rs.current_term() {
            let response =
                self.vote_response_term(&rs, false, Some(ConsensusErrorCode::InvalidTerm));
            return Ok(response);
        }
        if request.candidate_term > rs.current_term() {
            was_leader = rs.role() == PeerRole::Leader;
            rs.set_current_term(request.candidate_term)?;
            rs.become_replica(None);
        }

        // A voter that has heard a live leader recently denies, unless the
        // candidate was instigated and asked to bypass.
        if !request.ignore_live_leader
            && rs.heard_from_leader_within(self.config.consensus.election_timeout())
        {
            let response =
                self.vote_response_term(&rs, false, Some(ConsensusErrorCode::LeaderIsAlive));
            drop(rs);
            self.after_leader_stepdown(was_leader);
            return Ok(response);
        }

        if let Some(voted_for) = rs.voted_for() {
            if voted_for != request.candidate_uuid {
                let response =
                    self.vote_response_term(&rs, false, Some(ConsensusErrorCode::AlreadyVoted));
                drop(rs);
                self.after_leader_stepdown(was_leader);
                return Ok(response);
            }
        }

        if request.candidate_last_received < rs.last_received() {
            let response =
                self.vote_response_term(&rs, false, Some(ConsensusErrorCode::LastOpIdTooOld));
            drop(rs);
            self.after_leader_stepdown(was_leader);
            return Ok(response);
        }

        rs.set_voted_for_current_term(&request.candidate_uuid)?;
        info!(
            "T {} P {}: granted vote to {} for term {}",
            self.tablet_id, self.local_uuid, request.candidate_uuid, request.candidate_term
        );
        let mut response = self.vote_response_term(&rs, true, None);
        response.remaining_leader_lease_duration_ms = rs
            .remaining_old_leader_lease()
            .map(|d| d.as_millis() as u32);
        let ht_lease = rs.old_leader_ht_lease_expiration();
        response.leader_ht_lease_expiration = (ht_lease > 0).then_some(ht_lease);
        drop(rs);
        self.after_leader_stepdown(was_leader);
        self.detector.snooze();
        Ok(response)
    }

    fn vote_response(
        &self,
        granted: bool,
        code: Option<ConsensusErrorCode>,
        term: Option<u64>,
    ) -> VoteResponse {
        let term = term.unwrap_or_else(|| self.state.role_and_term().1);
        VoteResponse {
            responder_uuid: self.local_uuid.clone(),
            responder_term: term,
            vote_granted: granted,
            error: code.map(|c| ConsensusErrorDetail::new(c, "")),
            remaining_leader_lease_duration_ms: None,
            leader_ht_lease_expiration: None,
        }
    }

    fn vote_response_term(
        &self,
        rs: &super::ReplicaGuard<'_, T>,
        granted: bool,
        code: Option<ConsensusErrorCode>,
    ) -> VoteResponse {
        self.vote_response(granted, code, Some(rs.current_term()))
    }

    // ------------------------------------------------------------------
    // Config changes
    // ------------------------------------------------------------------

    pub fn change_config(
        &self,
        request: ChangeConfigRequest,
    ) -> Result<QuorumConfig> {
        let change_type = ChangeConfigType::try_from(request.change_type)
            .unwrap_or(ChangeConfigType::UnknownChange);

        let (msg, new_config) = {
            let mut rs = self.state.lock_for_config_change()?;
            if !rs.leader_ready() {
                return Err(ConsensusError::Membership(MembershipError::LeaderNotReady).into());
            }
            if let Some(pending) = rs.pending_config() {
                return Err(ConsensusError::Membership(MembershipError::PendingConfigExists(
                    pending.opid_index,
                ))
                .into());
            }
            let committed = rs.committed_config().clone();
            if let Some(cas) = request.cas_config_opid_index {
                if cas != committed.opid_index {
                    return Err(ConsensusError::Membership(MembershipError::CasFailed {
                        expected: cas,
                        actual: committed.opid_index,
                    })
                    .into());
                }
            }

            let mut new_config = committed;
            apply_change(&mut new_config, change_type, &request, &self.local_uuid)?;

            let id = rs.new_id();
            new_config.opid_index = id.index;
            let msg = Arc::new(ReplicateMsg {
                op_type: OperationType::ChangeConfigOp as i32,
                id,
                hybrid_time: self.clock.now_ht(),
                committed_op_id: rs.last_committed(),
                payload: Bytes::new(),
                config: Some(new_config.clone()),
            });
            let round = ConsensusRound::new_bound(msg.clone(), rs.current_term());
            rs.add_pending(round)?;
            rs.set_pending_config(new_config.clone())?;
            info!(
                "T {} P {}: proposing config change {:?} at {}",
                self.tablet_id, self.local_uuid, change_type, id
            );
            (msg, new_config)
        };

        self.queue
            .append_operations(vec![msg], Box::new(|result| {
                if let Err(e) = result {
                    error!("config change log append failed: {e}");
                }
            }))?;
        self.peer_manager.signal_request(TriggerMode::AlwaysSend);
        Ok(new_config)
    }

    fn handle_config_decision(
        &self,
        round: &Arc<ConsensusRound>,
        committed: bool,
    ) {
        let Some(config) = round.msg().config.clone() else {
            return;
        };
        let result = {
            match self.state.lock_for_read() {
                Ok(mut rs) => {
                    if committed {
                        rs.set_committed_config(config.clone())
                    } else if rs.pending_config().map(|p| p.opid_index) == Some(config.opid_index)
                    {
                        rs.clear_pending_config()
                    } else {
                        Ok(())
                    }
                }
                Err(e) => Err(e),
            }
        };
        if let Err(e) = result {
            error!(
                "T {} P {}: installing config decision failed: {e}",
                self.tablet_id, self.local_uuid
            );
            return;
        }
        if committed {
            info!(
                "T {} P {}: config with opid_index {} committed",
                self.tablet_id, self.local_uuid, config.opid_index
            );
            // Leaders reconcile their peer set with the new membership.
            if self.state.role_and_term().0 == PeerRole::Leader {
                if let Some(core) = self.weak_self.lock().upgrade() {
                    tokio::spawn(async move {
                        if let Err(e) = core.peer_manager.update_quorum_config(&config).await {
                            warn!("peer reconciliation failed: {e}");
                        }
                    });
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Step-down and elections
    // ------------------------------------------------------------------

    pub async fn step_down(
        &self,
        request: StepDownRequest,
    ) -> Result<()> {
        {
            let rs = self.state.lock_for_read()?;
            if rs.role() != PeerRole::Leader {
                return Err(ConsensusError::Membership(MembershipError::NotTheLeader).into());
            }
        }

        if let Some(protege) = &request.new_leader_uuid {
            let cooling = self
                .protege_losses
                .lock()
                .get(protege)
                .map(|at| at.elapsed() < self.config.consensus.stepdown_retry_interval())
                .unwrap_or(false);
            if cooling {
                return Err(ConsensusError::Membership(
                    MembershipError::StepDownRetryCoolingDown(protege.clone()),
                )
                .into());
            }

            let caught_up = self
                .queue
                .peer_last_received(protege)
                .map(|id| id == self.queue.local_last_enqueued())
                .unwrap_or(false);
            if !caught_up {
                return Err(ConsensusError::Membership(MembershipError::ProtegeNotCaughtUp(
                    protege.clone(),
                ))
                .into());
            }

            let peer = {
                let rs = self.state.lock_for_read()?;
                rs.active_config().peer(protege).cloned()
            };
            let Some(peer) = peer else {
                return Err(ConsensusError::Membership(MembershipError::NotPresent(
                    protege.clone(),
                ))
                .into());
            };
            let proxy = self.proxy_factory.proxy_for(&peer)?;
            let run_request = RunLeaderElectionRequest {
                dest_uuid: protege.clone(),
                tablet_id: self.tablet_id.clone(),
                originator_uuid: Some(self.local_uuid.clone()),
            };
            tokio::spawn(async move {
                if let Err(e) = proxy.run_leader_election(run_request).await {
                    warn!("run_leader_election to protege failed: {e}");
                }
            });
            info!(
                "T {} P {}: stepping down in favor of {}",
                self.tablet_id, self.local_uuid, protege
            );
        }

        let term = {
            let mut rs = self.state.lock_for_update()?;
            rs.become_replica(None);
            rs.withhold_election_until(
                Instant::now() + self.config.consensus.withhold_election_interval(),
            );
            rs.current_term()
        };
        self.queue.set_non_leader_mode(term);
        self.detector.enable();
        self.peer_manager.close_all().await;
        Ok(())
    }

    /// Inbound RunLeaderElection: start now, or defer until our pending ops
    /// commit so we do not campaign with an incomplete log.
    pub fn handle_run_leader_election(
        self: &Arc<Self>,
        request: RunLeaderElectionRequest,
    ) -> Result<()> {
        let reason = ElectionReason::Instigated {
            originator_uuid: request.originator_uuid,
        };
        let deferred = {
            let mut rs = self.state.lock_for_update()?;
            if rs.last_received().index > rs.committed_index() {
                rs.set_pending_election_op_id(rs.last_received());
                true
            } else {
                false
            }
        };
        if deferred {
            *self.pending_election_reason.lock() = Some(reason);
            Ok(())
        } else {
            self.start_election(reason)
        }
    }

    pub fn handle_leader_election_lost(
        &self,
        request: LeaderElectionLostRequest,
    ) {
        self.protege_losses
            .lock()
            .insert(request.election_lost_by_uuid, Instant::now());
    }

    fn report_failure_detected(self: &Arc<Self>) {
        let _ = self.start_election(ElectionReason::LeaderFailureDetected);
    }

    pub fn start_election(
        self: &Arc<Self>,
        reason: ElectionReason,
    ) -> Result<()> {
        let core = self.clone();
        tokio::spawn(async move {
            core.do_election(reason).await;
        });
        Ok(())
    }

    async fn do_election(
        self: &Arc<Self>,
        reason: ElectionReason,
    ) {
        if self.election_in_flight.swap(true, Ordering::AcqRel) {
            return;
        }
        let result = self.do_election_inner(&reason).await;
        self.election_in_flight.store(false, Ordering::Release);
        if let Err(e) = result {
            debug!(
                "T {} P {}: election attempt ended: {e}",
                self.tablet_id, self.local_uuid
            );
        }
    }

    async fn do_election_inner(
        self: &Arc<Self>,
        reason: &ElectionReason,
    ) -> Result<()> {
        let (request, voters, num_voters, election_term) = {
            let mut rs = self.state.lock_for_update()?;
            if rs.role() == PeerRole::Leader {
                return Ok(());
            }
            if !reason.ignore_live_leader() {
                if let Some(remaining) = rs.election_withheld_for() {
                    self.detector.snooze_for(remaining);
                    return Err(
                        ConsensusError::Election(ElectionError::Withheld(remaining)).into()
                    );
                }
            }
            let config = rs.active_config().clone();
            if !config.is_voter(&self.local_uuid) {
                return Err(ConsensusError::Election(ElectionError::NoVotingMemberFound {
                    candidate_uuid: self.local_uuid.clone(),
                })
                .into());
            }

            let term = rs.current_term() + 1;
            rs.set_current_term(term)?;
            rs.set_voted_for_current_term(&self.local_uuid)?;
            rs.become_replica(None);

            let voters: Vec<RaftPeer> = config
                .peers
                .iter()
                .filter(|p| p.is_voter() && p.uuid != self.local_uuid)
                .cloned()
                .collect();
            let request = VoteRequest {
                candidate_uuid: self.local_uuid.clone(),
                candidate_term: term,
                tablet_id: self.tablet_id.clone(),
                dest_uuid: String::new(),
                candidate_last_received: rs.last_received(),
                ignore_live_leader: reason.ignore_live_leader(),
            };
            (request, voters, config.voter_count(), term)
        };

        ELECTIONS_STARTED.inc();
        info!(
            "T {} P {}: starting election for term {} ({} voters)",
            self.tablet_id, self.local_uuid, election_term, num_voters
        );

        let mut counter = VoteCounter::new(num_voters);
        counter.register_vote(&self.local_uuid, true);

        let mut ballots = FuturesUnordered::new();
        for peer in voters {
            let proxy = match self.proxy_factory.proxy_for(&peer) {
                Ok(proxy) => proxy,
                Err(e) => {
                    warn!("no proxy for voter {}: {e}", peer.uuid);
                    continue;
                }
            };
            let mut request = request.clone();
            request.dest_uuid = peer.uuid.clone();
            let rpc_timeout = self.config.consensus.rpc_timeout();
            let uuid = peer.uuid.clone();
            ballots.push(async move {
                let result = timeout(rpc_timeout, proxy.request_vote(request)).await;
                (uuid, result)
            });
        }

        let mut higher_term: Option<u64> = None;
        let mut old_lease: Option<Duration> = None;
        let mut old_ht_lease: Option<u64> = None;
        while counter.decision() == ElectionDecision::Undecided {
            let Some((uuid, result)) = ballots.next().await else {
                break;
            };
            match result {
                Ok(Ok(response)) => {
                    if response.responder_term > election_term {
                        higher_term = Some(
                            higher_term
                                .map(|t| t.max(response.responder_term))
                                .unwrap_or(response.responder_term),
                        );
                    }
                    counter.register_vote(&response.responder_uuid, response.vote_granted);
                    if response.vote_granted {
                        if let Some(ms) = response.remaining_leader_lease_duration_ms {
                            let granted = Duration::from_millis(ms as u64);
                            old_lease =
                                Some(old_lease.map(|d| d.max(granted)).unwrap_or(granted));
                        }
                        if let Some(ht) = response.leader_ht_lease_expiration {
                            old_ht_lease =
                                Some(old_ht_lease.map(|h| h.max(ht)).unwrap_or(ht));
                        }
                    }
                }
                Ok(Err(e)) => {
                    debug!("vote request to {uuid} failed: {e}");
                }
                Err(_) => {
                    debug!("vote request to {uuid} timed out");
                }
            }
        }

        if counter.decision() == ElectionDecision::Won {
            self.become_leader(election_term, old_lease, old_ht_lease)
                .await;
            return Ok(());
        }

        // Lost or exhausted without quorum.
        info!(
            "T {} P {}: lost election for term {} ({} of {} granted)",
            self.tablet_id,
            self.local_uuid,
            election_term,
            counter.votes_granted(),
            counter.majority_size()
        );
        if let Some(term) = higher_term {
            let mut rs = self.state.lock_for_update()?;
            if term > rs.current_term() {
                rs.set_current_term(term)?;
                rs.become_replica(None);
            }
        }
        self.detector.backoff_snooze();

        if let ElectionReason::Instigated {
            originator_uuid: Some(originator),
        } = reason
        {
            let peer = {
                let rs = self.state.lock_for_read()?;
                rs.active_config().peer(originator).cloned()
            };
            if let Some(peer) = peer {
                if let Ok(proxy) = self.proxy_factory.proxy_for(&peer) {
                    let request = LeaderElectionLostRequest {
                        dest_uuid: originator.clone(),
                        tablet_id: self.tablet_id.clone(),
                        election_lost_by_uuid: self.local_uuid.clone(),
                    };
                    tokio::spawn(async move {
                        let _ = proxy.leader_election_lost(request).await;
                    });
                }
            }
        }
        Err(ConsensusError::Election(ElectionError::QuorumFailure {
            required: counter.majority_size(),
            granted: counter.votes_granted(),
        })
        .into())
    }

    async fn become_leader(
        self: &Arc<Self>,
        term: u64,
        old_lease: Option<Duration>,
        old_ht_lease: Option<u64>,
    ) {
        let (active, last_enqueued, committed_index) = {
            let Ok(mut rs) = self.state.lock_for_update() else {
                return;
            };
            if rs.current_term() != term {
                // A higher term slipped in while the votes were in flight.
                return;
            }
            rs.update_old_leader_lease(old_lease, old_ht_lease);
            rs.become_leader();
            (
                rs.active_config().clone(),
                rs.last_received(),
                rs.committed_index(),
            )
        };

        ELECTIONS_WON.inc();
        self.detector.disable();
        self.queue
            .init_leader_mode(term, committed_index, last_enqueued);
        if let Err(e) = self.peer_manager.update_quorum_config(&active).await {
            warn!("initial peer setup failed: {e}");
        }

        // The leader is "ready to serve" once a NoOp of its own term
        // commits; replicate it through the normal machinery.
        let round = ConsensusRound::new(ReplicateMsg {
            op_type: OperationType::NoOp as i32,
            id: MINIMUM_OP_ID,
            hybrid_time: 0,
            committed_op_id: MINIMUM_OP_ID,
            payload: Bytes::new(),
            config: None,
        });
        if let Err(e) = self
            .check_leadership_and_bind_term(&round)
            .and_then(|_| self.replicate_batch(&[round]))
        {
            warn!(
                "T {} P {}: leader NoOp replication failed: {e}",
                self.tablet_id, self.local_uuid
            );
        }
        self.peer_manager.signal_request(TriggerMode::AlwaysSend);
    }

    // ------------------------------------------------------------------
    // Commit propagation
    // ------------------------------------------------------------------

    fn process_outcomes(
        &self,
        outcomes: Vec<RoundOutcome>,
    ) {
        for outcome in outcomes {
            let committed = outcome.result.is_ok();
            if outcome.round.op_type() == OperationType::ChangeConfigOp {
                self.handle_config_decision(&outcome.round, committed);
            }
            outcome.round.notify_replication_finished(outcome.result);
        }
    }

    /// Leader read-path gate.
    pub fn check_is_active_leader_and_has_lease(&self) -> Result<()> {
        let rs = self.state.lock_for_read()?;
        if rs.role() != PeerRole::Leader {
            return Err(ConsensusError::RoleViolation {
                current_role: rs.role().name(),
                required_role: PeerRole::Leader.name(),
                context: "leader read".to_string(),
            }
            .into());
        }
        match rs.lease_status(self.config.consensus.leader_lease_duration_ms > 0) {
            LeaseStatus::HasLease => Ok(()),
            LeaseStatus::NoLeaseYet => Err(SystemError::Network(NetworkError::ServiceUnavailable(
                "leader lease not yet acknowledged by a majority".to_string(),
            ))
            .into()),
            LeaseStatus::OldLeaderMayBeActive => {
                Err(SystemError::Network(NetworkError::ServiceUnavailable(
                    "waiting out the previous leader's lease".to_string(),
                ))
                .into())
            }
        }
    }

    /// Suspends until a majority-replicated lease is observed or `deadline`
    /// passes.
    pub async fn wait_for_leader_lease(
        &self,
        deadline: Instant,
    ) -> Result<()> {
        loop {
            match self.check_is_active_leader_and_has_lease() {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == StatusKind::ServiceUnavailable => {}
                Err(e) => return Err(e),
            }
            tokio::select! {
                _ = self.lease_changed.notified() => {}
                _ = sleep_until(deadline) => {
                    return Err(SystemError::WaitTimedOut(
                        self.config.consensus.rpc_timeout(),
                    )
                    .into());
                }
            }
        }
    }

    pub fn role(&self) -> PeerRole {
        self.state.role_and_term().0
    }

    pub fn current_term(&self) -> u64 {
        self.state.role_and_term().1
    }

    pub fn committed_index(&self) -> u64 {
        self.state
            .lock_for_read()
            .map(|rs| rs.committed_index())
            .unwrap_or(0)
    }

    pub fn committed_config(&self) -> Result<QuorumConfig> {
        Ok(self.state.lock_for_read()?.committed_config().clone())
    }

    pub async fn shutdown(&self) {
        info!(
            "T {} P {}: consensus shutting down",
            self.tablet_id, self.local_uuid
        );
        self.detector.stop();
        let outcomes = {
            let mut rs = self.state.lock_for_shutdown();
            rs.cancel_pending_operations()
        };
        self.process_outcomes(outcomes);
        self.peer_manager.close_all().await;
        let mut rs = self.state.lock_for_shutdown();
        rs.mark_shutdown_complete();
    }
}

impl<T: TypeConfig> ConsensusObserver for ConsensusCore<T> {
    fn on_majority_replicated(
        &self,
        info: MajorityReplicated,
    ) {
        let (outcomes, committed_index) = {
            let Ok(mut rs) = self.state.lock_for_read() else {
                return;
            };
            if rs.role() != PeerRole::Leader {
                return;
            }
            rs.set_majority_lease(info.lease_deadline, info.ht_lease_expiration.unwrap_or(0));

            // Only ops of the current term may be committed by counting
            // replicas; earlier-term entries ride along once the leader's
            // own NoOp commits.
            let outcomes = if info.op_id.term == rs.current_term()
                && info.op_id.index > rs.committed_index()
            {
                match rs.advance_committed_index(info.op_id.index) {
                    Ok(outcomes) => outcomes,
                    Err(e) => {
                        error!("advancing committed index failed: {e}");
                        Vec::new()
                    }
                }
            } else {
                Vec::new()
            };
            (outcomes, rs.committed_index())
        };

        self.queue.update_committed_index(committed_index);
        self.process_outcomes(outcomes);
        self.lease_changed.notify_waiters();
    }

    fn on_follower_failed(
        &self,
        uuid: &str,
        reason: &str,
    ) {
        warn!(
            "T {} P {}: follower {} reported failed: {}",
            self.tablet_id, self.local_uuid, uuid, reason
        );
        if !self.config.consensus.evict_failed_followers {
            return;
        }
        let Some(core) = self.weak_self.lock().upgrade() else {
            return;
        };
        let uuid = uuid.to_string();
        tokio::spawn(async move {
            let request = ChangeConfigRequest {
                tablet_id: core.tablet_id.clone(),
                dest_uuid: core.local_uuid.clone(),
                change_type: ChangeConfigType::RemoveServer as i32,
                server: Some(RaftPeer {
                    uuid: uuid.clone(),
                    address: String::new(),
                    member_type: MemberType::UnknownMember as i32,
                }),
                cas_config_opid_index: None,
            };
            match core.change_config(request) {
                Ok(_) => {
                    FOLLOWER_EVICTIONS.inc();
                    info!("evicting failed follower {uuid}");
                }
                Err(e) => debug!("failed-follower eviction skipped: {e}"),
            }
        });
    }

    fn on_observed_higher_term(
        &self,
        term: u64,
    ) {
        let was_leader = {
            let Ok(mut rs) = self.state.lock_for_update() else {
                return;
            };
            if term <= rs.current_term() {
                return;
            }
            let was_leader = rs.role() == PeerRole::Leader;
            if let Err(e) = rs.set_current_term(term) {
                error!("adopting higher term {term} failed: {e}");
                return;
            }
            rs.become_replica(None);
            was_leader
        };
        info!(
            "T {} P {}: stepping down, observed higher term {}",
            self.tablet_id, self.local_uuid, term
        );
        self.after_leader_stepdown(was_leader);
    }

    fn on_promotion_ready(
        &self,
        uuid: &str,
    ) {
        let Some(core) = self.weak_self.lock().upgrade() else {
            return;
        };
        let uuid = uuid.to_string();
        tokio::spawn(async move {
            let request = ChangeConfigRequest {
                tablet_id: core.tablet_id.clone(),
                dest_uuid: core.local_uuid.clone(),
                change_type: ChangeConfigType::ChangeRole as i32,
                server: Some(RaftPeer {
                    uuid: uuid.clone(),
                    address: String::new(),
                    member_type: MemberType::UnknownMember as i32,
                }),
                cas_config_opid_index: None,
            };
            if let Err(e) = core.change_config(request) {
                debug!("promotion of {uuid} not applied yet: {e}");
            }
        });
    }
}

enum PrecedingMatch {
    Ok,
    TermMismatch,
    Missing,
}

/// Maps crate errors onto the wire-level consensus error codes for the
/// embedding RPC service.
pub fn error_code_for(error: &Error) -> ConsensusErrorCode {
    match error {
        Error::Consensus(ConsensusError::Membership(e)) => match e {
            MembershipError::NotTheLeader => ConsensusErrorCode::NotTheLeader,
            MembershipError::LeaderNotReady => ConsensusErrorCode::LeaderNotReadyChangeConfig,
            MembershipError::PendingConfigExists(_) | MembershipError::PeerInTransit(_) => {
                ConsensusErrorCode::LeaderNotReadyChangeConfig
            }
            MembershipError::CasFailed { .. } => ConsensusErrorCode::CasFailed,
            MembershipError::AlreadyPresent(_) => ConsensusErrorCode::AddChangeConfigAlreadyPresent,
            MembershipError::NotPresent(_) => ConsensusErrorCode::RemoveChangeConfigNotPresent,
            MembershipError::SelfRemoval => ConsensusErrorCode::LeaderNeedsStepDown,
            MembershipError::InvalidChange(_) => ConsensusErrorCode::InvalidConfig,
            MembershipError::ProtegeNotCaughtUp(_)
            | MembershipError::StepDownRetryCoolingDown(_) => {
                ConsensusErrorCode::LeaderNotReadyToStepDown
            }
        },
        Error::Consensus(ConsensusError::Busy) => ConsensusErrorCode::ConsensusBusy,
        Error::Consensus(ConsensusError::Election(ElectionError::LeaderIsAlive)) => {
            ConsensusErrorCode::LeaderIsAlive
        }
        Error::Consensus(ConsensusError::Election(ElectionError::LogTooOld { .. })) => {
            ConsensusErrorCode::LastOpIdTooOld
        }
        Error::InvalidConfig(_) => ConsensusErrorCode::InvalidConfig,
        _ => ConsensusErrorCode::UnknownError,
    }
}

fn apply_change(
    config: &mut QuorumConfig,
    change_type: ChangeConfigType,
    request: &ChangeConfigRequest,
    local_uuid: &str,
) -> Result<()> {
    let server = request.server.as_ref().ok_or_else(|| {
        Error::from(ConsensusError::Membership(MembershipError::InvalidChange(
            "change request names no server".to_string(),
        )))
    })?;

    match change_type {
        ChangeConfigType::AddServer => {
            if config.has_peer_in_transit() {
                return Err(ConsensusError::Membership(MembershipError::PeerInTransit(
                    "another membership change is in transit".to_string(),
                ))
                .into());
            }
            if config.has_peer(&server.uuid) {
                return Err(ConsensusError::Membership(MembershipError::AlreadyPresent(
                    server.uuid.clone(),
                ))
                .into());
            }
            if !matches!(
                server.member_type(),
                MemberType::PreVoter | MemberType::PreObserver
            ) {
                return Err(ConsensusError::Membership(MembershipError::InvalidChange(
                    "new servers join as PreVoter or PreObserver".to_string(),
                ))
                .into());
            }
            config.peers.push(server.clone());
        }
        ChangeConfigType::RemoveServer => {
            if server.uuid == local_uuid {
                return Err(ConsensusError::Membership(MembershipError::SelfRemoval).into());
            }
            if !config.has_peer(&server.uuid) {
                return Err(ConsensusError::Membership(MembershipError::NotPresent(
                    server.uuid.clone(),
                ))
                .into());
            }
            config.peers.retain(|p| p.uuid != server.uuid);
        }
        ChangeConfigType::ChangeRole => {
            let peer = config
                .peers
                .iter_mut()
                .find(|p| p.uuid == server.uuid)
                .ok_or_else(|| {
                    Error::from(ConsensusError::Membership(MembershipError::NotPresent(
                        server.uuid.clone(),
                    )))
                })?;
            peer.member_type = match peer.member_type() {
                MemberType::PreVoter => MemberType::Voter as i32,
                MemberType::PreObserver => MemberType::Observer as i32,
                other => {
                    return Err(ConsensusError::Membership(MembershipError::InvalidChange(
                        format!("cannot change role of a {other:?} member"),
                    ))
                    .into());
                }
            };
        }
        ChangeConfigType::UnknownChange => {
            return Err(ConsensusError::Membership(MembershipError::InvalidChange(
                "unknown change type".to_string(),
            ))
            .into());
        }
    }
    Ok(())
}

/// Fans one log-append result out to every round in the batch. Append
/// failure is fatal to data integrity; each round still hears about it so
/// drivers can release cleanly before the process dies.
fn fan_out_log_result(
    rounds: &[Arc<ConsensusRound>],
    result: Result<()>,
) {
    match result {
        Ok(()) => {
            for round in rounds {
                round.notify_log_durable(Ok(()));
            }
        }
        Err(e) => {
            error!("log append failed, this is fatal: {e}");
            for round in rounds {
                round.notify_log_durable(Err(SystemError::Storage(StorageError::LogAppend(
                    format!("{e}"),
                ))
                .into()));
            }
        }
    }
}
