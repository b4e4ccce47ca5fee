//! Thread-safe custodian of all mutable consensus state for one tablet.
//!
//! A single mutex protects the inner state; callers go through the
//! `lock_for_*` methods, which assert that the replica's role and lifecycle
//! match the intended action before handing out the guard. The hot path
//! reads role and term lock-free through a packed atomic word.
//!
//! Replication decisions (commit/abort) are computed under the lock but
//! returned as [`RoundOutcome`]s and fired by the caller after release, so
//! callbacks are free to re-enter consensus.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use parking_lot::MutexGuard;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::derive_role;
use super::ConsensusRound;
use super::PeerRole;
use super::RoundOutcome;
use crate::alias::MSOF;
use crate::errors;
use crate::errors::ConsensusError;
use crate::errors::ReplicationError;
use crate::errors::StateTransitionError;
use crate::proto::ConsensusMetaDoc;
use crate::proto::OpId;
use crate::proto::QuorumConfig;
use crate::MetaStore;
use crate::Result;
use crate::TypeConfig;
use crate::MINIMUM_OP_ID;

/// Replica lifecycle. Orthogonal to the Raft role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Initialized,
    Running,
    ShuttingDown,
    Shutdown,
}

impl LifecycleState {
    fn name(&self) -> &'static str {
        match self {
            LifecycleState::Initialized => "Initialized",
            LifecycleState::Running => "Running",
            LifecycleState::ShuttingDown => "ShuttingDown",
            LifecycleState::Shutdown => "Shutdown",
        }
    }
}

/// Leader-lease verdict for the read path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    /// Majority-acknowledged lease is live and any old leader's lease ran out.
    HasLease,
    /// No majority acknowledgement yet (or it expired).
    NoLeaseYet,
    /// A previous leader may still be serving; wait out its lease.
    OldLeaderMayBeActive,
}

pub struct ReplicaState<T: TypeConfig> {
    tablet_id: String,
    peer_uuid: String,
    meta_store: Arc<MSOF<T>>,
    /// (term << 8) | role, for lock-free leadership probes.
    role_and_term: AtomicU64,
    inner: Mutex<ReplicaInner>,
}

struct ReplicaInner {
    lifecycle: LifecycleState,
    role: PeerRole,
    current_term: u64,
    voted_for: Option<String>,
    leader_uuid: Option<String>,

    committed_config: QuorumConfig,
    pending_config: Option<QuorumConfig>,

    /// Next index this leader will assign. Meaningful only while leading.
    next_index: u64,
    last_received: OpId,
    last_received_current_leader: OpId,
    last_committed: OpId,

    pending: BTreeMap<u64, Arc<ConsensusRound>>,
    pending_bytes: usize,

    majority_lease_deadline: Option<Instant>,
    majority_ht_lease_expiration: u64,
    old_leader_lease_deadline: Option<Instant>,
    old_leader_ht_lease_expiration: u64,

    last_leader_contact: Option<Instant>,
    withhold_election_until: Option<Instant>,
    pending_election_op_id: Option<OpId>,
}

/// Mutex guard plus a back-reference for metadata persistence.
pub struct ReplicaGuard<'a, T: TypeConfig> {
    state: &'a ReplicaState<T>,
    inner: MutexGuard<'a, ReplicaInner>,
}

impl<T: TypeConfig> ReplicaState<T> {
    pub fn new(
        tablet_id: String,
        peer_uuid: String,
        meta_store: Arc<MSOF<T>>,
        meta: ConsensusMetaDoc,
    ) -> Self {
        let role = derive_role(&peer_uuid, false, active_of(&meta));
        Self {
            tablet_id,
            peer_uuid,
            meta_store,
            role_and_term: AtomicU64::new(pack(role, meta.current_term)),
            inner: Mutex::new(ReplicaInner {
                lifecycle: LifecycleState::Initialized,
                role,
                current_term: meta.current_term,
                voted_for: meta.voted_for.clone(),
                leader_uuid: None,
                committed_config: meta.committed_config.clone(),
                pending_config: meta.pending_config.clone(),
                next_index: 1,
                last_received: MINIMUM_OP_ID,
                last_received_current_leader: MINIMUM_OP_ID,
                last_committed: MINIMUM_OP_ID,
                pending: BTreeMap::new(),
                pending_bytes: 0,
                majority_lease_deadline: None,
                majority_ht_lease_expiration: 0,
                old_leader_lease_deadline: None,
                old_leader_ht_lease_expiration: 0,
                last_leader_contact: None,
                withhold_election_until: None,
                pending_election_op_id: None,
            }),
        }
    }

    pub fn tablet_id(&self) -> &str {
        &self.tablet_id
    }

    pub fn peer_uuid(&self) -> &str {
        &self.peer_uuid
    }

    /// Transitions Initialized → Running and primes the log watermarks.
    pub fn start(
        &self,
        last_in_wal: OpId,
    ) -> Result<()> {
        let mut guard = self.inner.lock();
        if guard.lifecycle != LifecycleState::Initialized {
            return Err(illegal_state("Initialized", guard.lifecycle));
        }
        guard.lifecycle = LifecycleState::Running;
        guard.last_received = last_in_wal;
        guard.next_index = last_in_wal.index + 1;
        info!(
            "T {} P {}: replica state started, last_in_wal={}, term={}",
            self.tablet_id, self.peer_uuid, last_in_wal, guard.current_term
        );
        Ok(())
    }

    /// Lock-free role+term snapshot for hot paths.
    pub fn role_and_term(&self) -> (PeerRole, u64) {
        unpack(self.role_and_term.load(Ordering::Acquire))
    }

    /// Leader check without the mutex; binds the round to the observed term
    /// so a later leadership change aborts rather than misapplies it.
    pub fn check_leadership_and_bind_term(
        &self,
        round: &ConsensusRound,
    ) -> Result<()> {
        let (role, term) = self.role_and_term();
        if role != PeerRole::Leader {
            return Err(ConsensusError::RoleViolation {
                current_role: role.name(),
                required_role: PeerRole::Leader.name(),
                context: "replicate".to_string(),
            }
            .into());
        }
        round.bind_term(term)
    }

    pub fn lock_for_read(&self) -> Result<ReplicaGuard<'_, T>> {
        let inner = self.inner.lock();
        if inner.lifecycle == LifecycleState::Shutdown {
            return Err(ConsensusError::Shutdown.into());
        }
        Ok(ReplicaGuard { state: self, inner })
    }

    /// Leader-only entry for assigning new OpIds.
    pub fn lock_for_replicate(&self) -> Result<ReplicaGuard<'_, T>> {
        let inner = self.inner.lock();
        if inner.lifecycle != LifecycleState::Running {
            return Err(illegal_state("Running", inner.lifecycle));
        }
        if inner.role != PeerRole::Leader {
            return Err(ConsensusError::RoleViolation {
                current_role: inner.role.name(),
                required_role: PeerRole::Leader.name(),
                context: "replicate".to_string(),
            }
            .into());
        }
        Ok(ReplicaGuard { state: self, inner })
    }

    /// Follower/learner entry for ingesting appends and votes.
    pub fn lock_for_update(&self) -> Result<ReplicaGuard<'_, T>> {
        let inner = self.inner.lock();
        if inner.lifecycle != LifecycleState::Running {
            return Err(illegal_state("Running", inner.lifecycle));
        }
        Ok(ReplicaGuard { state: self, inner })
    }

    pub fn lock_for_config_change(&self) -> Result<ReplicaGuard<'_, T>> {
        let guard = self.lock_for_replicate()?;
        Ok(guard)
    }

    /// Flips to ShuttingDown; returns the guard for cancellation work.
    pub fn lock_for_shutdown(&self) -> ReplicaGuard<'_, T> {
        let mut inner = self.inner.lock();
        if matches!(
            inner.lifecycle,
            LifecycleState::Running | LifecycleState::Initialized
        ) {
            inner.lifecycle = LifecycleState::ShuttingDown;
        }
        ReplicaGuard { state: self, inner }
    }

    fn publish(
        &self,
        role: PeerRole,
        term: u64,
    ) {
        self.role_and_term.store(pack(role, term), Ordering::Release);
    }
}

impl<T: TypeConfig> ReplicaGuard<'_, T> {
    // ---- snapshots ----

    pub fn current_term(&self) -> u64 {
        self.inner.current_term
    }

    pub fn role(&self) -> PeerRole {
        self.inner.role
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.inner.lifecycle
    }

    pub fn leader_uuid(&self) -> Option<&str> {
        self.inner.leader_uuid.as_deref()
    }

    pub fn voted_for(&self) -> Option<&str> {
        self.inner.voted_for.as_deref()
    }

    pub fn last_received(&self) -> OpId {
        self.inner.last_received
    }

    pub fn last_received_current_leader(&self) -> OpId {
        self.inner.last_received_current_leader
    }

    pub fn last_committed(&self) -> OpId {
        self.inner.last_committed
    }

    pub fn committed_index(&self) -> u64 {
        self.inner.last_committed.index
    }

    pub fn committed_config(&self) -> &QuorumConfig {
        &self.inner.committed_config
    }

    pub fn pending_config(&self) -> Option<&QuorumConfig> {
        self.inner.pending_config.as_ref()
    }

    /// The pending config if one is proposed, else the committed one.
    pub fn active_config(&self) -> &QuorumConfig {
        self.inner
            .pending_config
            .as_ref()
            .unwrap_or(&self.inner.committed_config)
    }

    pub fn pending_rounds(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn pending_bytes(&self) -> usize {
        self.inner.pending_bytes
    }

    pub fn pending_round_at(
        &self,
        index: u64,
    ) -> Option<Arc<ConsensusRound>> {
        self.inner.pending.get(&index).cloned()
    }

    /// A leader is ready to serve once an op of its own term has committed.
    pub fn leader_ready(&self) -> bool {
        self.inner.role == PeerRole::Leader
            && self.inner.last_committed.term == self.inner.current_term
    }

    // ---- OpId assignment ----

    pub fn new_id(&mut self) -> OpId {
        let id = OpId::new(self.inner.current_term, self.inner.next_index);
        self.inner.next_index += 1;
        id
    }

    /// Batch-unwind support: restores the id cursor and watermarks captured
    /// before assignment started.
    pub fn restore_id_cursor(
        &mut self,
        next_index: u64,
        last_received: OpId,
        last_received_current_leader: OpId,
    ) {
        self.inner.next_index = next_index;
        self.inner.last_received = last_received;
        self.inner.last_received_current_leader = last_received_current_leader;
    }

    pub fn id_cursor(&self) -> (u64, OpId, OpId) {
        (
            self.inner.next_index,
            self.inner.last_received,
            self.inner.last_received_current_leader,
        )
    }

    // ---- pending operations ----

    /// Bootstrap-only: installs the recovered committed watermark without
    /// firing callbacks.
    pub fn prime_committed(
        &mut self,
        committed: OpId,
    ) {
        self.inner.last_committed = committed;
    }

    pub fn remove_pending(
        &mut self,
        index: u64,
    ) -> Option<Arc<ConsensusRound>> {
        let round = self.inner.pending.remove(&index)?;
        self.inner.pending_bytes -= round.payload_size().min(self.inner.pending_bytes);
        Some(round)
    }

    /// Registers an in-flight round. The map stays gapless and term-ordered.
    pub fn add_pending(
        &mut self,
        round: Arc<ConsensusRound>,
    ) -> Result<()> {
        let id = round.id();
        if id.index <= self.inner.last_committed.index {
            return Err(ConsensusError::Replication(ReplicationError::OpAlreadyPresent(
                id.index,
            ))
            .into());
        }
        if let Some(existing) = self.inner.pending.get(&id.index) {
            if Arc::ptr_eq(existing, &round) {
                return Ok(());
            }
            return Err(ConsensusError::Replication(ReplicationError::OpAlreadyPresent(
                id.index,
            ))
            .into());
        }
        if let Some((_, prev)) = self.inner.pending.range(..id.index).next_back() {
            if prev.id().term > id.term {
                return Err(ConsensusError::Replication(
                    ReplicationError::StaleRoundTerm {
                        bound_term: id.term,
                        current_term: prev.id().term,
                    },
                )
                .into());
            }
        }

        self.inner.pending_bytes += round.payload_size();
        self.inner.pending.insert(id.index, round);
        if id > self.inner.last_received {
            self.inner.last_received = id;
        }
        if id.term == self.inner.current_term && id > self.inner.last_received_current_leader {
            self.inner.last_received_current_leader = id;
        }
        Ok(())
    }

    /// Moves the committed index forward to min(`target`, last received),
    /// returning the decided rounds for the caller to fire after unlock.
    pub fn advance_committed_index(
        &mut self,
        target: u64,
    ) -> Result<Vec<RoundOutcome>> {
        let committed = self.inner.last_committed.index;
        if target < committed {
            return Err(ConsensusError::Replication(
                ReplicationError::CommittedIndexRegression {
                    from: committed,
                    to: target,
                },
            )
            .into());
        }

        let cap = target.min(self.inner.last_received.index);
        let mut outcomes = Vec::new();
        for index in committed + 1..=cap {
            let Some(round) = self.inner.pending.remove(&index) else {
                // A gap means the op was never enqueued here (e.g. dropped
                // under memory pressure); the leader will resend it.
                break;
            };
            self.inner.pending_bytes -= round.payload_size().min(self.inner.pending_bytes);
            let id = round.id();
            self.inner.last_committed = id;
            if round.bound_term() != id.term {
                warn!(
                    "T {} P {}: round {} was bound to term {} but committed in term {}; aborting",
                    self.state.tablet_id,
                    self.state.peer_uuid,
                    id,
                    round.bound_term(),
                    id.term
                );
                let bound_term = round.bound_term();
                outcomes.push(RoundOutcome::aborted(
                    round,
                    ConsensusError::Replication(ReplicationError::StaleRoundTerm {
                        bound_term,
                        current_term: id.term,
                    })
                    .into(),
                ));
            } else {
                outcomes.push(RoundOutcome::committed(round));
            }
        }
        if !outcomes.is_empty() {
            debug!(
                "T {} P {}: committed index advanced to {}",
                self.state.tablet_id, self.state.peer_uuid, self.inner.last_committed
            );
        }
        Ok(outcomes)
    }

    /// Aborts every pending round with index strictly greater than `index`,
    /// retreating the received watermark; used when a new leader overwrites
    /// a divergent suffix.
    pub fn abort_ops_after(
        &mut self,
        index: u64,
    ) -> Result<Vec<RoundOutcome>> {
        if index < self.inner.last_committed.index {
            return Err(ConsensusError::Replication(
                ReplicationError::CommittedIndexRegression {
                    from: self.inner.last_committed.index,
                    to: index,
                },
            )
            .into());
        }

        let removed = self.inner.pending.split_off(&(index + 1));
        let mut outcomes = Vec::with_capacity(removed.len());
        for (_, round) in removed {
            self.inner.pending_bytes -= round.payload_size().min(self.inner.pending_bytes);
            let id = round.id();
            outcomes.push(RoundOutcome::aborted(
                round,
                errors::aborted(id, "op truncated by new leader"),
            ));
        }

        if !outcomes.is_empty() {
            let new_last = if index == self.inner.last_committed.index {
                self.inner.last_committed
            } else {
                self.inner
                    .pending
                    .get(&index)
                    .map(|r| r.id())
                    .unwrap_or(self.inner.last_committed)
            };
            warn!(
                "T {} P {}: aborted {} pending ops after index {}, last_received now {}",
                self.state.tablet_id,
                self.state.peer_uuid,
                outcomes.len(),
                index,
                new_last
            );
            self.inner.last_received = new_last;
            if self.inner.last_received_current_leader > new_last {
                self.inner.last_received_current_leader = new_last;
            }
        }
        Ok(outcomes)
    }

    /// Shutdown path: aborts everything still pending, exactly once each.
    pub fn cancel_pending_operations(&mut self) -> Vec<RoundOutcome> {
        let pending = std::mem::take(&mut self.inner.pending);
        self.inner.pending_bytes = 0;
        pending
            .into_values()
            .map(|round| {
                let id = round.id();
                RoundOutcome::aborted(round, errors::aborted(id, "replica shutting down"))
            })
            .collect()
    }

    pub fn mark_shutdown_complete(&mut self) {
        self.inner.lifecycle = LifecycleState::Shutdown;
    }

    // ---- term / vote / role ----

    /// Adopts a strictly higher term; clears the vote and persists before
    /// returning.
    pub fn set_current_term(
        &mut self,
        new_term: u64,
    ) -> Result<()> {
        if new_term <= self.inner.current_term {
            return Err(ConsensusError::StateTransition(
                StateTransitionError::TermRegression {
                    current: self.inner.current_term,
                    proposed: new_term,
                },
            )
            .into());
        }
        self.inner.current_term = new_term;
        self.inner.voted_for = None;
        self.persist_meta()?;
        self.state.publish(self.inner.role, new_term);
        Ok(())
    }

    pub fn set_voted_for_current_term(
        &mut self,
        uuid: &str,
    ) -> Result<()> {
        match self.inner.voted_for.as_deref() {
            Some(existing) if existing != uuid => {
                return Err(ConsensusError::StateTransition(
                    StateTransitionError::AlreadyVotedThisTerm {
                        term: self.inner.current_term,
                        voted_for: existing.to_string(),
                    },
                )
                .into());
            }
            Some(_) => return Ok(()),
            None => {}
        }
        self.inner.voted_for = Some(uuid.to_string());
        self.persist_meta()
    }

    pub fn become_leader(&mut self) {
        let uuid = self.state.peer_uuid.clone();
        self.inner.leader_uuid = Some(uuid);
        self.inner.role = PeerRole::Leader;
        self.inner.next_index = self.inner.last_received.index + 1;
        self.inner.majority_lease_deadline = None;
        self.inner.majority_ht_lease_expiration = 0;
        self.state.publish(PeerRole::Leader, self.inner.current_term);
        info!(
            "T {} P {}: became leader for term {}",
            self.state.tablet_id, self.state.peer_uuid, self.inner.current_term
        );
    }

    pub fn become_replica(
        &mut self,
        leader_uuid: Option<String>,
    ) {
        self.inner.leader_uuid = leader_uuid;
        self.recompute_role();
    }

    fn recompute_role(&mut self) {
        let is_leader = self.inner.leader_uuid.as_deref() == Some(&self.state.peer_uuid);
        let role = {
            let config = self
                .inner
                .pending_config
                .as_ref()
                .unwrap_or(&self.inner.committed_config);
            derive_role(&self.state.peer_uuid, is_leader, config)
        };
        self.inner.role = role;
        self.state.publish(role, self.inner.current_term);
    }

    pub fn set_leader_uuid(
        &mut self,
        uuid: &str,
    ) {
        if self.inner.leader_uuid.as_deref() != Some(uuid) {
            self.inner.leader_uuid = Some(uuid.to_string());
            self.recompute_role();
        }
    }

    // ---- configs ----

    /// Installs a proposed (not yet majority-acknowledged) config.
    pub fn set_pending_config(
        &mut self,
        config: QuorumConfig,
    ) -> Result<()> {
        if let Some(pending) = &self.inner.pending_config {
            return Err(ConsensusError::Membership(
                crate::errors::MembershipError::PendingConfigExists(pending.opid_index),
            )
            .into());
        }
        config
            .validate()
            .map_err(|e| crate::Error::InvalidConfig(e))?;
        self.inner.pending_config = Some(config);
        self.persist_meta()?;
        self.recompute_role();
        Ok(())
    }

    pub fn clear_pending_config(&mut self) -> Result<()> {
        self.inner.pending_config = None;
        self.persist_meta()?;
        self.recompute_role();
        Ok(())
    }

    /// Promotes the pending config to committed. The committed config must
    /// be the one that was pending (matched by opid_index).
    pub fn set_committed_config(
        &mut self,
        config: QuorumConfig,
    ) -> Result<()> {
        if let Some(pending) = &self.inner.pending_config {
            if pending.opid_index != config.opid_index {
                return Err(illegal_state_msg(format!(
                    "committed config opid_index {} does not match pending {}",
                    config.opid_index, pending.opid_index
                )));
            }
        }
        if config.opid_index < self.inner.committed_config.opid_index {
            return Err(illegal_state_msg(format!(
                "committed config opid_index regressed: {} < {}",
                config.opid_index, self.inner.committed_config.opid_index
            )));
        }
        self.inner.committed_config = config;
        self.inner.pending_config = None;
        self.persist_meta()?;
        self.recompute_role();
        Ok(())
    }

    // ---- leases ----

    pub fn set_majority_lease(
        &mut self,
        deadline: Option<Instant>,
        ht_expiration: u64,
    ) {
        if let Some(deadline) = deadline {
            let current = self.inner.majority_lease_deadline;
            if current.map(|c| deadline > c).unwrap_or(true) {
                self.inner.majority_lease_deadline = Some(deadline);
            }
        }
        if ht_expiration > self.inner.majority_ht_lease_expiration {
            self.inner.majority_ht_lease_expiration = ht_expiration;
        }
    }

    /// Remembers how long a (possibly still live) previous leader must be
    /// waited out before this node may act as leader.
    pub fn update_old_leader_lease(
        &mut self,
        remaining: Option<Duration>,
        ht_expiration: Option<u64>,
    ) {
        if let Some(remaining) = remaining {
            let deadline = Instant::now() + remaining;
            if self
                .inner
                .old_leader_lease_deadline
                .map(|c| deadline > c)
                .unwrap_or(true)
            {
                self.inner.old_leader_lease_deadline = Some(deadline);
            }
        }
        if let Some(ht) = ht_expiration {
            if ht > self.inner.old_leader_ht_lease_expiration {
                self.inner.old_leader_ht_lease_expiration = ht;
            }
        }
    }

    pub fn remaining_old_leader_lease(&self) -> Option<Duration> {
        let deadline = self.inner.old_leader_lease_deadline?;
        let now = Instant::now();
        (deadline > now).then(|| deadline - now)
    }

    pub fn old_leader_ht_lease_expiration(&self) -> u64 {
        self.inner.old_leader_ht_lease_expiration
    }

    pub fn majority_ht_lease_expiration(&self) -> u64 {
        self.inner.majority_ht_lease_expiration
    }

    pub fn lease_status(
        &self,
        leases_enabled: bool,
    ) -> LeaseStatus {
        if !leases_enabled {
            return LeaseStatus::HasLease;
        }
        let now = Instant::now();
        if let Some(old) = self.inner.old_leader_lease_deadline {
            if old > now {
                return LeaseStatus::OldLeaderMayBeActive;
            }
        }
        match self.inner.majority_lease_deadline {
            Some(deadline) if deadline > now => LeaseStatus::HasLease,
            _ => LeaseStatus::NoLeaseYet,
        }
    }

    // ---- election bookkeeping ----

    pub fn note_leader_contact(&mut self) {
        self.inner.last_leader_contact = Some(Instant::now());
    }

    pub fn heard_from_leader_within(
        &self,
        window: Duration,
    ) -> bool {
        self.inner
            .last_leader_contact
            .map(|t| t.elapsed() < window)
            .unwrap_or(false)
    }

    pub fn withhold_election_until(
        &mut self,
        until: Instant,
    ) {
        self.inner.withhold_election_until = Some(until);
    }

    pub fn election_withheld_for(&self) -> Option<Duration> {
        let until = self.inner.withhold_election_until?;
        let now = Instant::now();
        (until > now).then(|| until - now)
    }

    pub fn set_pending_election_op_id(
        &mut self,
        op_id: OpId,
    ) {
        self.inner.pending_election_op_id = Some(op_id);
    }

    /// Takes the deferred-election marker once its target op has committed.
    pub fn take_pending_election_if_committed(&mut self) -> Option<OpId> {
        let op_id = self.inner.pending_election_op_id?;
        if self.inner.last_committed.index >= op_id.index {
            self.inner.pending_election_op_id = None;
            Some(op_id)
        } else {
            None
        }
    }

    // ---- persistence ----

    fn persist_meta(&self) -> Result<()> {
        let doc = ConsensusMetaDoc {
            current_term: self.inner.current_term,
            voted_for: self.inner.voted_for.clone(),
            committed_config: self.inner.committed_config.clone(),
            pending_config: self.inner.pending_config.clone(),
        };
        self.state.meta_store.save(&doc)
    }
}

fn pack(
    role: PeerRole,
    term: u64,
) -> u64 {
    (term << 8) | role as u64
}

fn unpack(word: u64) -> (PeerRole, u64) {
    (PeerRole::from_u8((word & 0xff) as u8), word >> 8)
}

fn illegal_state(
    expected: &'static str,
    actual: LifecycleState,
) -> crate::Error {
    ConsensusError::StateTransition(StateTransitionError::IllegalState {
        expected,
        actual: actual.name(),
    })
    .into()
}

fn illegal_state_msg(msg: String) -> crate::Error {
    ConsensusError::Membership(crate::errors::MembershipError::InvalidChange(msg)).into()
}

fn active_of(meta: &ConsensusMetaDoc) -> &QuorumConfig {
    meta.pending_config
        .as_ref()
        .unwrap_or(&meta.committed_config)
}
