//! In-flight replication unit.
//!
//! A round wraps one [`ReplicateMsg`] from submission until it is either
//! committed-and-applied or aborted. The term it was accepted into is bound
//! separately from the OpId term: a round that survives a leadership change
//! with a mismatched binding must abort at commit time instead of applying.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use parking_lot::RwLock;
use tracing::warn;

use crate::constants::UNBOUND_TERM;
use crate::errors::ConsensusError;
use crate::errors::ReplicationError;
use crate::proto::OpId;
use crate::proto::OperationType;
use crate::proto::ReplicateMsg;
use crate::Error;
use crate::Result;

/// Invoked exactly once with the replication decision: `Ok` when the round
/// committed, `Err(Aborted)` when it was truncated or cancelled.
pub type ReplicatedCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Invoked exactly once when the round's entry is durable in the local log.
pub type LogDurableCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

pub struct ConsensusRound {
    msg: RwLock<Arc<ReplicateMsg>>,
    /// Term the round was accepted into; [`UNBOUND_TERM`] until accepted.
    bound_term: AtomicU64,
    replicated_cb: Mutex<Option<ReplicatedCallback>>,
    log_durable_cb: Mutex<Option<LogDurableCallback>>,
}

impl ConsensusRound {
    pub fn new(msg: ReplicateMsg) -> Arc<Self> {
        Arc::new(Self {
            msg: RwLock::new(Arc::new(msg)),
            bound_term: AtomicU64::new(UNBOUND_TERM),
            replicated_cb: Mutex::new(None),
            log_durable_cb: Mutex::new(None),
        })
    }

    /// Follower-side construction: the message already carries its OpId, and
    /// the round is bound to the term it arrived in.
    pub fn new_bound(
        msg: Arc<ReplicateMsg>,
        term: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            msg: RwLock::new(msg),
            bound_term: AtomicU64::new(term),
            replicated_cb: Mutex::new(None),
            log_durable_cb: Mutex::new(None),
        })
    }

    pub fn msg(&self) -> Arc<ReplicateMsg> {
        self.msg.read().clone()
    }

    pub fn id(&self) -> OpId {
        self.msg.read().id
    }

    pub fn op_type(&self) -> OperationType {
        self.msg.read().op_type()
    }

    pub fn payload_size(&self) -> usize {
        self.msg.read().payload.len()
    }

    /// Binds the round to `term`. Rebinding to a different term is a protocol
    /// violation and fails; rebinding to the same term is a no-op.
    pub fn bind_term(
        &self,
        term: u64,
    ) -> Result<()> {
        match self.bound_term.compare_exchange(
            UNBOUND_TERM,
            term,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(existing) if existing == term => Ok(()),
            Err(existing) => Err(ConsensusError::Replication(
                ReplicationError::StaleRoundTerm {
                    bound_term: existing,
                    current_term: term,
                },
            )
            .into()),
        }
    }

    pub fn bound_term(&self) -> u64 {
        self.bound_term.load(Ordering::Acquire)
    }

    pub fn set_replicated_callback(
        &self,
        cb: ReplicatedCallback,
    ) {
        *self.replicated_cb.lock() = Some(cb);
    }

    pub fn set_log_durable_callback(
        &self,
        cb: LogDurableCallback,
    ) {
        *self.log_durable_cb.lock() = Some(cb);
    }

    /// Leader-side OpId assignment. Returns the previous message so the
    /// caller can unwind a failed batch in reverse order.
    pub(crate) fn stamp(
        &self,
        id: OpId,
        hybrid_time: u64,
        committed_op_id: OpId,
    ) -> Arc<ReplicateMsg> {
        let mut guard = self.msg.write();
        let prev = guard.clone();
        let mut next = (**guard).clone();
        next.id = id;
        next.hybrid_time = hybrid_time;
        next.committed_op_id = committed_op_id;
        *guard = Arc::new(next);
        prev
    }

    pub(crate) fn restore(
        &self,
        prev: Arc<ReplicateMsg>,
    ) {
        *self.msg.write() = prev;
    }

    /// Fires the replication decision exactly once; later calls are ignored.
    /// An aborted round also drops its log-durable callback: the entry will
    /// never matter again, and dropping it is the disconnect that breaks the
    /// round ↔ driver reference cycle.
    pub(crate) fn notify_replication_finished(
        &self,
        result: Result<()>,
    ) {
        let aborted = result.is_err();
        if let Some(cb) = self.replicated_cb.lock().take() {
            cb(result);
        } else if aborted {
            warn!(
                "round {} finished with an abort but had no replication callback",
                self.id()
            );
        }
        if aborted {
            self.log_durable_cb.lock().take();
        }
    }

    pub(crate) fn notify_log_durable(
        &self,
        result: Result<()>,
    ) {
        if let Some(cb) = self.log_durable_cb.lock().take() {
            cb(result);
        }
    }
}

/// A replication decision computed under the replica-state lock but fired
/// after it is released, so callbacks may re-enter consensus.
pub(crate) struct RoundOutcome {
    pub round: Arc<ConsensusRound>,
    pub result: Result<()>,
}

impl RoundOutcome {
    pub fn committed(round: Arc<ConsensusRound>) -> Self {
        Self {
            round,
            result: Ok(()),
        }
    }

    pub fn aborted(
        round: Arc<ConsensusRound>,
        error: Error,
    ) -> Self {
        Self {
            round,
            result: Err(error),
        }
    }
}
