//! Drives one operation through Prepare → Replicate → Apply → Finish.
//!
//! Two signals arrive independently: "local log durable" and "replication
//! decision". Whichever lands second enqueues the apply; the other side is
//! idempotent. Apply runs on the tablet's serial apply task, and an order
//! verifier asserts per-tablet OpId order.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;
use tracing::warn;

use super::CompletionStatus;
use super::Operation;
use super::Pipeline;
use crate::consensus::ConsensusRound;
use crate::metrics::APPLY_LATENCY_METRIC;
use crate::proto::OperationType;
use crate::proto::ReplicateMsg;
use crate::Error;
use crate::Result;
use crate::TypeConfig;
use crate::MINIMUM_OP_ID;

const STATE_NOT_STARTED: u8 = 0;
const STATE_PREPARE_STARTED: u8 = 1;
const STATE_REPLICATING: u8 = 2;
const STATE_APPLIED: u8 = 3;
const STATE_FINISHED: u8 = 4;

pub struct OperationDriver<T: TypeConfig> {
    op: Box<dyn Operation>,
    round: Arc<ConsensusRound>,
    pipeline: Weak<Pipeline<T>>,
    is_leader_side: bool,
    state: AtomicU8,
    log_durable: AtomicBool,
    /// Replication decision once it arrives; Ok = committed.
    decision: Mutex<Option<std::result::Result<(), String>>>,
    apply_enqueued: AtomicBool,
    finished: AtomicBool,
    submitted_at: Instant,
}

impl<T: TypeConfig> std::fmt::Debug for OperationDriver<T> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("OperationDriver")
            .field("op_type", &self.op.op_type())
            .field("is_leader_side", &self.is_leader_side)
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T: TypeConfig> OperationDriver<T> {
    /// Leader-side: the round is created here and gets its OpId at
    /// replication time.
    pub fn new_leader(
        op: Box<dyn Operation>,
        pipeline: Weak<Pipeline<T>>,
    ) -> Arc<Self> {
        let msg = ReplicateMsg {
            op_type: op.op_type() as i32,
            id: MINIMUM_OP_ID,
            hybrid_time: 0,
            committed_op_id: MINIMUM_OP_ID,
            payload: op.payload(),
            config: None,
        };
        let round = ConsensusRound::new(msg);
        Self::with_round(op, round, pipeline, true)
    }

    /// Replica-side: the round arrived through consensus and already has an
    /// OpId.
    pub fn new_replica(
        op: Box<dyn Operation>,
        round: Arc<ConsensusRound>,
        pipeline: Weak<Pipeline<T>>,
    ) -> Arc<Self> {
        Self::with_round(op, round, pipeline, false)
    }

    fn with_round(
        op: Box<dyn Operation>,
        round: Arc<ConsensusRound>,
        pipeline: Weak<Pipeline<T>>,
        is_leader_side: bool,
    ) -> Arc<Self> {
        let driver = Arc::new(Self {
            op,
            round,
            pipeline,
            is_leader_side,
            state: AtomicU8::new(STATE_NOT_STARTED),
            log_durable: AtomicBool::new(false),
            decision: Mutex::new(None),
            apply_enqueued: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            submitted_at: Instant::now(),
        });

        let weak = Arc::downgrade(&driver);
        driver.round.set_log_durable_callback(Box::new({
            let weak = weak.clone();
            move |result| {
                if let Some(driver) = weak.upgrade() {
                    driver.on_log_durable(result);
                }
            }
        }));
        driver.round.set_replicated_callback(Box::new(move |result| {
            if let Some(driver) = weak.upgrade() {
                driver.on_replication_decision(result);
            }
        }));
        driver
    }

    pub fn round(&self) -> &Arc<ConsensusRound> {
        &self.round
    }

    pub fn op_type(&self) -> OperationType {
        self.round.op_type()
    }

    pub fn is_leader_side(&self) -> bool {
        self.is_leader_side
    }

    /// Runs the operation's prepare. On the leader the round must already be
    /// term-bound; on a replica it was bound when it arrived.
    pub async fn prepare_and_start(self: &Arc<Self>) -> Result<()> {
        if self
            .state
            .compare_exchange(
                STATE_NOT_STARTED,
                STATE_PREPARE_STARTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // Already failed or cancelled before prepare ran.
            return Ok(());
        }
        self.op.prepare().await?;
        self.state.store(STATE_REPLICATING, Ordering::Release);
        // The decision may have raced ahead of the prepare (replica side).
        self.maybe_apply();
        Ok(())
    }

    /// Prepare (or batch replication) failure: fail only this operation.
    pub fn handle_failure(
        &self,
        error: Error,
    ) {
        warn!("operation {} failed: {error}", self.round.id());
        self.state.store(STATE_FINISHED, Ordering::Release);
        self.finish_once(CompletionStatus::Aborted {
            reason: format!("{error}"),
        });
    }

    fn on_log_durable(
        self: &Arc<Self>,
        result: Result<()>,
    ) {
        match result {
            Ok(()) => {
                self.log_durable.store(true, Ordering::Release);
                self.maybe_apply();
            }
            Err(e) => {
                // Local log loss is fatal upstream; release the caller.
                self.handle_failure(e);
            }
        }
    }

    fn on_replication_decision(
        self: &Arc<Self>,
        result: Result<()>,
    ) {
        match result {
            Ok(()) => {
                *self.decision.lock() = Some(Ok(()));
                self.maybe_apply();
            }
            Err(e) => {
                *self.decision.lock() = Some(Err(format!("{e}")));
                self.state.store(STATE_FINISHED, Ordering::Release);
                self.finish_once(CompletionStatus::Aborted {
                    reason: format!("{e}"),
                });
            }
        }
    }

    /// Both signals present and prepare done: enqueue the apply exactly once.
    fn maybe_apply(self: &Arc<Self>) {
        if !self.log_durable.load(Ordering::Acquire) {
            return;
        }
        if self.state.load(Ordering::Acquire) != STATE_REPLICATING {
            return;
        }
        if !matches!(*self.decision.lock(), Some(Ok(()))) {
            return;
        }
        if self.apply_enqueued.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(pipeline) = self.pipeline.upgrade() {
            pipeline.enqueue_apply(self.clone());
        }
    }

    /// Runs on the serial apply task.
    pub(super) async fn do_apply(self: &Arc<Self>) {
        let msg = self.round.msg();
        let op_id = msg.id;

        if let Some(pipeline) = self.pipeline.upgrade() {
            if let Err(e) = pipeline.order_verifier().check_apply(op_id) {
                self.handle_failure(e);
                return;
            }
        }

        match self.op.apply(op_id, msg.hybrid_time).await {
            Ok(()) => {
                self.state.store(STATE_APPLIED, Ordering::Release);
                APPLY_LATENCY_METRIC
                    .with_label_values(&[self.op_type().as_str_name()])
                    .observe(self.submitted_at.elapsed().as_millis() as f64);
                self.finish_once(CompletionStatus::Committed {
                    op_id,
                    hybrid_time: msg.hybrid_time,
                });
                self.state.store(STATE_FINISHED, Ordering::Release);
                debug!("operation {} applied", op_id);
            }
            Err(e) => {
                // A committed operation that cannot apply is a storage-level
                // invariant breach.
                self.handle_failure(e);
            }
        }
    }

    fn finish_once(
        &self,
        status: CompletionStatus,
    ) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.op.finish(status);
    }
}
