//! The per-tablet operation pipeline: submit → prepare (serial, batched) →
//! replicate → apply (serial, in OpId order) → finish.

mod operation;
mod operation_driver;
mod order_verifier;
mod preparer;

pub use operation::*;
pub use operation_driver::*;
pub use order_verifier::*;
pub use preparer::*;


use std::sync::Arc;
use std::sync::Weak;

use tokio::sync::mpsc;
use tracing::info;

use crate::consensus::ConsensusCore;
use crate::consensus::ConsensusRound;
use crate::consensus::ReplicaOperationFactory;
use crate::config::PipelineOptions;
use crate::Result;
use crate::TypeConfig;

/// Glues the preparer, the apply task, and the order verifier together, and
/// serves as the consensus core's operation factory for replica-side ops.
pub struct Pipeline<T: TypeConfig> {
    core: Arc<ConsensusCore<T>>,
    preparer: Preparer<T>,
    verifier: Arc<OperationOrderVerifier>,
    builder: Box<dyn ReplicaOperationBuilder>,
    apply_tx: mpsc::UnboundedSender<Arc<OperationDriver<T>>>,
    weak_self: parking_lot::Mutex<Weak<Pipeline<T>>>,
}

impl<T: TypeConfig> Pipeline<T> {
    pub fn new(
        core: Arc<ConsensusCore<T>>,
        options: PipelineOptions,
        builder: Box<dyn ReplicaOperationBuilder>,
    ) -> Arc<Self> {
        let (apply_tx, mut apply_rx) = mpsc::unbounded_channel::<Arc<OperationDriver<T>>>();
        let pipeline = Arc::new(Self {
            preparer: Preparer::new(core.clone(), options),
            core,
            verifier: Arc::new(OperationOrderVerifier::default()),
            builder,
            apply_tx,
            weak_self: parking_lot::Mutex::new(Weak::new()),
        });
        *pipeline.weak_self.lock() = Arc::downgrade(&pipeline);

        // The apply pool: one serial consumer per tablet, so applies land in
        // enqueue (= commit) order no matter how wide the runtime is.
        tokio::spawn(async move {
            while let Some(driver) = apply_rx.recv().await {
                driver.do_apply().await;
            }
            info!("apply task drained");
        });

        let factory: Weak<dyn ReplicaOperationFactory> = pipeline.weak_self.lock().clone();
        pipeline.core.set_operation_factory(factory);
        pipeline
    }

    pub fn core(&self) -> &Arc<ConsensusCore<T>> {
        &self.core
    }

    pub fn order_verifier(&self) -> &Arc<OperationOrderVerifier> {
        &self.verifier
    }

    /// Leader entry: wraps the operation in a driver and submits it to the
    /// serial preparer. Completion is reported through `Operation::finish`.
    pub fn submit(
        &self,
        op: Box<dyn Operation>,
    ) -> Result<Arc<OperationDriver<T>>> {
        let driver = OperationDriver::new_leader(op, self.weak_self.lock().clone());
        self.preparer.submit(driver.clone())?;
        Ok(driver)
    }

    pub(crate) fn enqueue_apply(
        &self,
        driver: Arc<OperationDriver<T>>,
    ) {
        // Receiver only closes at process teardown; a send failure there is
        // moot.
        let _ = self.apply_tx.send(driver);
    }

    pub fn stop(&self) {
        self.preparer.stop();
    }
}

impl<T: TypeConfig> ReplicaOperationFactory for Pipeline<T> {
    /// Follower path: rebuild the engine operation from the replicated
    /// message and run it through the same serial prepare pipeline.
    fn start_replica_operation(
        &self,
        round: Arc<ConsensusRound>,
    ) -> Result<()> {
        let op = self.builder.build(&round.msg())?;
        let driver = OperationDriver::new_replica(op, round, self.weak_self.lock().clone());
        self.preparer.submit(driver)?;
        Ok(())
    }
}
