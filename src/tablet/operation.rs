//! The seam between consensus and the tablet storage engine.
//!
//! Consensus never interprets payloads: an [`Operation`] carries them, takes
//! whatever engine locks it needs in `prepare`, and applies once its round
//! commits. The engine supplies a [`ReplicaOperationBuilder`] so followers
//! can rebuild operations from replicated messages.

use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use tonic::async_trait;

use crate::proto::OpId;
use crate::proto::OperationType;
use crate::proto::ReplicateMsg;
use crate::Result;

/// Terminal status handed to `Operation::finish`, exactly once.
#[derive(Debug, Clone)]
pub enum CompletionStatus {
    Committed { op_id: OpId, hybrid_time: u64 },
    Aborted { reason: String },
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Operation: Send + Sync + 'static {
    fn op_type(&self) -> OperationType;

    /// Payload as it appears in the replicated log.
    fn payload(&self) -> Bytes;

    /// Decode, validate, and take engine locks. A failure here fails only
    /// this operation, never its batch.
    async fn prepare(&self) -> Result<()>;

    /// Apply the committed operation at `hybrid_time`. Runs on the apply
    /// pool and may block on storage locks.
    async fn apply(
        &self,
        op_id: OpId,
        hybrid_time: u64,
    ) -> Result<()>;

    /// Releases locks and completes the caller. Called exactly once.
    fn finish(
        &self,
        status: CompletionStatus,
    );
}

/// Builds replica-side operations from messages arriving via consensus.
#[cfg_attr(test, automock)]
pub trait ReplicaOperationBuilder: Send + Sync + 'static {
    fn build(
        &self,
        msg: &ReplicateMsg,
    ) -> Result<Box<dyn Operation>>;
}
