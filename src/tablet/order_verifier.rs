//! Asserts that applies happen in OpId order, one verifier per tablet.

use parking_lot::Mutex;
use tracing::error;

use crate::errors::ConsensusError;
use crate::errors::ReplicationError;
use crate::proto::OpId;
use crate::Result;
use crate::MINIMUM_OP_ID;

#[derive(Default)]
pub struct OperationOrderVerifier {
    last_applied: Mutex<OpId>,
}

impl OperationOrderVerifier {
    /// Committed indices are dense, so each apply must be exactly one past
    /// the previous. The first apply after process start anchors the
    /// sequence (bootstrap may have absorbed an arbitrary prefix).
    pub fn check_apply(
        &self,
        op_id: OpId,
    ) -> Result<()> {
        let mut last = self.last_applied.lock();
        if *last == MINIMUM_OP_ID {
            *last = op_id;
            return Ok(());
        }
        let expected_index = last.index + 1;
        if op_id.index != expected_index || op_id <= *last {
            error!(
                "apply order violation: applying {} after {}",
                op_id, *last
            );
            debug_assert!(false, "apply order violation: {op_id} after {}", *last);
            return Err(ConsensusError::Replication(ReplicationError::OpAlreadyPresent(
                op_id.index,
            ))
            .into());
        }
        *last = op_id;
        Ok(())
    }

    pub fn last_applied(&self) -> OpId {
        *self.last_applied.lock()
    }

    /// Bootstrap: applies below this were already absorbed by the engine.
    pub fn prime(
        &self,
        op_id: OpId,
    ) {
        let mut last = self.last_applied.lock();
        if op_id > *last || *last == MINIMUM_OP_ID {
            *last = op_id;
        }
    }
}
