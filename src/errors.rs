//! Error hierarchy for the per-tablet consensus core.
//!
//! Errors are grouped by protocol layer; every variant maps onto one of the
//! coarse [`StatusKind`] categories callers use for retry decisions.

use std::time::Duration;

use crate::proto::OpId;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Infrastructure-level failures (network, storage, serialization)
    #[error(transparent)]
    System(#[from] SystemError),

    /// Configuration validation failures
    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Consensus protocol violations and failures
    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

/// Coarse classification used by retry policy at every layer boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    /// Role/state precondition failed locally; retry after refreshing state.
    IllegalState,
    /// Request malformed; not retried.
    InvalidArgument,
    /// Queue full or memory pressure; retried with backoff.
    ServiceUnavailable,
    /// RPC or wait exceeded its deadline.
    TimedOut,
    /// Pending round cancelled by truncation or shutdown.
    Aborted,
    /// Unknown tablet or unknown peer.
    NotFound,
    /// Error propagated from a reachable peer.
    RemoteError,
    /// Everything that must not be retried blindly.
    Fatal,
}

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    /// Illegal replica state transitions
    #[error(transparent)]
    StateTransition(#[from] StateTransitionError),

    /// Leader election failures
    #[error(transparent)]
    Election(#[from] ElectionError),

    /// Log replication failures
    #[error(transparent)]
    Replication(#[from] ReplicationError),

    /// Membership change failures
    #[error(transparent)]
    Membership(#[from] MembershipError),

    /// Role permission conflict
    #[error("Operation requires {required_role} role but current role is {current_role}")]
    RoleViolation {
        current_role: &'static str,
        required_role: &'static str,
        context: String,
    },

    /// The single-writer update path is occupied; callers back off.
    #[error("Consensus update path is busy")]
    Busy,

    /// Replica is shutting down; no further operations accepted.
    #[error("Replica is shut down")]
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
#[doc(hidden)]
pub enum StateTransitionError {
    #[error("Replica not in expected lifecycle state: expected {expected}, actual {actual}")]
    IllegalState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Term regression: current {current}, proposed {proposed}")]
    TermRegression { current: u64, proposed: u64 },

    #[error("Already voted for {voted_for} in term {term}")]
    AlreadyVotedThisTerm { term: u64, voted_for: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    #[error("Election failed: {0}")]
    Failed(String),

    #[error("Found higher term(={0}) during election")]
    HigherTerm(u64),

    #[error("Quorum not reached (required: {required}, granted: {granted})")]
    QuorumFailure { required: usize, granted: usize },

    #[error("Election withheld for another {0:?} after step-down")]
    Withheld(Duration),

    #[error("A live leader was heard within the election timeout")]
    LeaderIsAlive,

    #[error("Candidate log (last={candidate_last}) is behind local log (last={local_last})")]
    LogTooOld {
        candidate_last: OpId,
        local_last: OpId,
    },

    #[error("No voting member found for candidate {candidate_uuid}")]
    NoVotingMemberFound { candidate_uuid: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("Found higher term(={0}) during replication")]
    HigherTerm(u64),

    #[error("Round bound to term {bound_term} but current term is {current_term}")]
    StaleRoundTerm { bound_term: u64, current_term: u64 },

    #[error("A different round is already pending at index {0}")]
    OpAlreadyPresent(u64),

    #[error("Committed index cannot retreat from {from} to {to}")]
    CommittedIndexRegression { from: u64, to: u64 },

    #[error("Preceding entry {preceding} not found in log or pending ops")]
    PrecedingEntryMismatch { preceding: OpId },

    #[error("Cannot prepare operation at {op_id}: {reason}")]
    CannotPrepare { op_id: OpId, reason: String },

    #[error("Pending-operation memory soft limit exceeded ({used} of {limit} bytes)")]
    MemoryPressure { used: usize, limit: usize },

    #[error("Prepare queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Operation at {op_id} aborted: {reason}")]
    Aborted { op_id: OpId, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    #[error("Local replica is not the leader")]
    NotTheLeader,

    #[error("Leader has no committed operation in the current term yet")]
    LeaderNotReady,

    #[error("Protege {0} has not caught up to the leader's log")]
    ProtegeNotCaughtUp(String),

    #[error("A config change is already pending at opid_index {0}")]
    PendingConfigExists(u64),

    #[error("Peer {0} is still in transit (PreVoter/PreObserver)")]
    PeerInTransit(String),

    #[error("Config CAS failed: expected opid_index {expected}, actual {actual}")]
    CasFailed { expected: u64, actual: u64 },

    #[error("Server {0} is already present in the active config")]
    AlreadyPresent(String),

    #[error("Server {0} is not present in the active config")]
    NotPresent(String),

    #[error("A leader cannot remove itself; step down first")]
    SelfRemoval,

    #[error("Invalid membership change: {0}")]
    InvalidChange(String),

    #[error("Step-down retry for protege {0} is still cooling down")]
    StepDownRetryCoolingDown(String),
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Connection timeout to {uuid} after {duration:?}")]
    Timeout { uuid: String, duration: Duration },

    #[error("Network unreachable: {0}")]
    Unreachable(String),

    #[error("Request reached the wrong server: expected {expected}, actual {actual}")]
    WrongServerUuid { expected: String, actual: String },

    #[error("Unknown tablet {0}")]
    TabletNotFound(String),

    #[error("Peer({0}) proxy not found")]
    PeerProxyNotFound(String),

    #[error("Remote error from {uuid}: {message}")]
    Remote { uuid: String, message: String },

    /// gRPC status propagated from the embedding transport.
    #[error(transparent)]
    TonicStatus(#[from] Box<tonic::Status>),

    #[error("Signal send failed: {0}")]
    SignalSendFailed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Log append failure is fatal to the process: data integrity.
    #[error("Log append failed: {0}")]
    LogAppend(String),

    #[error("Metadata store failure: {0}")]
    MetaStore(String),

    #[error("Protobuf operation failed: {0}")]
    Prost(#[from] ProstError),
}

/// Wrapper for prost encoding/decoding errors
#[derive(Debug, thiserror::Error)]
pub enum ProstError {
    #[error("Encoding failed: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("Decoding failed: {0}")]
    Decode(#[from] prost::DecodeError),
}

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Storage operation failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Background task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),

    #[error("Wait exceeded deadline after {0:?}")]
    WaitTimedOut(Duration),
}

impl Error {
    pub fn kind(&self) -> StatusKind {
        match self {
            Error::System(e) => e.kind(),
            Error::Config(_) | Error::InvalidConfig(_) => StatusKind::InvalidArgument,
            Error::Consensus(e) => e.kind(),
            Error::Fatal(_) => StatusKind::Fatal,
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.kind() == StatusKind::Aborted
    }

    pub fn is_illegal_state(&self) -> bool {
        self.kind() == StatusKind::IllegalState
    }

    pub fn is_service_unavailable(&self) -> bool {
        self.kind() == StatusKind::ServiceUnavailable
    }
}

impl SystemError {
    fn kind(&self) -> StatusKind {
        match self {
            SystemError::Network(e) => e.kind(),
            SystemError::Storage(_) | SystemError::TaskFailed(_) => StatusKind::Fatal,
            SystemError::WaitTimedOut(_) => StatusKind::TimedOut,
        }
    }
}

impl NetworkError {
    fn kind(&self) -> StatusKind {
        match self {
            NetworkError::ServiceUnavailable(_) => StatusKind::ServiceUnavailable,
            NetworkError::Timeout { .. } => StatusKind::TimedOut,
            NetworkError::Unreachable(_) | NetworkError::SignalSendFailed(_) => {
                StatusKind::ServiceUnavailable
            }
            NetworkError::WrongServerUuid { .. } => StatusKind::InvalidArgument,
            NetworkError::TabletNotFound(_) | NetworkError::PeerProxyNotFound(_) => {
                StatusKind::NotFound
            }
            NetworkError::Remote { .. } | NetworkError::TonicStatus(_) => StatusKind::RemoteError,
        }
    }
}

impl ConsensusError {
    fn kind(&self) -> StatusKind {
        match self {
            ConsensusError::StateTransition(_)
            | ConsensusError::RoleViolation { .. }
            | ConsensusError::Election(_) => StatusKind::IllegalState,
            ConsensusError::Replication(e) => e.kind(),
            ConsensusError::Membership(
                MembershipError::CasFailed { .. } | MembershipError::InvalidChange(_),
            ) => StatusKind::InvalidArgument,
            ConsensusError::Membership(_) => StatusKind::IllegalState,
            ConsensusError::Busy => StatusKind::ServiceUnavailable,
            ConsensusError::Shutdown => StatusKind::Aborted,
        }
    }
}

impl ReplicationError {
    fn kind(&self) -> StatusKind {
        match self {
            ReplicationError::HigherTerm(_) | ReplicationError::StaleRoundTerm { .. } => {
                StatusKind::IllegalState
            }
            ReplicationError::OpAlreadyPresent(_)
            | ReplicationError::CommittedIndexRegression { .. }
            | ReplicationError::PrecedingEntryMismatch { .. } => StatusKind::IllegalState,
            ReplicationError::CannotPrepare { .. } => StatusKind::RemoteError,
            ReplicationError::MemoryPressure { .. } | ReplicationError::QueueFull { .. } => {
                StatusKind::ServiceUnavailable
            }
            ReplicationError::Aborted { .. } => StatusKind::Aborted,
        }
    }
}

/// Convenience constructors used by the abort paths, where the same status is
/// fanned out to many rounds at once.
pub(crate) fn aborted(
    op_id: OpId,
    reason: impl Into<String>,
) -> Error {
    ConsensusError::Replication(ReplicationError::Aborted {
        op_id,
        reason: reason.into(),
    })
    .into()
}
