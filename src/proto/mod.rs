//! Wire-level message definitions for the consensus core.
//!
//! These are hand-maintained `prost` types rather than `tonic-build` output:
//! the transport and service dispatch layer is an external collaborator, so
//! the crate only fixes the message shapes and lets the embedding server pick
//! its own codec plumbing.

mod ext;

#[cfg(test)]
mod ext_test;

pub use ext::MINIMUM_OP_ID;

/// A position in the replicated log: leadership epoch plus log index.
///
/// Ordered lexicographically by `(term, index)`; the all-zero value is the
/// minimum and never names a real entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, ::prost::Message)]
pub struct OpId {
    #[prost(uint64, tag = "1")]
    pub term: u64,

    #[prost(uint64, tag = "2")]
    pub index: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum OperationType {
    UnknownOp = 0,
    NoOp = 1,
    Write = 2,
    AlterSchema = 3,
    ChangeConfigOp = 4,
    /// Placeholder operation used by pipeline maintenance; batched alone.
    Empty = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum MemberType {
    UnknownMember = 0,
    Voter = 1,
    Observer = 2,
    PreVoter = 3,
    PreObserver = 4,
}

/// One member of a quorum configuration.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RaftPeer {
    #[prost(string, tag = "1")]
    pub uuid: ::prost::alloc::string::String,

    #[prost(string, tag = "2")]
    pub address: ::prost::alloc::string::String,

    #[prost(enumeration = "MemberType", tag = "3")]
    pub member_type: i32,
}

/// A committed or pending membership configuration.
///
/// `opid_index` pins the log index of the entry that installed this config;
/// it is 0 only for the bootstrap configuration.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QuorumConfig {
    #[prost(uint64, tag = "1")]
    pub opid_index: u64,

    #[prost(message, repeated, tag = "2")]
    pub peers: ::prost::alloc::vec::Vec<RaftPeer>,
}

/// A single replicated operation as it travels through the log and over the
/// wire. The payload is opaque to consensus; `op_type` routes consensus-only
/// operations (NoOp, config changes) to their internal handlers.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReplicateMsg {
    #[prost(enumeration = "OperationType", tag = "1")]
    pub op_type: i32,

    #[prost(message, required, tag = "2")]
    pub id: OpId,

    /// Hybrid timestamp assigned by the leader at replication time.
    #[prost(uint64, tag = "3")]
    pub hybrid_time: u64,

    /// Leader's committed watermark when this op was sent.
    #[prost(message, required, tag = "4")]
    pub committed_op_id: OpId,

    #[prost(bytes = "bytes", tag = "5")]
    pub payload: ::prost::bytes::Bytes,

    /// Present only for `ChangeConfigOp` entries.
    #[prost(message, optional, tag = "6")]
    pub config: ::core::option::Option<QuorumConfig>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum ConsensusErrorCode {
    UnknownError = 0,
    InvalidTerm = 1,
    PrecedingEntryDidntMatch = 2,
    CannotPrepare = 3,
    WrongServerUuid = 4,
    TabletNotFound = 5,
    AlreadyVoted = 6,
    LastOpIdTooOld = 7,
    LeaderIsAlive = 8,
    ConsensusBusy = 9,
    NotTheLeader = 10,
    LeaderNotReadyToStepDown = 11,
    LeaderNotReadyChangeConfig = 12,
    AddChangeConfigAlreadyPresent = 13,
    RemoveChangeConfigNotPresent = 14,
    CasFailed = 15,
    InvalidConfig = 16,
    LeaderNeedsStepDown = 17,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConsensusErrorDetail {
    #[prost(enumeration = "ConsensusErrorCode", tag = "1")]
    pub code: i32,

    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
}

/// Leader-to-follower append / heartbeat request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConsensusRequest {
    #[prost(string, tag = "1")]
    pub caller_uuid: ::prost::alloc::string::String,

    #[prost(uint64, tag = "2")]
    pub caller_term: u64,

    #[prost(string, tag = "3")]
    pub tablet_id: ::prost::alloc::string::String,

    #[prost(string, tag = "4")]
    pub dest_uuid: ::prost::alloc::string::String,

    /// OpId immediately before `ops[0]`; used for the log-matching check.
    #[prost(message, required, tag = "5")]
    pub preceding_id: OpId,

    #[prost(uint64, tag = "6")]
    pub committed_index: u64,

    #[prost(message, repeated, tag = "7")]
    pub ops: ::prost::alloc::vec::Vec<ReplicateMsg>,

    #[prost(uint64, optional, tag = "8")]
    pub propagated_hybrid_time: ::core::option::Option<u64>,

    #[prost(uint64, optional, tag = "9")]
    pub propagated_safe_time: ::core::option::Option<u64>,

    /// Lease the follower should grant the caller, as a duration so clock
    /// skew between servers does not leak into the protocol.
    #[prost(uint32, optional, tag = "10")]
    pub leader_lease_duration_ms: ::core::option::Option<u32>,

    /// Hybrid-time lease expiration, absolute (hybrid-time microseconds).
    #[prost(uint64, optional, tag = "11")]
    pub ht_lease_expiration: ::core::option::Option<u64>,
}

/// Follower's view of its own log, returned on every exchange.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConsensusStatus {
    #[prost(message, required, tag = "1")]
    pub last_received: OpId,

    /// Last op received from the *current* leader; retreats are negotiated
    /// against this watermark, never against ops from older terms.
    #[prost(message, required, tag = "2")]
    pub last_received_current_leader: OpId,

    #[prost(uint64, tag = "3")]
    pub last_committed_idx: u64,

    #[prost(message, optional, tag = "4")]
    pub error: ::core::option::Option<ConsensusErrorDetail>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConsensusResponse {
    #[prost(string, tag = "1")]
    pub responder_uuid: ::prost::alloc::string::String,

    #[prost(uint64, tag = "2")]
    pub responder_term: u64,

    #[prost(message, optional, tag = "3")]
    pub status: ::core::option::Option<ConsensusStatus>,
}

/// Candidate-to-voter ballot.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VoteRequest {
    #[prost(string, tag = "1")]
    pub candidate_uuid: ::prost::alloc::string::String,

    #[prost(uint64, tag = "2")]
    pub candidate_term: u64,

    #[prost(string, tag = "3")]
    pub tablet_id: ::prost::alloc::string::String,

    #[prost(string, tag = "4")]
    pub dest_uuid: ::prost::alloc::string::String,

    #[prost(message, required, tag = "5")]
    pub candidate_last_received: OpId,

    /// Set by instigated elections (step-down handoff) to bypass the
    /// live-leader check on voters.
    #[prost(bool, tag = "6")]
    pub ignore_live_leader: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VoteResponse {
    #[prost(string, tag = "1")]
    pub responder_uuid: ::prost::alloc::string::String,

    #[prost(uint64, tag = "2")]
    pub responder_term: u64,

    #[prost(bool, tag = "3")]
    pub vote_granted: bool,

    #[prost(message, optional, tag = "4")]
    pub error: ::core::option::Option<ConsensusErrorDetail>,

    /// How much of the old leader's lease the voter still honors; the winner
    /// must wait it out before serving.
    #[prost(uint32, optional, tag = "5")]
    pub remaining_leader_lease_duration_ms: ::core::option::Option<u32>,

    #[prost(uint64, optional, tag = "6")]
    pub leader_ht_lease_expiration: ::core::option::Option<u64>,
}

/// Instigates an immediate election on the destination (step-down handoff).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RunLeaderElectionRequest {
    #[prost(string, tag = "1")]
    pub dest_uuid: ::prost::alloc::string::String,

    #[prost(string, tag = "2")]
    pub tablet_id: ::prost::alloc::string::String,

    /// Uuid of the stepping-down leader, echoed back on loss.
    #[prost(string, optional, tag = "3")]
    pub originator_uuid: ::core::option::Option<::prost::alloc::string::String>,
}

/// Informs a step-down originator that its protege lost the election.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LeaderElectionLostRequest {
    #[prost(string, tag = "1")]
    pub dest_uuid: ::prost::alloc::string::String,

    #[prost(string, tag = "2")]
    pub tablet_id: ::prost::alloc::string::String,

    #[prost(string, tag = "3")]
    pub election_lost_by_uuid: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartRemoteBootstrapRequest {
    #[prost(string, tag = "1")]
    pub dest_uuid: ::prost::alloc::string::String,

    #[prost(string, tag = "2")]
    pub tablet_id: ::prost::alloc::string::String,

    #[prost(string, tag = "3")]
    pub bootstrap_source_uuid: ::prost::alloc::string::String,

    #[prost(string, tag = "4")]
    pub bootstrap_source_addr: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StepDownRequest {
    #[prost(string, tag = "1")]
    pub tablet_id: ::prost::alloc::string::String,

    #[prost(string, tag = "2")]
    pub dest_uuid: ::prost::alloc::string::String,

    /// Optional protege to hand leadership to.
    #[prost(string, optional, tag = "3")]
    pub new_leader_uuid: ::core::option::Option<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StepDownResponse {
    #[prost(message, optional, tag = "1")]
    pub error: ::core::option::Option<ConsensusErrorDetail>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum ChangeConfigType {
    UnknownChange = 0,
    AddServer = 1,
    RemoveServer = 2,
    ChangeRole = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChangeConfigRequest {
    #[prost(string, tag = "1")]
    pub tablet_id: ::prost::alloc::string::String,

    #[prost(string, tag = "2")]
    pub dest_uuid: ::prost::alloc::string::String,

    #[prost(enumeration = "ChangeConfigType", tag = "3")]
    pub change_type: i32,

    #[prost(message, optional, tag = "4")]
    pub server: ::core::option::Option<RaftPeer>,

    /// Compare-and-swap guard: the change only applies if the committed
    /// config's opid_index still equals this value.
    #[prost(uint64, optional, tag = "5")]
    pub cas_config_opid_index: ::core::option::Option<u64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChangeConfigResponse {
    #[prost(message, optional, tag = "1")]
    pub error: ::core::option::Option<ConsensusErrorDetail>,

    #[prost(message, optional, tag = "2")]
    pub new_config: ::core::option::Option<QuorumConfig>,
}

/// Durable per-tablet consensus metadata. Encoded with prost into the
/// metadata store; written before any externally-visible action that
/// depends on it (vote grants, term advances, config commits).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConsensusMetaDoc {
    #[prost(uint64, tag = "1")]
    pub current_term: u64,

    #[prost(string, optional, tag = "2")]
    pub voted_for: ::core::option::Option<::prost::alloc::string::String>,

    #[prost(message, required, tag = "3")]
    pub committed_config: QuorumConfig,

    #[prost(message, optional, tag = "4")]
    pub pending_config: ::core::option::Option<QuorumConfig>,
}
