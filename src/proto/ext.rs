//! Hand-written extensions over the wire types: ordering, constructors, and
//! config interrogation helpers shared across the consensus core.

use std::cmp::Ordering;
use std::fmt;

use super::ConsensusErrorCode;
use super::ConsensusErrorDetail;
use super::MemberType;
use super::OpId;
use super::OperationType;
use super::QuorumConfig;
use super::RaftPeer;
use super::ReplicateMsg;

/// The zero OpId. Sorts before every real log position.
pub const MINIMUM_OP_ID: OpId = OpId { term: 0, index: 0 };

impl OpId {
    pub fn new(
        term: u64,
        index: u64,
    ) -> Self {
        Self { term, index }
    }

    pub fn is_min(&self) -> bool {
        *self == MINIMUM_OP_ID
    }
}

impl PartialOrd for OpId {
    fn partial_cmp(
        &self,
        other: &Self,
    ) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpId {
    fn cmp(
        &self,
        other: &Self,
    ) -> Ordering {
        self.term
            .cmp(&other.term)
            .then_with(|| self.index.cmp(&other.index))
    }
}

impl fmt::Display for OpId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}.{}", self.term, self.index)
    }
}

impl OperationType {
    /// String value of the enum field name, as protoc would emit it.
    pub fn as_str_name(&self) -> &'static str {
        match self {
            OperationType::UnknownOp => "UNKNOWN_OP",
            OperationType::NoOp => "NO_OP",
            OperationType::Write => "WRITE",
            OperationType::AlterSchema => "ALTER_SCHEMA",
            OperationType::ChangeConfigOp => "CHANGE_CONFIG_OP",
            OperationType::Empty => "EMPTY",
        }
    }
}

impl ReplicateMsg {
    /// Consensus-only operations are handled inside the core instead of being
    /// routed to the tablet's operation factory.
    pub fn is_consensus_only(&self) -> bool {
        matches!(
            self.op_type(),
            OperationType::NoOp | OperationType::ChangeConfigOp
        )
    }
}

impl RaftPeer {
    pub fn is_voter(&self) -> bool {
        self.member_type() == MemberType::Voter
    }
}

impl QuorumConfig {
    pub fn peer(
        &self,
        uuid: &str,
    ) -> Option<&RaftPeer> {
        self.peers.iter().find(|p| p.uuid == uuid)
    }

    pub fn has_peer(
        &self,
        uuid: &str,
    ) -> bool {
        self.peer(uuid).is_some()
    }

    pub fn voter_uuids(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|p| p.is_voter())
            .map(|p| p.uuid.clone())
            .collect()
    }

    pub fn voter_count(&self) -> usize {
        self.peers.iter().filter(|p| p.is_voter()).count()
    }

    /// floor(V/2) + 1 over voting members.
    pub fn majority_size(&self) -> usize {
        self.voter_count() / 2 + 1
    }

    pub fn is_voter(
        &self,
        uuid: &str,
    ) -> bool {
        self.peer(uuid).map(RaftPeer::is_voter).unwrap_or(false)
    }

    /// True while any member is still mid-promotion (PreVoter/PreObserver).
    pub fn has_peer_in_transit(&self) -> bool {
        self.peers.iter().any(|p| {
            matches!(
                p.member_type(),
                MemberType::PreVoter | MemberType::PreObserver
            )
        })
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        for (i, peer) in self.peers.iter().enumerate() {
            if peer.uuid.is_empty() {
                return Err(format!("peer #{i} has an empty uuid"));
            }
            if self.peers[..i].iter().any(|p| p.uuid == peer.uuid) {
                return Err(format!("duplicate peer uuid {}", peer.uuid));
            }
            if peer.member_type() == MemberType::UnknownMember {
                return Err(format!("peer {} has an unknown member type", peer.uuid));
            }
        }
        if self.voter_count() == 0 {
            return Err("config has no voting members".to_string());
        }
        Ok(())
    }
}

impl ConsensusErrorDetail {
    pub fn new(
        code: ConsensusErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code: code as i32,
            message: message.into(),
        }
    }
}
