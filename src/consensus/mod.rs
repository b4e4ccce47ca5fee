mod consensus_core;
mod election;
mod failure_detector;
mod message_queue;
mod peer;
mod peer_manager;
mod replica_state;
mod round;

pub use consensus_core::*;
pub use election::*;
pub(crate) use failure_detector::*;
pub use message_queue::*;
pub use peer::*;
pub use peer_manager::*;
pub use replica_state::*;
pub use round::*;

#[cfg(test)]
mod election_test;
#[cfg(test)]
mod message_queue_test;

use crate::proto::MemberType;
use crate::proto::QuorumConfig;

/// How a peer send is triggered.
///
/// `NonEmptyOnly` is the data path: skip if there is nothing new for the
/// peer. `AlwaysSend` is used by heartbeats and by the first exchange with a
/// peer, where an empty request still negotiates watermarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    NonEmptyOnly,
    AlwaysSend,
}

/// The replica's active role. Only `Leader` issues OpIds or sends appends;
/// only voters count toward quorum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerRole {
    Leader = 0,
    Follower = 1,
    Learner = 2,
    Observer = 3,
    PreVoter = 4,
    PreObserver = 5,
    NonParticipant = 6,
}

impl PeerRole {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => PeerRole::Leader,
            1 => PeerRole::Follower,
            2 => PeerRole::Learner,
            3 => PeerRole::Observer,
            4 => PeerRole::PreVoter,
            5 => PeerRole::PreObserver,
            _ => PeerRole::NonParticipant,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PeerRole::Leader => "Leader",
            PeerRole::Follower => "Follower",
            PeerRole::Learner => "Learner",
            PeerRole::Observer => "Observer",
            PeerRole::PreVoter => "PreVoter",
            PeerRole::PreObserver => "PreObserver",
            PeerRole::NonParticipant => "NonParticipant",
        }
    }
}

/// The role `uuid` plays in `config` when `leader_uuid` holds the lease.
pub(crate) fn derive_role(
    uuid: &str,
    is_leader: bool,
    config: &QuorumConfig,
) -> PeerRole {
    let Some(peer) = config.peer(uuid) else {
        return PeerRole::NonParticipant;
    };
    match peer.member_type() {
        MemberType::Voter if is_leader => PeerRole::Leader,
        MemberType::Voter => PeerRole::Follower,
        MemberType::Observer => PeerRole::Observer,
        MemberType::PreVoter => PeerRole::PreVoter,
        MemberType::PreObserver => PeerRole::PreObserver,
        MemberType::UnknownMember => PeerRole::NonParticipant,
    }
}
