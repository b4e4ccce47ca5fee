use prost::Message;

use super::ConsensusErrorCode;
use super::ConsensusErrorDetail;
use super::MemberType;
use super::OpId;
use super::QuorumConfig;
use super::RaftPeer;
use super::MINIMUM_OP_ID;

fn peer(
    uuid: &str,
    member_type: MemberType,
) -> RaftPeer {
    RaftPeer {
        uuid: uuid.to_string(),
        address: format!("{uuid}.local:7100"),
        member_type: member_type as i32,
    }
}

#[test]
fn test_op_id_ordering_is_term_major() {
    assert!(OpId::new(1, 9) < OpId::new(2, 1));
    assert!(OpId::new(2, 1) < OpId::new(2, 2));
    assert_eq!(OpId::new(3, 5), OpId::new(3, 5));
    assert!(MINIMUM_OP_ID < OpId::new(0, 1));
    assert!(MINIMUM_OP_ID.is_min());
    assert!(!OpId::new(1, 0).is_min());
}

#[test]
fn test_op_id_prost_round_trip() {
    let id = OpId::new(7, 42);
    let bytes = id.encode_to_vec();
    let decoded = OpId::decode(bytes.as_slice()).expect("decode");
    assert_eq!(id, decoded);
}

#[test]
fn test_quorum_config_majority_counts_voters_only() {
    let config = QuorumConfig {
        opid_index: 3,
        peers: vec![
            peer("a", MemberType::Voter),
            peer("b", MemberType::Voter),
            peer("c", MemberType::Voter),
            peer("d", MemberType::PreVoter),
            peer("e", MemberType::Observer),
        ],
    };
    assert_eq!(config.voter_count(), 3);
    assert_eq!(config.majority_size(), 2);
    assert!(config.is_voter("a"));
    assert!(!config.is_voter("d"));
    assert!(config.has_peer_in_transit());
}

#[test]
fn test_quorum_config_validate_rejects_duplicates() {
    let config = QuorumConfig {
        opid_index: 0,
        peers: vec![peer("a", MemberType::Voter), peer("a", MemberType::Voter)],
    };
    let err = config.validate().unwrap_err();
    assert!(err.contains("duplicate"), "unexpected error: {err}");
}

#[test]
fn test_quorum_config_validate_requires_a_voter() {
    let config = QuorumConfig {
        opid_index: 0,
        peers: vec![peer("a", MemberType::Observer)],
    };
    assert!(config.validate().is_err());
}

#[test]
fn test_error_detail_code_fallback() {
    let detail = ConsensusErrorDetail {
        code: 9999,
        message: "?".to_string(),
    };
    assert_eq!(detail.code(), ConsensusErrorCode::UnknownError);

    let detail = ConsensusErrorDetail::new(ConsensusErrorCode::InvalidTerm, "stale");
    assert_eq!(detail.code(), ConsensusErrorCode::InvalidTerm);
}
