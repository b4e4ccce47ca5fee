use super::ElectionDecision;
use super::ElectionReason;
use super::VoteCounter;

#[test]
fn test_three_voter_majority() {
    let mut counter = VoteCounter::new(3);
    assert_eq!(counter.decision(), ElectionDecision::Undecided);

    counter.register_vote("a", true);
    assert_eq!(counter.decision(), ElectionDecision::Undecided);

    counter.register_vote("b", true);
    assert_eq!(counter.decision(), ElectionDecision::Won);
}

#[test]
fn test_loss_is_decided_early() {
    let mut counter = VoteCounter::new(3);
    counter.register_vote("a", true); // self
    counter.register_vote("b", false);
    assert_eq!(counter.decision(), ElectionDecision::Undecided);
    counter.register_vote("c", false);
    assert_eq!(counter.decision(), ElectionDecision::Lost);
}

#[test]
fn test_duplicate_votes_ignored() {
    let mut counter = VoteCounter::new(3);
    counter.register_vote("a", true);
    counter.register_vote("a", true);
    counter.register_vote("a", true);
    assert_eq!(counter.votes_granted(), 1);
    assert_eq!(counter.decision(), ElectionDecision::Undecided);
}

#[test]
fn test_flipped_vote_keeps_first_answer() {
    let mut counter = VoteCounter::new(3);
    counter.register_vote("b", false);
    counter.register_vote("b", true);
    assert_eq!(counter.votes_granted(), 0);
}

#[test]
fn test_single_node_cluster_wins_alone() {
    let mut counter = VoteCounter::new(1);
    counter.register_vote("a", true);
    assert_eq!(counter.decision(), ElectionDecision::Won);
}

#[test]
fn test_five_voters_need_three() {
    let mut counter = VoteCounter::new(5);
    counter.register_vote("a", true);
    counter.register_vote("b", true);
    assert_eq!(counter.decision(), ElectionDecision::Undecided);
    counter.register_vote("c", true);
    assert_eq!(counter.decision(), ElectionDecision::Won);
}

#[test]
fn test_reason_controls_live_leader_bypass() {
    assert!(!ElectionReason::LeaderFailureDetected.ignore_live_leader());
    assert!(ElectionReason::Instigated {
        originator_uuid: None
    }
    .ignore_live_leader());
}
