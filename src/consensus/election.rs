//! Vote tallying for one election round.

use std::collections::HashSet;

use crate::utils::quorum::majority_count;

/// Why this election was started; carried through so the outcome can be
/// routed back (e.g. to a step-down originator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionReason {
    /// The failure detector expired without a live leader.
    LeaderFailureDetected,
    /// An outgoing leader instigated this election (step-down handoff).
    /// Voters are asked to ignore a live leader; the originator, if named,
    /// hears back on loss.
    Instigated { originator_uuid: Option<String> },
}

impl ElectionReason {
    pub fn ignore_live_leader(&self) -> bool {
        matches!(self, ElectionReason::Instigated { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionDecision {
    Won,
    Lost,
    Undecided,
}

/// Tallies yes/no votes from distinct voters; quorum = floor(V/2)+1.
pub struct VoteCounter {
    num_voters: usize,
    granted: HashSet<String>,
    denied: HashSet<String>,
}

impl VoteCounter {
    pub fn new(num_voters: usize) -> Self {
        Self {
            num_voters,
            granted: HashSet::new(),
            denied: HashSet::new(),
        }
    }

    /// Records a vote; duplicate responses from one voter are ignored.
    pub fn register_vote(
        &mut self,
        voter_uuid: &str,
        granted: bool,
    ) {
        if self.granted.contains(voter_uuid) || self.denied.contains(voter_uuid) {
            return;
        }
        if granted {
            self.granted.insert(voter_uuid.to_string());
        } else {
            self.denied.insert(voter_uuid.to_string());
        }
    }

    pub fn majority_size(&self) -> usize {
        majority_count(self.num_voters)
    }

    pub fn votes_granted(&self) -> usize {
        self.granted.len()
    }

    pub fn decision(&self) -> ElectionDecision {
        let quorum = self.majority_size();
        if self.granted.len() >= quorum {
            ElectionDecision::Won
        } else if self.denied.len() > self.num_voters - quorum {
            // Even if every outstanding voter said yes we could not reach
            // quorum.
            ElectionDecision::Lost
        } else {
            ElectionDecision::Undecided
        }
    }
}
