//! Vote and state tallies
//!
//! A tally only counts. Deciding what to do with a count, and when, is up to the election or
//! resync that owns it; neither tally is shared between tasks.

use std::collections::HashMap;

use quorum_types::{
    data::{HashId, NodeId, Opinion, Vote},
    ConsensusThresholds, ItemState,
};

/// Latest opinion of every node heard from about one item
#[derive(Clone, Debug)]
pub struct VoteTally {
    /// The item being voted on
    item_id: HashId,
    /// Latest opinion per voter
    votes: HashMap<NodeId, Opinion>,
}

impl VoteTally {
    /// An empty tally for `item_id`
    #[must_use]
    pub fn new(item_id: HashId) -> Self {
        Self {
            item_id,
            votes: HashMap::new(),
        }
    }

    /// Count a vote, replacing any earlier vote of the same node.
    ///
    /// Returns whether the tally changed. Votes about other items are ignored.
    pub fn add(&mut self, vote: &Vote) -> bool {
        if vote.item_id != self.item_id {
            return false;
        }
        self.votes.insert(vote.voter, vote.opinion) != Some(vote.opinion)
    }

    /// Number of nodes currently holding a positive opinion
    #[must_use]
    pub fn positive(&self) -> usize {
        self.count(Opinion::Positive)
    }

    /// Number of nodes currently holding a negative opinion
    #[must_use]
    pub fn negative(&self) -> usize {
        self.count(Opinion::Negative)
    }

    /// Number of distinct voters
    #[must_use]
    pub fn voters(&self) -> usize {
        self.votes.len()
    }

    /// The latest opinion of `node`, if it voted
    #[must_use]
    pub fn opinion_of(&self, node: &NodeId) -> Option<Opinion> {
        self.votes.get(node).copied()
    }

    /// The outcome the tally supports under `thresholds`, if any
    #[must_use]
    pub fn decide(&self, thresholds: &ConsensusThresholds) -> Option<Opinion> {
        if self.positive() >= thresholds.positive_consensus {
            Some(Opinion::Positive)
        } else if self.negative() >= thresholds.negative_consensus {
            Some(Opinion::Negative)
        } else {
            None
        }
    }

    /// Number of nodes holding `opinion`
    fn count(&self, opinion: Opinion) -> usize {
        self.votes.values().filter(|held| **held == opinion).count()
    }
}

/// Latest state every peer reported for one item during resync
#[derive(Clone, Debug, Default)]
pub struct ResyncTally {
    /// Latest reported state per peer
    replies: HashMap<NodeId, ItemState>,
}

impl ResyncTally {
    /// Record a peer's reply, replacing any earlier one
    pub fn add(&mut self, peer: NodeId, state: ItemState) {
        // held for revocation by some item, but still approved
        let state = match state {
            ItemState::Locked => ItemState::Approved,
            state => state,
        };
        self.replies.insert(peer, state);
    }

    /// Whether `peer` has replied
    #[must_use]
    pub fn has_replied(&self, peer: &NodeId) -> bool {
        self.replies.contains_key(peer)
    }

    /// Number of peers that replied
    #[must_use]
    pub fn responders(&self) -> usize {
        self.replies.len()
    }

    /// Number of peers reporting `state`
    #[must_use]
    pub fn reporting(&self, state: ItemState) -> usize {
        self.replies.values().filter(|held| **held == state).count()
    }

    /// The terminal state reported by at least `break_consensus` peers.
    ///
    /// When several qualify, the most reported one wins.
    #[must_use]
    pub fn agreed_state(&self, break_consensus: usize) -> Option<ItemState> {
        [ItemState::Approved, ItemState::Revoked, ItemState::Declined]
            .into_iter()
            .map(|state| (state, self.reporting(state)))
            .filter(|(_, count)| *count >= break_consensus)
            .max_by_key(|(_, count)| *count)
            .map(|(state, _)| state)
    }
}

#[cfg(test)]
mod test {
    use quorum_types::{
        data::{HashId, NodeId, Opinion, Vote},
        ConsensusThresholds, ItemState,
    };

    use super::{ResyncTally, VoteTally};

    fn thresholds() -> ConsensusThresholds {
        ConsensusThresholds {
            positive_consensus: 7,
            negative_consensus: 4,
            resync_break_consensus: 2,
        }
    }

    #[test]
    fn repeated_votes_are_not_double_counted() {
        let id = HashId::random();
        let mut tally = VoteTally::new(id);
        let vote = Vote::new(id, NodeId(1), Opinion::Positive);
        assert!(tally.add(&vote));
        assert!(!tally.add(&vote));
        assert_eq!(tally.positive(), 1);

        // latest opinion replaces the earlier one
        assert!(tally.add(&Vote::new(id, NodeId(1), Opinion::Negative)));
        assert_eq!(tally.positive(), 0);
        assert_eq!(tally.negative(), 1);
        assert_eq!(tally.voters(), 1);
    }

    #[test]
    fn votes_for_other_items_are_ignored() {
        let mut tally = VoteTally::new(HashId::random());
        assert!(!tally.add(&Vote::new(HashId::random(), NodeId(1), Opinion::Positive)));
        assert_eq!(tally.voters(), 0);
    }

    #[test]
    fn decides_on_thresholds() {
        let id = HashId::random();
        let mut tally = VoteTally::new(id);
        for voter in 0..6 {
            tally.add(&Vote::new(id, NodeId(voter), Opinion::Positive));
        }
        assert_eq!(tally.decide(&thresholds()), None);
        tally.add(&Vote::new(id, NodeId(6), Opinion::Positive));
        assert_eq!(tally.decide(&thresholds()), Some(Opinion::Positive));

        let mut tally = VoteTally::new(id);
        for voter in 0..4 {
            tally.add(&Vote::new(id, NodeId(voter), Opinion::Negative));
        }
        assert_eq!(tally.decide(&thresholds()), Some(Opinion::Negative));
    }

    #[test]
    fn resync_needs_break_quorum_of_terminal_states() {
        let mut tally = ResyncTally::default();
        tally.add(NodeId(1), ItemState::Approved);
        tally.add(NodeId(2), ItemState::Pending);
        tally.add(NodeId(3), ItemState::Undefined);
        assert_eq!(tally.agreed_state(2), None);

        tally.add(NodeId(4), ItemState::Approved);
        assert_eq!(tally.agreed_state(2), Some(ItemState::Approved));
        assert_eq!(tally.responders(), 4);
        assert!(tally.has_replied(&NodeId(3)));
        assert!(!tally.has_replied(&NodeId(5)));
    }

    #[test]
    fn resync_prefers_the_most_reported_state() {
        let mut tally = ResyncTally::default();
        for peer in 0..2 {
            tally.add(NodeId(peer), ItemState::Declined);
        }
        for peer in 2..5 {
            tally.add(NodeId(peer), ItemState::Revoked);
        }
        assert_eq!(tally.agreed_state(2), Some(ItemState::Revoked));
    }

    #[test]
    fn locked_records_count_as_approved() {
        let mut tally = ResyncTally::default();
        tally.add(NodeId(1), ItemState::Locked);
        tally.add(NodeId(2), ItemState::Approved);
        assert_eq!(tally.reporting(ItemState::Approved), 2);
        assert_eq!(tally.agreed_state(2), Some(ItemState::Approved));
    }
}
