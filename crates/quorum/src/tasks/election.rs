//! The election of one item on one node
//!
//! An election forms the node's own opinion, asks every peer for theirs and tallies the answers
//! until a threshold is met or time runs out. Once decided it keeps re-announcing the result to
//! peers that have not caught up, for a bounded time.

use std::sync::Arc;

use chrono::Utc;
use quorum_types::{
    data::{ErrorCode, ErrorRecord, HashId, NodeId, Opinion, StateRecord, Vote},
    item_state::ItemState,
    message::MessageKind,
    traits::{
        item::Item,
        ledger::{Ledger, LedgerResult, RecordChange},
        network::ConnectedNetwork,
        node_implementation::NodeImplementation,
    },
};
use tokio::{
    select,
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender},
        watch,
    },
    task::AbortHandle,
    time::{interval_at, sleep_until, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, trace};

use crate::{expiry_after, tally::VoteTally, with_state, Node};

/// Phase of an election
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElectionState {
    /// No opinion leads
    Collecting,
    /// More positive than negative votes so far
    PositiveLead,
    /// More negative than positive votes so far
    NegativeLead,
    /// The item was approved
    DecidedApproved,
    /// The item was declined
    DecidedDeclined,
    /// No threshold was met in time
    DecidedUndefinedTimeout,
}

impl ElectionState {
    /// Whether the election is over
    #[must_use]
    pub fn is_decided(self) -> bool {
        matches!(
            self,
            ElectionState::DecidedApproved
                | ElectionState::DecidedDeclined
                | ElectionState::DecidedUndefinedTimeout
        )
    }
}

/// Input for a running election
#[derive(Debug)]
pub(crate) enum ElectionInput {
    /// A peer's vote, asking for ours in return
    Request(Vote),
    /// A peer's vote
    Vote(Vote),
}

/// The node's handle on an election in flight
#[derive(Debug)]
pub(crate) struct ElectionHandle {
    /// Feeds the election task
    inputs: UnboundedSender<ElectionInput>,
    /// Current phase
    state: watch::Receiver<ElectionState>,
    /// Aborts the election task
    task: AbortHandle,
}

impl ElectionHandle {
    /// Wrap the parts of a freshly spawned election
    pub(crate) fn new(
        inputs: UnboundedSender<ElectionInput>,
        state: watch::Receiver<ElectionState>,
        task: AbortHandle,
    ) -> Self {
        Self {
            inputs,
            state,
            task,
        }
    }

    /// Hand an input to the election
    pub(crate) fn deliver(&self, input: ElectionInput) {
        // the election may be finishing; late input is dropped
        let _ = self.inputs.send(input);
    }

    /// Current phase
    pub(crate) fn state(&self) -> ElectionState {
        *self.state.borrow()
    }

    /// Stop the election task
    pub(crate) fn abort(&self) {
        self.task.abort();
    }
}

/// What the local check of an item found, and which holds it took
#[derive(Debug, Default)]
pub(crate) struct LocalCheck {
    /// Every problem found; empty means a positive opinion
    pub(crate) errors: Vec<ErrorRecord>,
    /// Approved items locked for revocation
    pub(crate) revoke_locks: Vec<HashId>,
    /// Ids reserved for the items created together with this one
    pub(crate) creation_locks: Vec<HashId>,
}

impl LocalCheck {
    /// The opinion the check supports
    pub(crate) fn opinion(&self) -> Opinion {
        if self.errors.is_empty() {
            Opinion::Positive
        } else {
            Opinion::Negative
        }
    }
}

/// Run the election of `item` until it is decided and announced, or times out
pub(crate) async fn run<I: NodeImplementation>(
    node: Arc<Node<I>>,
    item: Arc<dyn Item>,
    inputs: UnboundedReceiver<ElectionInput>,
    state: watch::Sender<ElectionState>,
) {
    let id = item.id();
    let mut election = Election {
        tally: VoteTally::new(id),
        node: Arc::clone(&node),
        item,
        id,
        inputs,
        state,
    };
    match election.execute().await {
        Ok(state) => debug!(?state, "election finished"),
        Err(error) => error!(%error, "election aborted by ledger failure"),
    }
    node.elections.remove(&id);
}

/// State of one running election
struct Election<I: NodeImplementation> {
    /// The owning node
    node: Arc<Node<I>>,
    /// The item voted on
    item: Arc<dyn Item>,
    /// Its id
    id: HashId,
    /// Votes heard so far, ours included
    tally: VoteTally,
    /// Votes and vote requests from peers
    inputs: UnboundedReceiver<ElectionInput>,
    /// Published phase
    state: watch::Sender<ElectionState>,
}

impl<I: NodeImplementation> Election<I> {
    /// Drive the election to its end
    async fn execute(&mut self) -> LedgerResult<ElectionState> {
        let record = self.node.ledger.find_or_create(self.id).await?;
        if record.state.is_consensus_found() || record.state.is_locked() {
            trace!(state = %record.state, "nothing to elect");
            return Ok(self.settled_state(record.state));
        }

        let check = self.node.form_opinion(&self.item).await?;
        let own_opinion = check.opinion();
        if !check.errors.is_empty() {
            debug!(errors = check.errors.len(), "item failed local check");
        }
        self.node.cache.set_errors(&self.id, check.errors.clone());
        self.node
            .ledger
            .save(&StateRecord {
                state: own_opinion.pending_state(),
                ..record
            })
            .await?;
        self.node.publish(self.id, own_opinion.pending_state());

        let own_vote = Vote::new(self.id, self.node.id, own_opinion);
        self.tally.add(&own_vote);
        self.node
            .broadcast(MessageKind::VoteRequest {
                item: Arc::clone(&self.item),
                vote: own_vote.clone(),
            })
            .await;

        let decision = self.collect(&own_vote).await;
        let final_state = match decision {
            Some(Opinion::Positive) => {
                self.approve(&check).await?;
                ElectionState::DecidedApproved
            }
            Some(Opinion::Negative) => {
                self.decline(&check).await?;
                ElectionState::DecidedDeclined
            }
            None => {
                self.give_up(&check).await?;
                ElectionState::DecidedUndefinedTimeout
            }
        };
        self.state.send_replace(final_state);

        if let Some(opinion) = decision {
            self.announce(Vote::new(self.id, self.node.id, opinion))
                .await;
        }
        Ok(final_state)
    }

    /// Tally votes until a threshold is met or `max_elections_time` elapses
    async fn collect(&mut self, own_vote: &Vote) -> Option<Opinion> {
        let config = Arc::clone(&self.node.config);
        let start = Instant::now();
        let deadline = start + config.max_elections_time;
        let mut poll = interval_at(start + config.poll_time, config.poll_time);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if let Some(opinion) = self.decide(own_vote.opinion).await {
                return Some(opinion);
            }
            select! {
                input = self.inputs.recv() => match input {
                    Some(input) => self.on_input(input, own_vote).await,
                    None => return None,
                },
                _ = poll.tick() => self.repoll(own_vote).await,
                () = sleep_until(deadline) => {
                    info!(
                        positive = self.tally.positive(),
                        negative = self.tally.negative(),
                        "election timed out"
                    );
                    return None;
                }
            }
        }
    }

    /// The decision the tally supports under the current thresholds.
    ///
    /// A node whose own check failed never approves.
    async fn decide(&self, own_opinion: Opinion) -> Option<Opinion> {
        let thresholds = self.node.thresholds().await;
        let lead = match self.tally.positive().cmp(&self.tally.negative()) {
            std::cmp::Ordering::Greater => ElectionState::PositiveLead,
            std::cmp::Ordering::Less => ElectionState::NegativeLead,
            std::cmp::Ordering::Equal => ElectionState::Collecting,
        };
        self.state.send_if_modified(|state| {
            let changed = *state != lead;
            *state = lead;
            changed
        });
        match self.tally.decide(&thresholds) {
            Some(Opinion::Positive) if own_opinion == Opinion::Negative => None,
            decision => decision,
        }
    }

    /// Count a peer's vote, answering it with ours if asked
    async fn on_input(&mut self, input: ElectionInput, own_vote: &Vote) {
        match input {
            ElectionInput::Request(vote) => {
                let voter = vote.voter;
                self.count(&vote);
                self.node
                    .send(voter, MessageKind::Vote(own_vote.clone()))
                    .await;
            }
            ElectionInput::Vote(vote) => self.count(&vote),
        }
    }

    /// Add a vote to the tally
    fn count(&mut self, vote: &Vote) {
        if self.tally.add(vote) {
            trace!(
                voter = %vote.voter,
                opinion = ?vote.opinion,
                positive = self.tally.positive(),
                negative = self.tally.negative(),
                "vote counted"
            );
        }
    }

    /// Ask again every peer that has not answered
    async fn repoll(&self, own_vote: &Vote) {
        let silent: Vec<NodeId> = self
            .node
            .network
            .peers()
            .into_iter()
            .filter(|peer| self.tally.opinion_of(peer).is_none())
            .collect();
        trace!(silent = silent.len(), "re-requesting votes");
        for peer in silent {
            self.request_vote(peer, own_vote).await;
        }
    }

    /// Send a vote request to one peer
    async fn request_vote(&self, peer: NodeId, own_vote: &Vote) {
        self.node
            .send(
                peer,
                MessageKind::VoteRequest {
                    item: Arc::clone(&self.item),
                    vote: own_vote.clone(),
                },
            )
            .await;
    }

    /// Keep telling peers the decision until all of them agree or
    /// `max_consensus_received_check_time` elapses. The decision itself no longer changes.
    async fn announce(&mut self, final_vote: Vote) {
        let config = Arc::clone(&self.node.config);
        let start = Instant::now();
        let until = start + config.max_consensus_received_check_time;
        let mut check = interval_at(
            start + config.consensus_received_check_time,
            config.consensus_received_check_time,
        );
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let lagging: Vec<NodeId> = self
                .node
                .network
                .peers()
                .into_iter()
                .filter(|peer| self.tally.opinion_of(peer) != Some(final_vote.opinion))
                .collect();
            if lagging.is_empty() {
                debug!("every peer reported the decision");
                return;
            }
            select! {
                input = self.inputs.recv() => match input {
                    Some(input) => self.on_input(input, &final_vote).await,
                    None => return,
                },
                _ = check.tick() => {
                    for peer in lagging {
                        self.request_vote(peer, &final_vote).await;
                    }
                }
                () = sleep_until(until) => {
                    debug!("peers still lagging at the end of the announce window");
                    return;
                }
            }
        }
    }

    /// Commit approval: the item and its new items become `APPROVED`, revoked items `REVOKED`,
    /// all in one write
    async fn approve(&self, check: &LocalCheck) -> LedgerResult {
        let ledger = &self.node.ledger;
        let config = &self.node.config;
        let now = Utc::now();
        let mut changes = Vec::new();
        let mut published = vec![(self.id, ItemState::Approved)];

        let record = ledger
            .get_record(&self.id)
            .await?
            .unwrap_or_else(|| StateRecord::pending(self.id));
        changes.push(RecordChange::Save(with_state(
            record,
            ItemState::Approved,
            self.item.expires_at(),
        )));

        for id in &check.revoke_locks {
            let record = ledger
                .get_record(id)
                .await?
                .unwrap_or_else(|| StateRecord::pending(*id));
            changes.push(RecordChange::Save(with_state(
                record,
                ItemState::Revoked,
                expiry_after(now, config.revoked_item_expiration),
            )));
            published.push((*id, ItemState::Revoked));
        }

        for new_item in self.item.new_items() {
            let id = new_item.id();
            if !check.creation_locks.contains(&id) {
                continue;
            }
            let record = ledger
                .get_record(&id)
                .await?
                .unwrap_or_else(|| StateRecord::pending(id));
            changes.push(RecordChange::Save(with_state(
                record,
                ItemState::Approved,
                new_item.expires_at(),
            )));
            published.push((id, ItemState::Approved));
        }

        ledger.commit(changes).await?;
        info!(
            revoked = check.revoke_locks.len(),
            created = check.creation_locks.len(),
            "item approved"
        );
        for (id, state) in published {
            self.node.publish(id, state);
        }
        Ok(())
    }

    /// Commit a decline, releasing every hold the item took
    async fn decline(&self, check: &LocalCheck) -> LedgerResult {
        self.node.release(&self.id, check).await?;
        let record = self
            .node
            .ledger
            .get_record(&self.id)
            .await?
            .unwrap_or_else(|| StateRecord::pending(self.id));
        let expires_at = expiry_after(Utc::now(), self.node.config.declined_item_expiration);
        self.node
            .ledger
            .save(&with_state(record, ItemState::Declined, expires_at))
            .await?;
        info!("item declined");
        self.node.publish(self.id, ItemState::Declined);
        Ok(())
    }

    /// Leave the item `PENDING` after a timeout, releasing every hold it took
    async fn give_up(&self, check: &LocalCheck) -> LedgerResult {
        self.node.release(&self.id, check).await?;
        let record = self
            .node
            .ledger
            .get_record(&self.id)
            .await?
            .unwrap_or_else(|| StateRecord::pending(self.id));
        self.node
            .ledger
            .save(&with_state(record, ItemState::Pending, None))
            .await?;
        self.node.publish(self.id, ItemState::Pending);
        Ok(())
    }

    /// The phase implied by a state found in the ledger at start
    fn settled_state(&self, state: ItemState) -> ElectionState {
        let phase = match state {
            ItemState::Approved | ItemState::Revoked | ItemState::Locked => {
                ElectionState::DecidedApproved
            }
            ItemState::Declined => ElectionState::DecidedDeclined,
            _ => ElectionState::DecidedUndefinedTimeout,
        };
        self.state.send_replace(phase);
        phase
    }
}

impl<I: NodeImplementation> Node<I> {
    /// Check an item against this node's ledger and take the holds approving it would need.
    ///
    /// On any failure every hold taken is released again, so the result holds locks only when
    /// the opinion is positive.
    pub(crate) async fn form_opinion(
        self: &Arc<Self>,
        item: &Arc<dyn Item>,
    ) -> LedgerResult<LocalCheck> {
        let id = item.id();
        let name = id.to_string();
        let mut check = LocalCheck::default();

        if let Err(errors) = item.self_check() {
            check.errors.extend(errors);
        }
        let now = Utc::now();
        if let Some(created_at) = item.created_at() {
            if expiry_after(created_at, self.config.max_item_creation_age)
                .is_some_and(|limit| limit < now)
            {
                check.errors.push(ErrorRecord::new(
                    ErrorCode::Expired,
                    name.clone(),
                    "item was created too long ago",
                ));
            }
        }
        if item.expires_at().is_some_and(|expires_at| expires_at <= now) {
            check.errors.push(ErrorRecord::new(
                ErrorCode::Expired,
                name.clone(),
                "item has expired",
            ));
        }

        let referenced = item.referenced_item_ids();
        let revoking = item.revoking_items();
        let sub_items: Vec<HashId> = referenced.iter().chain(&revoking).copied().collect();
        self.resync_unknown_sub_items(&sub_items).await?;

        for reference in &referenced {
            match self.ledger.get_record(reference).await? {
                Some(record) if record.state.is_approved() => {}
                Some(record) => check.errors.push(ErrorRecord::new(
                    ErrorCode::BadRef,
                    reference.to_string(),
                    format!("referenced item is {}", record.state),
                )),
                None => check.errors.push(ErrorRecord::new(
                    ErrorCode::BadRef,
                    reference.to_string(),
                    "referenced item is unknown",
                )),
            }
        }

        if check.errors.is_empty() {
            for revoked in &revoking {
                if self.ledger.lock_to_revoke(revoked, &id).await?.is_some() {
                    check.revoke_locks.push(*revoked);
                    continue;
                }
                let state = self
                    .ledger
                    .get_record(revoked)
                    .await?
                    .map_or(ItemState::Undefined, |record| record.state);
                check.errors.push(ErrorRecord::new(
                    ErrorCode::BadRevoke,
                    revoked.to_string(),
                    format!("cannot revoke an item that is {state}"),
                ));
                break;
            }
        }

        if check.errors.is_empty() {
            for new_item in item.new_items() {
                let new_id = new_item.id();
                if let Err(errors) = new_item.self_check() {
                    check.errors.push(ErrorRecord::new(
                        ErrorCode::BadNewItem,
                        new_id.to_string(),
                        format!("new item failed its check with {} errors", errors.len()),
                    ));
                    check.errors.extend(errors);
                    break;
                }
                if self.ledger.create_output_lock(&new_id, &id).await?.is_some() {
                    check.creation_locks.push(new_id);
                } else {
                    check.errors.push(ErrorRecord::new(
                        ErrorCode::NewItemExists,
                        new_id.to_string(),
                        "new item already exists",
                    ));
                    break;
                }
            }
        }

        if !check.errors.is_empty() {
            self.release(&id, &check).await?;
            check.revoke_locks.clear();
            check.creation_locks.clear();
        }
        Ok(check)
    }

    /// Release every hold `locker` took
    pub(crate) async fn release(&self, locker: &HashId, check: &LocalCheck) -> LedgerResult {
        for id in check.revoke_locks.iter().chain(&check.creation_locks) {
            self.ledger.unlock(id, locker).await?;
        }
        if !check.revoke_locks.is_empty() || !check.creation_locks.is_empty() {
            trace!(
                revoke_locks = check.revoke_locks.len(),
                creation_locks = check.creation_locks.len(),
                "holds released"
            );
        }
        Ok(())
    }
}
