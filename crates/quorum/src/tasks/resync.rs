//! Recovery of an item's decided state from peers
//!
//! A resync does not vote. It asks every peer what its ledger says about the item and adopts a
//! terminal state once `resync_break_consensus` peers report the same one. For an item the node
//! holds a copy of, the unresolved items it revokes or creates are resynced too, and the item
//! itself is only settled once enough of them resolved.

use std::{fmt, sync::Arc};

use chrono::Utc;
use quorum_types::{
    data::{HashId, NodeId, StateRecord},
    item_state::ItemState,
    message::MessageKind,
    traits::{
        ledger::{Ledger, LedgerResult},
        network::ConnectedNetwork,
        node_implementation::NodeImplementation,
    },
};
use tokio::{
    select, spawn,
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
        watch,
    },
    task::AbortHandle,
    time::{interval_at, sleep_until, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, trace};

use crate::{expiry_after, tally::ResyncTally, with_state, Node};

/// How a resync concluded
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResyncOutcome {
    /// Peers agree the item is approved
    Approved,
    /// Peers agree the item is declined
    Declined,
    /// Peers agree the item is revoked
    Revoked,
    /// Every peer answered but no state reached the break quorum
    Pending,
    /// Not enough peers answered in time
    Timeout,
}

impl ResyncOutcome {
    /// The outcome adopting `state`, if it is a terminal state
    #[must_use]
    pub fn adopting(state: ItemState) -> Option<Self> {
        match state {
            ItemState::Approved => Some(ResyncOutcome::Approved),
            ItemState::Declined => Some(ResyncOutcome::Declined),
            ItemState::Revoked => Some(ResyncOutcome::Revoked),
            _ => None,
        }
    }

    /// The state the local record is left in
    #[must_use]
    pub fn state(self) -> ItemState {
        match self {
            ResyncOutcome::Approved => ItemState::Approved,
            ResyncOutcome::Declined => ItemState::Declined,
            ResyncOutcome::Revoked => ItemState::Revoked,
            ResyncOutcome::Pending | ResyncOutcome::Timeout => ItemState::Pending,
        }
    }

    /// Whether a terminal state was adopted
    #[must_use]
    pub fn is_resolved(self) -> bool {
        self.state().is_consensus_found()
    }
}

impl fmt::Display for ResyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResyncOutcome::Approved => "RESYNC_APPROVED",
            ResyncOutcome::Declined => "RESYNC_DECLINED",
            ResyncOutcome::Revoked => "RESYNC_REVOKED",
            ResyncOutcome::Pending => "RESYNC_PENDING",
            ResyncOutcome::Timeout => "RESYNC_TIMEOUT",
        };
        f.write_str(name)
    }
}

/// What happens to the local record when a resync fails
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ResyncMode {
    /// Requested by a caller: the record stays `PENDING`
    Explicit,
    /// Started while checking another item: the record goes back to what it was
    Probe,
}

/// The node's handle on a resync in flight
#[derive(Debug)]
pub(crate) struct ResyncHandle {
    /// Feeds peer replies to the resync task
    replies: UnboundedSender<(NodeId, ItemState)>,
    /// Set once the resync concluded
    outcome: watch::Receiver<Option<ResyncOutcome>>,
    /// Aborts the resync task
    task: AbortHandle,
}

impl ResyncHandle {
    /// Wrap the parts of a freshly spawned resync
    pub(crate) fn new(
        replies: UnboundedSender<(NodeId, ItemState)>,
        outcome: watch::Receiver<Option<ResyncOutcome>>,
        task: AbortHandle,
    ) -> Self {
        Self {
            replies,
            outcome,
            task,
        }
    }

    /// Hand a peer's reply to the resync
    pub(crate) fn deliver(&self, peer: NodeId, state: ItemState) {
        let _ = self.replies.send((peer, state));
    }

    /// A receiver for the outcome
    pub(crate) fn outcome(&self) -> watch::Receiver<Option<ResyncOutcome>> {
        self.outcome.clone()
    }

    /// Stop the resync task
    pub(crate) fn abort(&self) {
        self.task.abort();
    }
}

/// Run the resync of `id` until it concludes
pub(crate) async fn run<I: NodeImplementation>(
    node: Arc<Node<I>>,
    id: HashId,
    mode: ResyncMode,
    mut replies: UnboundedReceiver<(NodeId, ItemState)>,
    outcome: watch::Sender<Option<ResyncOutcome>>,
) {
    let result = match resync(&node, id, mode, &mut replies).await {
        Ok(result) => {
            info!(%result, "resync finished");
            Some(result)
        }
        Err(error) => {
            error!(%error, "resync aborted by ledger failure");
            None
        }
    };
    // a failed resync is reported to waiters as timed out
    outcome.send_replace(Some(result.unwrap_or(ResyncOutcome::Timeout)));
    node.resyncs.remove(&id);
}

/// Gather peer states, settle the record and report the outcome
async fn resync<I: NodeImplementation>(
    node: &Arc<Node<I>>,
    id: HashId,
    mode: ResyncMode,
    replies: &mut UnboundedReceiver<(NodeId, ItemState)>,
) -> LedgerResult<ResyncOutcome> {
    let prior = node.ledger.get_record(&id).await?;
    if prior.is_none() {
        node.ledger.find_or_create(id).await?;
    }

    let mut children = start_sub_item_resyncs(node, &id, mode).await?;
    let peers = node.network.peers();
    let config = Arc::clone(&node.config);
    let start = Instant::now();
    let deadline = start + config.max_resync_time;
    let mut poll = interval_at(start + config.resync_time, config.resync_time);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    node.broadcast(MessageKind::StateQuery { item_id: id }).await;

    let mut tally = ResyncTally::default();
    let mut agreed = None;
    let outcome = loop {
        if agreed.is_none() {
            let thresholds = node.thresholds().await;
            agreed = tally.agreed_state(thresholds.resync_break_consensus);
        }
        match agreed {
            Some(state) if children.is_settled() => {
                break ResyncOutcome::adopting(state).unwrap_or(ResyncOutcome::Pending);
            }
            None if tally.responders() >= peers.len() => {
                debug!(responders = tally.responders(), "no break quorum among peers");
                break ResyncOutcome::Pending;
            }
            _ => {}
        }
        if children.cannot_settle() {
            debug!("too few sub-items resolved");
            break ResyncOutcome::Pending;
        }
        select! {
            reply = replies.recv() => match reply {
                Some((peer, state)) => {
                    trace!(%peer, %state, "state reported");
                    tally.add(peer, state);
                }
                None => break ResyncOutcome::Timeout,
            },
            child = children.outcomes.recv(), if children.waiting() => {
                children.record(child.flatten());
            }
            _ = poll.tick() => {
                for peer in peers.iter().filter(|peer| !tally.has_replied(peer)) {
                    node.send(*peer, MessageKind::StateQuery { item_id: id }).await;
                }
            }
            () = sleep_until(deadline) => break ResyncOutcome::Timeout,
        }
    };

    settle(node, id, mode, prior, outcome).await?;
    Ok(outcome)
}

/// Write the outcome to the ledger
async fn settle<I: NodeImplementation>(
    node: &Node<I>,
    id: HashId,
    mode: ResyncMode,
    prior: Option<StateRecord>,
    outcome: ResyncOutcome,
) -> LedgerResult {
    let now = Utc::now();
    let record = node
        .ledger
        .get_record(&id)
        .await?
        .unwrap_or_else(|| StateRecord::pending(id));
    let state = outcome.state();
    match outcome {
        ResyncOutcome::Approved => {
            let expires_at = node.cache.get(&id).and_then(|item| item.expires_at());
            node.ledger
                .save(&with_state(record, state, expires_at))
                .await?;
        }
        ResyncOutcome::Declined => {
            let expires_at = expiry_after(now, node.config.declined_item_expiration);
            node.ledger
                .save(&with_state(record, state, expires_at))
                .await?;
        }
        ResyncOutcome::Revoked => {
            let expires_at = expiry_after(now, node.config.revoked_item_expiration);
            node.ledger
                .save(&with_state(record, state, expires_at))
                .await?;
        }
        ResyncOutcome::Pending | ResyncOutcome::Timeout => match (mode, prior) {
            (ResyncMode::Explicit, _) => {
                node.ledger
                    .save(&with_state(record, ItemState::Pending, None))
                    .await?;
            }
            (ResyncMode::Probe, Some(prior)) => {
                node.ledger.save(&prior).await?;
                node.publish(id, prior.state);
                return Ok(());
            }
            (ResyncMode::Probe, None) => {
                node.ledger.destroy(&id).await?;
                node.publish(id, ItemState::Undefined);
                return Ok(());
            }
        },
    }
    node.publish(id, state);
    Ok(())
}

/// Resyncs of the sub-items of the item being resynced
struct SubItemResyncs {
    /// Sub-items that must resolve before the item is settled
    needed: usize,
    /// Sub-item resyncs started
    started: usize,
    /// Sub-item resyncs concluded
    finished: usize,
    /// Sub-item resyncs that adopted a terminal state
    resolved: usize,
    /// Outcomes of the sub-item resyncs, as they conclude
    outcomes: UnboundedReceiver<Option<ResyncOutcome>>,
}

impl SubItemResyncs {
    /// Whether enough sub-items resolved
    fn is_settled(&self) -> bool {
        self.resolved >= self.needed
    }

    /// Whether some sub-item resync is still running
    fn waiting(&self) -> bool {
        self.finished < self.started
    }

    /// Whether every sub-item resync concluded without enough of them resolving
    fn cannot_settle(&self) -> bool {
        !self.waiting() && !self.is_settled()
    }

    /// Count a concluded sub-item resync
    fn record(&mut self, outcome: Option<ResyncOutcome>) {
        self.finished += 1;
        if outcome.is_some_and(ResyncOutcome::is_resolved) {
            self.resolved += 1;
        }
    }
}

/// Start resyncs for the unresolved items the item revokes or creates, if the node has a copy
/// of the item
async fn start_sub_item_resyncs<I: NodeImplementation>(
    node: &Arc<Node<I>>,
    id: &HashId,
    mode: ResyncMode,
) -> LedgerResult<SubItemResyncs> {
    let (sender, outcomes) = unbounded_channel();
    let mut children = SubItemResyncs {
        needed: 0,
        started: 0,
        finished: 0,
        resolved: 0,
        outcomes,
    };
    let Some(item) = node.cache.get(id) else {
        return Ok(children);
    };

    let new_items = item.new_items();
    let sub_items = item
        .revoking_items()
        .into_iter()
        .chain(new_items.iter().map(|new_item| new_item.id()));
    for sub_item in sub_items {
        if node.is_voting(&sub_item) {
            continue;
        }
        let unresolved = node
            .ledger
            .get_record(&sub_item)
            .await?
            .map_or(true, |record| record.state.is_pending());
        if !unresolved {
            continue;
        }
        if mode == ResyncMode::Explicit {
            if let Err(error) = node.mark_pending(sub_item).await {
                debug!(%sub_item, %error, "sub-item not resynced");
                continue;
            }
        }
        let mut outcome = node.start_resync(sub_item, mode);
        let sender = sender.clone();
        spawn(async move {
            let concluded = outcome.wait_for(Option::is_some).await.ok().and_then(|o| *o);
            let _ = sender.send(concluded);
        });
        children.started += 1;
    }
    children.needed = node.config.known_sub_contracts_to_resync.min(children.started);
    if children.started > 0 {
        debug!(
            started = children.started,
            needed = children.needed,
            "resyncing sub-items"
        );
    }
    Ok(children)
}
