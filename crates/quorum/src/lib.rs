//! Provides a generic rust implementation of a quorum-threshold ledger consensus node
//!
//! A [`Node`] accepts items, runs one [election](tasks::election) per item against its peers and
//! records the outcome in its [`Ledger`](traits::Ledger). Nodes that missed an outcome recover it
//! with a [resync](tasks::resync).

/// Contains traits consumed by [`Node`] and their in-memory implementations
pub mod traits;

pub mod tally;
pub mod tasks;

mod cache;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_broadcast::{broadcast, InactiveReceiver, RecvError, Sender};
use async_lock::{Mutex, RwLock};
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
pub use quorum_types as types;
use quorum_types::{
    constants::EVENT_CHANNEL_SIZE,
    data::{ErrorCode, ErrorRecord, HashId, ItemResult, NodeId, Opinion, StateRecord, Vote},
    error::NodeError,
    event::Event,
    item_state::ItemState,
    message::{Message, MessageKind},
    traits::{
        item::Item,
        ledger::{Ledger, LedgerResult, RecordHandle},
        network::ConnectedNetwork,
        node_implementation::NodeImplementation,
    },
    ConsensusThresholds, NodeConfig,
};
use tokio::{
    spawn,
    sync::{mpsc::unbounded_channel, watch},
    task::JoinHandle,
    time::{timeout, Instant},
};
use tracing::{debug, error, info, info_span, instrument, trace, warn, Instrument};

use crate::{
    cache::ItemCache,
    tasks::{
        election::{ElectionHandle, ElectionInput, ElectionState},
        resync::{ResyncHandle, ResyncMode, ResyncOutcome},
    },
};

/// Holds the state needed to participate in consensus on items
///
/// Created with [`Node::new`], which validates the configuration against the size of the
/// network, and brought online with [`Node::start`].
pub struct Node<I: NodeImplementation> {
    /// This node's id
    id: NodeId,

    /// Configuration items for this node
    config: Arc<NodeConfig>,

    /// Current thresholds; write-locked only to reconfigure
    thresholds: RwLock<ConsensusThresholds>,

    /// The ledger holding the state of every item
    ledger: Arc<I::Ledger>,

    /// Connection to the other nodes
    network: Arc<I::Network>,

    /// Elections in flight, at most one per item
    elections: DashMap<HashId, ElectionHandle>,

    /// Resyncs in flight, at most one per item
    resyncs: DashMap<HashId, ResyncHandle>,

    /// Items seen recently
    cache: ItemCache,

    /// Item state changes, in the order they were written
    event_stream: (Sender<Event>, InactiveReceiver<Event>),

    /// Task draining the network
    dispatch_task: Mutex<Option<JoinHandle<()>>>,

    /// Set once [`Node::shut_down`] was called
    shut_down: AtomicBool,
}

impl<I: NodeImplementation> Node<I> {
    /// Creates a new [`Node`] with the given configuration options.
    ///
    /// # Errors
    /// [`NodeError::InvalidConfig`] if the configuration cannot work for a network of the size
    /// `network` reports
    pub fn new(
        id: NodeId,
        config: NodeConfig,
        ledger: Arc<I::Ledger>,
        network: Arc<I::Network>,
    ) -> Result<Arc<Self>, NodeError> {
        config.validate(network.peers().len() + 1)?;
        let (mut sender, receiver) = broadcast(EVENT_CHANNEL_SIZE);
        sender.set_overflow(true);
        sender.set_await_active(false);

        Ok(Arc::new(Self {
            id,
            thresholds: RwLock::new(config.thresholds),
            cache: ItemCache::new(config.max_cache_age),
            config: Arc::new(config),
            ledger,
            network,
            elections: DashMap::new(),
            resyncs: DashMap::new(),
            event_stream: (sender, receiver.deactivate()),
            dispatch_task: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }))
    }

    /// Start answering peers. Calling this again has no effect.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.dispatch_task.lock().await;
        if task.is_some() {
            return;
        }
        let node = Arc::clone(self);
        *task = Some(spawn(
            async move { node.run_dispatch().await }
                .instrument(info_span!("dispatch", node = %self.id)),
        ));
    }

    /// This node's id
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The configuration this node was started with
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The ledger of this node
    #[must_use]
    pub fn ledger(&self) -> &Arc<I::Ledger> {
        &self.ledger
    }

    /// The thresholds elections are currently decided with
    pub async fn thresholds(&self) -> ConsensusThresholds {
        *self.thresholds.read().await
    }

    /// Submit an item for approval.
    ///
    /// Returns at once with the item's current result; use [`wait_item`](Self::wait_item) for
    /// the outcome. An item that already reached a terminal state is not voted on again, and a
    /// second registration of an item in flight joins the running election.
    ///
    /// # Errors
    /// If the ledger fails or the node was shut down
    #[instrument(skip_all, fields(node = %self.id, item = %item.id()))]
    pub async fn register_item(
        self: &Arc<Self>,
        item: Arc<dyn Item>,
    ) -> Result<ItemResult, NodeError> {
        self.ensure_running()?;
        let id = item.id();
        self.cache.put(Arc::clone(&item));
        let record = self.ledger.find_or_create(id).await?;

        if record.state.is_consensus_found() {
            debug!(state = %record.state, "item already decided");
        } else if record.state.is_locked() {
            let error = ErrorRecord::new(
                ErrorCode::BadState,
                id.to_string(),
                format!("item is {} by another item", record.state),
            );
            return Ok(ItemResult::from_record(&record, true).with_errors(vec![error]));
        } else if self.resyncs.contains_key(&id) {
            debug!("item is being resynced, not starting an election");
        } else if self.start_election(item, None) {
            info!("election started");
        }
        self.check_item(&id).await
    }

    /// Current result of an item, without waiting
    ///
    /// # Errors
    /// If the ledger fails
    pub async fn check_item(&self, id: &HashId) -> Result<ItemResult, NodeError> {
        let have_copy = self.cache.contains(id);
        let errors = self.cache.errors(id);
        let result = match self.ledger.get_record(id).await? {
            Some(record) => ItemResult::from_record(&record, have_copy),
            None => ItemResult {
                have_copy,
                ..ItemResult::undefined()
            },
        };
        Ok(result.with_errors(errors))
    }

    /// Wait until the item reaches a terminal state or `max_wait` elapses.
    ///
    /// On timeout the last known, possibly non-terminal, result is returned. A `max_wait` too
    /// large to represent waits for the terminal state. Abandoning the wait does not affect the
    /// election.
    ///
    /// # Errors
    /// If the ledger fails
    #[instrument(skip(self), fields(node = %self.id))]
    pub async fn wait_item(&self, id: &HashId, max_wait: Duration) -> Result<ItemResult, NodeError> {
        let deadline = Instant::now().checked_add(max_wait);
        let mut events = self.event_stream.1.activate_cloned();
        loop {
            let result = self.check_item(id).await?;
            let now = Instant::now();
            if result.state.is_consensus_found() || deadline.is_some_and(|deadline| now >= deadline)
            {
                return Ok(result);
            }
            let wake_after = deadline.map_or(self.config.check_item_time, |deadline| {
                self.config
                    .check_item_time
                    .min(deadline.saturating_duration_since(now))
            });
            // either a change of this item or the periodic re-read sends us back to the ledger
            let _ = timeout(wake_after, async {
                loop {
                    match events.recv().await {
                        Ok(event) if event.item_id == *id => break,
                        Ok(_) => {}
                        Err(RecvError::Overflowed(missed)) => {
                            trace!(missed, "event stream overflowed");
                            break;
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            })
            .await;
        }
    }

    /// Recover the state of an item from peers.
    ///
    /// The local record is set to `PENDING` at once. Does nothing if a resync of the item is
    /// already running, or if the node is still voting on it. An election that is only
    /// announcing its decision does not hold the resync back.
    ///
    /// # Errors
    /// If the ledger fails, if the record is held by another item, or if the node was shut down
    #[instrument(skip(self), fields(node = %self.id))]
    pub async fn resync(self: &Arc<Self>, id: HashId) -> Result<(), NodeError> {
        self.ensure_running()?;
        if self.is_voting(&id) {
            debug!("election in flight, resync skipped");
            return Ok(());
        }
        if self.resyncs.contains_key(&id) {
            return Ok(());
        }
        self.mark_pending(id).await?;
        self.start_resync(id, ResyncMode::Explicit);
        Ok(())
    }

    /// The cached copy of an item, if this node has one
    #[must_use]
    pub fn get_item(&self, id: &HashId) -> Option<Arc<dyn Item>> {
        self.cache.get(id)
    }

    /// Phase of the election of an item, if one is in flight
    #[must_use]
    pub fn election_state(&self, id: &HashId) -> Option<ElectionState> {
        self.elections.get(id).map(|handle| handle.state())
    }

    /// Whether an election of the item is still collecting votes
    fn is_voting(&self, id: &HashId) -> bool {
        self.elections
            .get(id)
            .is_some_and(|handle| !handle.state().is_decided())
    }

    /// Number of elections in flight
    #[must_use]
    pub fn count_elections(&self) -> usize {
        self.elections.len()
    }

    /// Number of resyncs in flight
    #[must_use]
    pub fn count_resyncs(&self) -> usize {
        self.resyncs.len()
    }

    /// Recompute the consensus thresholds for a network of `nodes_count` nodes.
    ///
    /// Elections read the thresholds at every check, so the change applies to undecided elections
    /// only.
    ///
    /// # Errors
    /// [`NodeError::InvalidConfig`] if no thresholds fit
    pub async fn update_consensus_config(&self, nodes_count: usize) -> Result<(), NodeError> {
        let thresholds = ConsensusThresholds::for_network_size(nodes_count);
        thresholds.validate(nodes_count)?;
        *self.thresholds.write().await = thresholds;
        info!(node = %self.id, ?thresholds, "consensus thresholds updated");
        Ok(())
    }

    /// Purge expired ledger records and cached items, returning how many records were purged
    ///
    /// # Errors
    /// If the ledger fails
    pub async fn cleanup_ledger(&self) -> Result<usize, NodeError> {
        let purged_items = self.cache.purge();
        let purged = self.ledger.cleanup(Utc::now()).await?;
        debug!(node = %self.id, purged, purged_items, "ledger cleaned up");
        Ok(purged)
    }

    /// Stop the node: close the network and abort every election and resync
    pub async fn shut_down(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(node = %self.id, "shutting down");
        self.network.shut_down().await;
        if let Some(task) = self.dispatch_task.lock().await.take() {
            task.abort();
        }
        for election in &self.elections {
            election.abort();
        }
        self.elections.clear();
        for resync in &self.resyncs {
            resync.abort();
        }
        self.resyncs.clear();
    }

    /// Fail if the node was shut down
    fn ensure_running(&self) -> Result<(), NodeError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(NodeError::ShutDown);
        }
        Ok(())
    }

    /// Start an election unless one is running, in which case `input` is handed to it.
    ///
    /// Returns whether a new election was started.
    fn start_election(self: &Arc<Self>, item: Arc<dyn Item>, input: Option<ElectionInput>) -> bool {
        match self.elections.entry(item.id()) {
            Entry::Occupied(running) => {
                if let Some(input) = input {
                    running.get().deliver(input);
                }
                false
            }
            Entry::Vacant(slot) => {
                let (inputs, receiver) = unbounded_channel();
                if let Some(input) = input {
                    // cannot fail, the receiver is right here
                    let _ = inputs.send(input);
                }
                let (state, state_receiver) = watch::channel(ElectionState::Collecting);
                let span = info_span!("election", node = %self.id, item = %item.id());
                let task = spawn(
                    tasks::election::run(Arc::clone(self), item, receiver, state).instrument(span),
                );
                slot.insert(ElectionHandle::new(
                    inputs,
                    state_receiver,
                    task.abort_handle(),
                ));
                true
            }
        }
    }

    /// Start a resync unless one is running. Either way, returns a receiver for its outcome.
    fn start_resync(
        self: &Arc<Self>,
        id: HashId,
        mode: ResyncMode,
    ) -> watch::Receiver<Option<ResyncOutcome>> {
        match self.resyncs.entry(id) {
            Entry::Occupied(running) => running.get().outcome(),
            Entry::Vacant(slot) => {
                let (replies, receiver) = unbounded_channel();
                let (outcome, outcome_receiver) = watch::channel(None);
                let span = info_span!("resync", node = %self.id, item = %id, ?mode);
                let task = spawn(
                    tasks::resync::run(Arc::clone(self), id, mode, receiver, outcome)
                        .instrument(span),
                );
                slot.insert(ResyncHandle::new(
                    replies,
                    outcome_receiver.clone(),
                    task.abort_handle(),
                ));
                outcome_receiver
            }
        }
    }

    /// Make sure the item has a `PENDING` record
    async fn mark_pending(&self, id: HashId) -> Result<(), NodeError> {
        let mut handle = RecordHandle::find_or_create(&self.ledger, id).await?;
        let state = handle.state();
        if state.is_locked() {
            return Err(NodeError::BadItemState {
                id,
                state,
                operation: "resynced",
            });
        }
        if state != ItemState::Pending {
            handle.set_state(ItemState::Pending).set_expires_at(None);
            handle.save().await?;
        }
        self.publish(id, ItemState::Pending);
        Ok(())
    }

    /// Announce a state change written to the ledger
    fn publish(&self, item_id: HashId, state: ItemState) {
        // no active receiver means nobody is waiting
        let _ = self.event_stream.0.try_broadcast(Event { item_id, state });
    }

    /// Send a message to one peer. Delivery is best effort.
    async fn send(&self, recipient: NodeId, kind: MessageKind) {
        let message = Message {
            sender: self.id,
            kind,
        };
        if let Err(error) = self.network.direct_message(message, recipient).await {
            debug!(%recipient, %error, "message not delivered");
        }
    }

    /// Send a message to every peer. Delivery is best effort.
    async fn broadcast(&self, kind: MessageKind) {
        let message = Message {
            sender: self.id,
            kind,
        };
        if let Err(error) = self.network.broadcast_message(message).await {
            warn!(%error, "broadcast failed");
        }
    }

    /// Handle incoming messages until the network shuts down
    async fn run_dispatch(self: Arc<Self>) {
        debug!("dispatch started");
        while let Ok(message) = self.network.recv_message().await {
            trace!(sender = %message.sender, kind = ?message.kind, "received");
            if let Err(error) = self.handle_message(message).await {
                error!(%error, "failed to handle message");
            }
        }
        debug!("dispatch stopped");
    }

    /// Route one message to the election or resync it belongs to, or answer it from the ledger
    async fn handle_message(self: &Arc<Self>, message: Message) -> Result<(), NodeError> {
        let Message { sender, kind } = message;
        match kind {
            MessageKind::VoteRequest { item, vote } => {
                if vote.voter != sender || item.id() != vote.item_id {
                    warn!(%sender, "dropping malformed vote request");
                    return Ok(());
                }
                self.on_vote_request(item, vote).await
            }
            MessageKind::Vote(vote) => {
                if vote.voter != sender {
                    warn!(%sender, "dropping vote cast on behalf of another node");
                } else if let Some(election) = self.elections.get(&vote.item_id) {
                    election.deliver(ElectionInput::Vote(vote));
                } else {
                    trace!(item = %vote.item_id, "late vote ignored");
                }
                Ok(())
            }
            MessageKind::StateQuery { item_id } => {
                let state = self
                    .ledger
                    .get_record(&item_id)
                    .await?
                    .map_or(ItemState::Undefined, |record| record.state);
                self.send(sender, MessageKind::StateReply { item_id, state })
                    .await;
                Ok(())
            }
            MessageKind::StateReply { item_id, state } => {
                if let Some(resync) = self.resyncs.get(&item_id) {
                    resync.deliver(sender, state);
                } else {
                    trace!(item = %item_id, "late state reply ignored");
                }
                Ok(())
            }
        }
    }

    /// A peer asks for our vote on an item
    async fn on_vote_request(self: &Arc<Self>, item: Arc<dyn Item>, vote: Vote) -> Result<(), NodeError> {
        let id = vote.item_id;
        if let Some(election) = self.elections.get(&id) {
            election.deliver(ElectionInput::Request(vote));
            return Ok(());
        }
        self.cache.put(Arc::clone(&item));
        if let Some(record) = self.ledger.get_record(&id).await? {
            if record.state.is_consensus_found() || record.state.is_locked() {
                // decided here already: answer from the ledger
                let opinion = match record.state {
                    ItemState::Locked => Some(Opinion::Positive),
                    state => Opinion::from_state(state),
                };
                if let Some(opinion) = opinion {
                    self.send(
                        vote.voter,
                        MessageKind::Vote(Vote::new(id, self.id, opinion)),
                    )
                    .await;
                }
                return Ok(());
            }
        }
        if self.resyncs.contains_key(&id) {
            trace!(item = %id, "vote request during resync ignored");
            return Ok(());
        }
        if self.start_election(item, Some(ElectionInput::Request(vote))) {
            debug!(item = %id, "election started on peer request");
        }
        Ok(())
    }

    /// Resync sub-items this node has no record of, provided it knows enough of the others.
    ///
    /// Waits until every started resync concluded. Resyncs started here restore the previous
    /// state when they fail.
    async fn resync_unknown_sub_items(self: &Arc<Self>, sub_items: &[HashId]) -> LedgerResult {
        let mut unknown = Vec::new();
        for id in sub_items {
            if self.ledger.get_record(id).await?.is_none() {
                unknown.push(*id);
            }
        }
        let known = sub_items.len() - unknown.len();
        if unknown.is_empty() || known < self.config.known_sub_contracts_to_resync {
            return Ok(());
        }
        debug!(count = unknown.len(), "resyncing unknown sub-items");
        let waits = unknown.into_iter().map(|id| {
            let mut outcome = self.start_resync(id, ResyncMode::Probe);
            async move {
                let _ = outcome.wait_for(Option::is_some).await;
            }
        });
        futures::future::join_all(waits).await;
        Ok(())
    }
}

/// The point in time `after` past `from`, if representable
pub(crate) fn expiry_after(from: DateTime<Utc>, after: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(after)
        .ok()
        .and_then(|after| from.checked_add_signed(after))
}

/// A record in `state`, keeping the identity and creation time of `record`
pub(crate) fn with_state(
    record: StateRecord,
    state: ItemState,
    expires_at: Option<DateTime<Utc>>,
) -> StateRecord {
    StateRecord {
        state,
        expires_at,
        locked_by: None,
        ..record
    }
}
