use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use quorum::{tasks::election::ElectionState, traits::implementations::MasterMap, Node};
use quorum_types::{
    data::{HashId, ItemResult, NodeId, StateRecord},
    error::NodeError,
    item_state::ItemState,
    traits::{
        item::Item,
        ledger::{Ledger, RecordHandle},
        node_implementation::NodeImplementation,
    },
};
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

/// How often the runner re-checks a condition it waits for
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A running network of nodes, driven by a test
pub struct TestRunner<I: NodeImplementation> {
    /// the nodes, indexed by their id
    nodes: Vec<Arc<Node<I>>>,
    /// switchboard of the emulated network
    master_map: Arc<MasterMap>,
}

impl<I: NodeImplementation> TestRunner<I> {
    /// Wrap started nodes
    #[must_use]
    pub fn new(nodes: Vec<Arc<Node<I>>>, master_map: Arc<MasterMap>) -> Self {
        Self { nodes, master_map }
    }

    /// Every node, indexed by id
    #[must_use]
    pub fn nodes(&self) -> &[Arc<Node<I>>] {
        &self.nodes
    }

    /// The node with index `idx`
    ///
    /// # Panics
    /// If there is no such node
    #[must_use]
    pub fn node(&self, idx: usize) -> &Arc<Node<I>> {
        &self.nodes[idx]
    }

    /// Cut a node off the network. Messages to and from it are lost.
    pub fn switch_off(&self, idx: usize) {
        info!(idx, "switching node off");
        self.master_map.switch_off(self.node(idx).id());
    }

    /// Reconnect a node
    pub fn switch_on(&self, idx: usize) {
        info!(idx, "switching node on");
        self.master_map.switch_on(self.node(idx).id());
    }

    /// Reconnect every node
    pub fn switch_on_all(&self) {
        for node in &self.nodes {
            self.master_map.switch_on(node.id());
        }
    }

    /// Write `state` for `id` straight into the ledgers of the given nodes, bypassing consensus
    ///
    /// # Errors
    /// If a ledger fails
    pub async fn seed(
        &self,
        id: HashId,
        state: ItemState,
        nodes: impl IntoIterator<Item = usize>,
    ) -> Result<(), NodeError> {
        for idx in nodes {
            let record = StateRecord {
                state,
                ..StateRecord::pending(id)
            };
            self.node(idx).ledger().save(&record).await?;
        }
        Ok(())
    }

    /// Write `state` for `id` into every ledger except the one of node `except`
    ///
    /// # Errors
    /// If a ledger fails
    pub async fn seed_all_but(
        &self,
        id: HashId,
        state: ItemState,
        except: usize,
    ) -> Result<(), NodeError> {
        self.seed(id, state, (0..self.nodes.len()).filter(|idx| *idx != except))
            .await
    }

    /// Drop the record of `id` from the ledger of node `idx`
    ///
    /// # Errors
    /// If the ledger fails
    pub async fn destroy(&self, idx: usize, id: &HashId) -> Result<(), NodeError> {
        if let Some(handle) = RecordHandle::get(self.node(idx).ledger(), id).await? {
            handle.destroy().await?;
        }
        Ok(())
    }

    /// Register an item on node `idx` and wait for its outcome there
    ///
    /// # Errors
    /// If the node fails
    pub async fn register_and_wait(
        &self,
        idx: usize,
        item: Arc<dyn Item>,
        max_wait: Duration,
    ) -> Result<ItemResult, NodeError> {
        let id = item.id();
        let node = self.node(idx);
        node.register_item(item).await?;
        node.wait_item(&id, max_wait).await
    }

    /// Wait, on every node at once, for `id` to reach a terminal state
    ///
    /// # Errors
    /// If a node fails
    pub async fn wait_all(
        &self,
        id: &HashId,
        max_wait: Duration,
    ) -> Result<Vec<ItemResult>, NodeError> {
        join_all(self.nodes.iter().map(|node| node.wait_item(id, max_wait)))
            .await
            .into_iter()
            .collect()
    }

    /// The current state of `id` on every node
    ///
    /// # Errors
    /// If a node fails
    pub async fn states(&self, id: &HashId) -> Result<Vec<ItemState>, NodeError> {
        let mut states = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            states.push(node.check_item(id).await?.state);
        }
        Ok(states)
    }

    /// Wait until node `idx` holds `id` in `state`, returning whether it did before `max_wait`
    ///
    /// # Errors
    /// If the node fails
    pub async fn wait_for_state(
        &self,
        idx: usize,
        id: &HashId,
        state: ItemState,
        max_wait: Duration,
    ) -> Result<bool, NodeError> {
        let node = self.node(idx);
        let deadline = Instant::now() + max_wait;
        loop {
            if node.check_item(id).await?.state == state {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                debug!(idx, %id, %state, "state not reached");
                return Ok(false);
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait until the election of `id` on node `idx` is in `phase`, returning whether it was
    /// before `max_wait`
    pub async fn wait_for_phase(
        &self,
        idx: usize,
        id: &HashId,
        phase: ElectionState,
        max_wait: Duration,
    ) -> bool {
        let node = self.node(idx);
        let deadline = Instant::now() + max_wait;
        loop {
            if node.election_state(id) == Some(phase) {
                return true;
            }
            if Instant::now() >= deadline {
                debug!(idx, %id, ?phase, "election phase not reached");
                return false;
            }
            sleep(POLL_INTERVAL / 4).await;
        }
    }

    /// Wait until no node runs an election or resync, returning whether that happened before
    /// `max_wait`
    pub async fn wait_idle(&self, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        loop {
            let busy = self
                .nodes
                .iter()
                .any(|node| node.count_elections() > 0 || node.count_resyncs() > 0);
            if !busy {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Ids of the nodes that are currently cut off
    #[must_use]
    pub fn switched_off(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .map(|node| node.id())
            .filter(|id| self.master_map.is_switched_off(id))
            .collect()
    }

    /// Shut every node down
    pub async fn shut_down(self) {
        join_all(self.nodes.iter().map(|node| node.shut_down())).await;
        info!("test network shut down");
    }
}
