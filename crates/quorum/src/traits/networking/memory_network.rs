//! In memory network simulator
//!
//! This module provides an in-memory only emulation of an actual network, useful for unit and
//! integration tests and for the demo binary. Nodes can be switched off to emulate partitions, and
//! an optional [`NetworkReliability`] drops or delays individual messages.

use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use async_lock::{Mutex, RwLock};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use quorum_types::{
    data::NodeId,
    message::Message,
    traits::network::{ConnectedNetwork, NetworkError, NetworkReliability},
};
use tokio::{
    spawn,
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    time::sleep,
};
use tracing::{info, instrument, trace, warn};

/// Shared state for in-memory mock networking.
///
/// This type is responsible for keeping track of the channels to each [`MemoryNetwork`], and is
/// used to group the [`MemoryNetwork`] instances.
#[derive(Debug, Default)]
pub struct MasterMap {
    /// The list of `MemoryNetwork`s
    map: DashMap<NodeId, MemoryNetwork>,
    /// Nodes that currently neither send nor receive
    switched_off: DashSet<NodeId>,
}

impl MasterMap {
    /// Create a new, empty, `MasterMap`
    #[must_use]
    pub fn new() -> Arc<MasterMap> {
        Arc::new(MasterMap::default())
    }

    /// Cut a node off the network. Messages from and to it are silently lost.
    pub fn switch_off(&self, node: NodeId) {
        info!(%node, "switching node off");
        self.switched_off.insert(node);
    }

    /// Reconnect a node cut off with [`switch_off`](Self::switch_off)
    pub fn switch_on(&self, node: NodeId) {
        info!(%node, "switching node on");
        self.switched_off.remove(&node);
    }

    /// Whether a node is currently cut off
    #[must_use]
    pub fn is_switched_off(&self, node: &NodeId) -> bool {
        self.switched_off.contains(node)
    }

    /// Every attached node, in id order
    #[must_use]
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<_> = self.map.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }
}

/// Internal state for a `MemoryNetwork` instance
#[derive(Debug)]
struct MemoryNetworkInner {
    /// Id of the owning node
    node_id: NodeId,
    /// Input for messages
    input: RwLock<Option<UnboundedSender<Message>>>,
    /// Output for messages
    output: Mutex<UnboundedReceiver<Message>>,
    /// The master map
    master_map: Arc<MasterMap>,

    /// Count of messages that are in-flight (send but not processed yet)
    in_flight_message_count: AtomicUsize,

    /// config to introduce unreliability to the network
    reliability_config: Option<Arc<dyn NetworkReliability>>,
}

/// In memory only network simulator.
///
/// This provides an in memory simulation of a networking implementation, allowing nodes running on
/// the same machine to mock networking while testing other functionality.
///
/// Under the hood, this simply maintains an unbounded channel into every other `MemoryNetwork`
/// instance of the same group.
#[derive(Clone)]
pub struct MemoryNetwork {
    /// The actual internal state
    inner: Arc<MemoryNetworkInner>,
}

impl Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("node_id", &self.inner.node_id)
            .finish_non_exhaustive()
    }
}

impl MemoryNetwork {
    /// Creates a new `MemoryNetwork` and hooks it up to the group through the provided `MasterMap`
    pub fn new(
        node_id: NodeId,
        master_map: &Arc<MasterMap>,
        reliability_config: Option<Arc<dyn NetworkReliability>>,
    ) -> MemoryNetwork {
        info!(%node_id, "Attaching new MemoryNetwork");
        let (input, output) = unbounded_channel();
        let mn = MemoryNetwork {
            inner: Arc::new(MemoryNetworkInner {
                node_id,
                input: RwLock::new(Some(input)),
                output: Mutex::new(output),
                master_map: Arc::clone(master_map),
                in_flight_message_count: AtomicUsize::new(0),
                reliability_config,
            }),
        };
        master_map.map.insert(node_id, mn.clone());
        mn
    }

    /// Number of messages sent to this node and not yet received
    #[must_use]
    pub fn in_flight_message_count(&self) -> usize {
        self.inner.in_flight_message_count.load(Ordering::Relaxed)
    }

    /// Push a message into this node's inbox
    async fn input(&self, message: Message) -> Result<(), NetworkError> {
        let input = self.inner.input.read().await;
        let Some(input) = &*input else {
            return Err(NetworkError::CouldNotDeliver {
                node: self.inner.node_id,
            });
        };
        self.inner
            .in_flight_message_count
            .fetch_add(1, Ordering::Relaxed);
        input.send(message).map_err(|_| {
            self.inner
                .in_flight_message_count
                .fetch_sub(1, Ordering::Relaxed);
            NetworkError::CouldNotDeliver {
                node: self.inner.node_id,
            }
        })
    }
}

#[async_trait]
impl ConnectedNetwork for MemoryNetwork {
    fn node_id(&self) -> NodeId {
        self.inner.node_id
    }

    fn peers(&self) -> Vec<NodeId> {
        self.inner
            .master_map
            .node_ids()
            .into_iter()
            .filter(|node| *node != self.inner.node_id)
            .collect()
    }

    #[instrument(name = "MemoryNetwork::direct_message", skip(self, message), fields(from = %self.inner.node_id))]
    async fn direct_message(
        &self,
        message: Message,
        recipient: NodeId,
    ) -> Result<(), NetworkError> {
        let Some(node) = self
            .inner
            .master_map
            .map
            .get(&recipient)
            .map(|entry| entry.value().clone())
        else {
            return Err(NetworkError::NoSuchNode { node: recipient });
        };
        let master_map = &self.inner.master_map;
        if master_map.is_switched_off(&self.inner.node_id) || master_map.is_switched_off(&recipient)
        {
            trace!(%recipient, "Dropping message, node switched off");
            return Ok(());
        }
        if let Some(config) = &self.inner.reliability_config {
            if !config.sample_keep() {
                trace!(%recipient, "Dropping message");
                return Ok(());
            }
            let delay = config.sample_delay();
            if !delay.is_zero() {
                spawn(async move {
                    sleep(delay).await;
                    // the recipient may have shut down meanwhile
                    let _ = node.input(message).await;
                });
                return Ok(());
            }
        }
        node.input(message).await?;
        trace!(%recipient, "Delivered message to remote");
        Ok(())
    }

    /// Receive one message from the underlying network.
    ///
    /// # Errors
    /// If the other side of the channel is closed
    #[instrument(name = "MemoryNetwork::recv_message", skip_all)]
    async fn recv_message(&self) -> Result<Message, NetworkError> {
        let ret = self
            .inner
            .output
            .lock()
            .await
            .recv()
            .await
            .ok_or(NetworkError::ShutDown)?;
        self.inner
            .in_flight_message_count
            .fetch_sub(1, Ordering::Relaxed);
        Ok(ret)
    }

    #[instrument(name = "MemoryNetwork::shut_down", skip_all)]
    async fn shut_down(&self) {
        if self.inner.input.write().await.take().is_none() {
            warn!(node = %self.inner.node_id, "MemoryNetwork already shut down");
        }
    }
}
