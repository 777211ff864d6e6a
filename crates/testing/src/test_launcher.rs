use std::sync::Arc;

use quorum::{traits::implementations::MasterMap, Node};
use quorum_types::{
    data::NodeId, error::NodeError, traits::node_implementation::NodeImplementation, NodeConfig,
};
use tracing::info;

use crate::{test_builder::TestDescription, test_runner::TestRunner};

/// Wrapper for a function that takes a `node_id` and returns an instance of `T`.
pub type Generator<T> = Box<dyn Fn(u64) -> T + Send + Sync + 'static>;

/// generators for resources used by each node
pub struct ResourceGenerators<I: NodeImplementation> {
    /// generate the network endpoint of each node
    pub network: Generator<I::Network>,
    /// generate a new ledger for each node
    pub ledger: Generator<I::Ledger>,
    /// configuration used to generate each node
    pub config: NodeConfig,
}

/// test launcher
pub struct TestLauncher<I: NodeImplementation> {
    /// generator for resources
    pub resource_generator: ResourceGenerators<I>,
    /// the emulated network every generated endpoint is attached to
    pub master_map: Arc<MasterMap>,
    /// metadata used for tasks
    pub metadata: TestDescription,
}

impl<I: NodeImplementation> TestLauncher<I> {
    /// override the node configuration
    #[must_use]
    pub fn modify_default_config(mut self, mut f: impl FnMut(&mut NodeConfig)) -> Self {
        f(&mut self.resource_generator.config);
        self
    }

    /// Create and start every node of the test.
    ///
    /// Every endpoint is attached before the first node is created, so each node sees the whole
    /// network when validating its configuration.
    ///
    /// # Errors
    /// If a node refuses the configuration
    pub async fn launch(self) -> Result<TestRunner<I>, NodeError> {
        let TestLauncher {
            resource_generator,
            master_map,
            metadata,
        } = self;
        let num_nodes = metadata.num_nodes as u64;

        let networks: Vec<_> = (0..num_nodes)
            .map(|node_id| Arc::new((resource_generator.network)(node_id)))
            .collect();

        let mut nodes = Vec::with_capacity(networks.len());
        for (node_id, network) in (0..num_nodes).zip(networks) {
            let ledger = Arc::new((resource_generator.ledger)(node_id));
            let node = Node::<I>::new(
                NodeId(node_id),
                resource_generator.config.clone(),
                ledger,
                network,
            )?;
            node.start().await;
            nodes.push(node);
        }
        info!(num_nodes, "test network launched");

        Ok(TestRunner::new(nodes, master_map))
    }
}
