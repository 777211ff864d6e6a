use std::{sync::Arc, time::Duration};

use quorum::traits::{
    implementations::{MasterMap, MemoryLedger, MemoryNetwork},
    NetworkReliability,
};
use quorum_example_types::node_types::MemoryImpl;
use quorum_types::{data::NodeId, ConsensusThresholds, NodeConfig};

use crate::test_launcher::{ResourceGenerators, TestLauncher};

/// data describing how elections and resyncs should be timed.
#[derive(Clone, Debug, Copy)]
pub struct TimingData {
    /// Election timeout, in milliseconds
    pub max_elections_time: u64,
    /// Interval between vote re-requests, in milliseconds
    pub poll_time: u64,
    /// Interval between result re-announcements, in milliseconds
    pub consensus_received_check_time: u64,
    /// Window for result re-announcements, in milliseconds
    pub max_consensus_received_check_time: u64,
    /// Interval between state query re-sends, in milliseconds
    pub resync_time: u64,
    /// Resync timeout, in milliseconds
    pub max_resync_time: u64,
    /// Interval at which waiters re-read the ledger, in milliseconds
    pub check_item_time: u64,
}

impl Default for TimingData {
    fn default() -> Self {
        Self {
            max_elections_time: 5000,
            poll_time: 100,
            consensus_received_check_time: 100,
            max_consensus_received_check_time: 1000,
            resync_time: 100,
            max_resync_time: 2000,
            check_item_time: 50,
        }
    }
}

/// metadata describing a test
#[derive(Clone, Debug)]
pub struct TestDescription {
    /// Total number of nodes in the test
    pub num_nodes: usize,
    /// Thresholds every node starts with; derived from `num_nodes` when absent
    pub thresholds: Option<ConsensusThresholds>,
    /// timing data
    pub timing_data: TimingData,
    /// Known sub-items required before the unknown rest is resynced
    pub known_sub_contracts_to_resync: usize,
    /// unreliable networking metadata
    pub unreliable_network: Option<Arc<dyn NetworkReliability>>,
}

impl Default for TestDescription {
    /// the default metadata: ten nodes approving with 7 votes and declining with 4
    fn default() -> Self {
        Self {
            num_nodes: 10,
            thresholds: None,
            timing_data: TimingData::default(),
            known_sub_contracts_to_resync: 1,
            unreliable_network: None,
        }
    }
}

impl TestDescription {
    /// Configuration shared by every node of the test
    #[must_use]
    pub fn node_config(&self) -> NodeConfig {
        let TimingData {
            max_elections_time,
            poll_time,
            consensus_received_check_time,
            max_consensus_received_check_time,
            resync_time,
            max_resync_time,
            check_item_time,
        } = self.timing_data;
        let thresholds = self
            .thresholds
            .unwrap_or_else(|| ConsensusThresholds::for_network_size(self.num_nodes));
        NodeConfig {
            max_elections_time: Duration::from_millis(max_elections_time),
            poll_time: Duration::from_millis(poll_time),
            consensus_received_check_time: Duration::from_millis(consensus_received_check_time),
            max_consensus_received_check_time: Duration::from_millis(
                max_consensus_received_check_time,
            ),
            resync_time: Duration::from_millis(resync_time),
            max_resync_time: Duration::from_millis(max_resync_time),
            check_item_time: Duration::from_millis(check_item_time),
            known_sub_contracts_to_resync: self.known_sub_contracts_to_resync,
            ..NodeConfig::with_thresholds(thresholds)
        }
    }

    /// turn a description of a test (e.g. a [`TestDescription`]) into
    /// a [`TestLauncher`] that can be used to launch the test.
    #[must_use]
    pub fn gen_launcher(self) -> TestLauncher<MemoryImpl> {
        let master_map = MasterMap::new();
        let config = self.node_config();
        let network_map = Arc::clone(&master_map);
        let reliability = self.unreliable_network.clone();

        TestLauncher {
            resource_generator: ResourceGenerators {
                network: Box::new(move |node_id: u64| {
                    MemoryNetwork::new(NodeId(node_id), &network_map, reliability.clone())
                }),
                ledger: Box::new(|_| MemoryLedger::empty()),
                config,
            },
            master_map,
            metadata: self,
        }
    }
}
