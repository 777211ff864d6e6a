//! Contains traits consumed by [`Node`](crate::Node) and their in-memory implementations

mod ledger;
mod networking;

pub use networking::{AsynchronousNetwork, NetworkError, NetworkReliability, SynchronousNetwork};
pub use quorum_types::traits::{
    item::Item,
    ledger::{Ledger, TestableLedger},
    network::ConnectedNetwork,
    node_implementation::NodeImplementation,
};

/// Module for publicly usable implementations of the traits
pub mod implementations {
    pub use super::{
        ledger::memory_ledger::MemoryLedger,
        networking::memory_network::{MasterMap, MemoryNetwork},
    };
}
