use quorum::traits::{
    implementations::{MemoryLedger, MemoryNetwork},
    NodeImplementation,
};

/// In-memory ledger and emulated network: a whole cluster inside one process
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct MemoryImpl;

impl NodeImplementation for MemoryImpl {
    type Ledger = MemoryLedger;
    type Network = MemoryNetwork;
}
