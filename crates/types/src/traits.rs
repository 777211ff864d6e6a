//! Common traits for the `quorum` consensus core
//!
//! The core never looks inside an item, never touches storage internals and never speaks a wire
//! format. These traits are the seams through which it reaches all three.

pub mod item;
pub mod ledger;
pub mod network;
pub mod node_implementation;

pub use item::Item;
pub use ledger::Ledger;
pub use network::ConnectedNetwork;
