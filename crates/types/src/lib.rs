//! Types and Traits for the `quorum` ledger consensus node
//!
//! This crate holds everything the consensus core shares with the outside world: the item state
//! model, ledger records, votes and protocol messages, node configuration, and the traits the core
//! consumes ([`Item`](traits::item::Item), [`Ledger`](traits::ledger::Ledger) and
//! [`ConnectedNetwork`](traits::network::ConnectedNetwork)).

pub mod config;
pub mod constants;
pub mod data;
pub mod error;
pub mod event;
pub mod item_state;
pub mod logging;
pub mod message;
pub mod traits;

pub use config::{ConsensusThresholds, NodeConfig, NodeConfigFile};
pub use item_state::ItemState;
