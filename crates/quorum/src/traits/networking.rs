//! Network access compatibility
//!
//! This module contains the emulated network used to run many nodes inside one process.

pub mod memory_network;

pub use quorum_types::traits::network::{
    AsynchronousNetwork, NetworkError, NetworkReliability, SynchronousNetwork,
};
