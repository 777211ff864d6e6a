//! Error type for `quorum`
//!
//! This module provides [`NodeError`], which is an enum representing possible faults that can
//! occur while interacting with a node. Validation failures of items are not errors in this
//! sense; they travel as [`ErrorRecord`](crate::data::ErrorRecord) values inside results.

use snafu::Snafu;

use crate::{
    config::ConfigError,
    data::HashId,
    traits::{ledger::LedgerError, network::NetworkError},
};

/// Error type for `quorum`
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
#[non_exhaustive]
pub enum NodeError {
    /// The node configuration is unusable
    #[snafu(display("invalid node configuration: {source}"))]
    InvalidConfig {
        /// Originating config error
        source: ConfigError,
    },
    /// The ledger failed
    #[snafu(display("ledger failure: {source}"))]
    LedgerFailure {
        /// Originating ledger error
        source: LedgerError,
    },
    /// The network failed
    #[snafu(display("network failure: {source}"))]
    NetworkFailure {
        /// Originating network error
        source: NetworkError,
    },
    /// The item cannot be accepted in its current state
    #[snafu(display("item {id} is {state} and cannot be {operation}"))]
    BadItemState {
        /// The item
        id: HashId,
        /// Its recorded state
        state: crate::item_state::ItemState,
        /// What was attempted
        operation: &'static str,
    },
    /// The node has been shut down
    ShutDown,
}

impl From<LedgerError> for NodeError {
    fn from(source: LedgerError) -> Self {
        NodeError::LedgerFailure { source }
    }
}

impl From<ConfigError> for NodeError {
    fn from(source: ConfigError) -> Self {
        NodeError::InvalidConfig { source }
    }
}

impl From<NetworkError> for NodeError {
    fn from(source: NetworkError) -> Self {
        NodeError::NetworkFailure { source }
    }
}
