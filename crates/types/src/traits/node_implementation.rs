//! Composite trait for node behavior
//!
//! This module defines the [`NodeImplementation`] trait, which is a composite trait used for
//! describing the overall behavior of a node, as a composition of implementations of the node trait.

use std::fmt::Debug;

use super::{ledger::Ledger, network::ConnectedNetwork};

/// Node implementation aggregate trait
///
/// This trait exists to collect multiple behavior implementations into one type, to allow
/// `quorum` to avoid annoying numbers of type arguments and type patching.
///
/// It is recommended you implement this trait on a zero sized type, as `quorum` does not actually
/// store or keep a reference to any value implementing this trait.
pub trait NodeImplementation: Send + Sync + Debug + Clone + 'static {
    /// Ledger holding the state records of this node
    type Ledger: Ledger;

    /// Network endpoint connecting this node to its peers
    type Network: ConnectedNetwork;
}
