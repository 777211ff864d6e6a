//! Events that a `quorum` node can emit

use crate::{data::HashId, item_state::ItemState};

/// A state change of one item, published after the ledger write that made it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    /// The item whose record changed
    pub item_id: HashId,
    /// The state now in the ledger
    pub state: ItemState,
}
