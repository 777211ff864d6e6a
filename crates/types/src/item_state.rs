//! The item state model
//!
//! Every item a node knows about is in exactly one [`ItemState`]. The states partition into
//! pending states (no decision yet), terminal consensus outcomes, and exclusive-hold states used
//! while another item is being processed.

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of an item in the ledger of one node
#[derive(Copy, Clone, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemState {
    /// No record: the item was never seen, or its record was erased
    #[default]
    Undefined,
    /// An election is registered but this node has not formed an opinion yet
    Pending,
    /// This node checked the item and leans towards approval
    PendingPositive,
    /// This node checked the item and leans towards declining it
    PendingNegative,
    /// The network approved the item
    Approved,
    /// The network declined the item
    Declined,
    /// The item was approved and later superseded by another approved item
    Revoked,
    /// Held by another item's election that wants to revoke it
    Locked,
    /// Id reserved for an item being created by another item's election
    LockedForCreation,
}

impl ItemState {
    /// True for the states in which no decision exists yet
    #[must_use]
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            ItemState::Undefined
                | ItemState::Pending
                | ItemState::PendingPositive
                | ItemState::PendingNegative
        )
    }

    /// True only for the terminal consensus outcomes
    #[must_use]
    pub fn is_consensus_found(self) -> bool {
        matches!(
            self,
            ItemState::Approved | ItemState::Declined | ItemState::Revoked
        )
    }

    /// True for the exclusive-hold states
    #[must_use]
    pub fn is_locked(self) -> bool {
        matches!(self, ItemState::Locked | ItemState::LockedForCreation)
    }

    /// Whether an item in this state counts as valid for items that reference it
    #[must_use]
    pub fn is_approved(self) -> bool {
        matches!(self, ItemState::Approved | ItemState::Locked)
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemState::Undefined => "UNDEFINED",
            ItemState::Pending => "PENDING",
            ItemState::PendingPositive => "PENDING_POSITIVE",
            ItemState::PendingNegative => "PENDING_NEGATIVE",
            ItemState::Approved => "APPROVED",
            ItemState::Declined => "DECLINED",
            ItemState::Revoked => "REVOKED",
            ItemState::Locked => "LOCKED",
            ItemState::LockedForCreation => "LOCKED_FOR_CREATION",
        };
        f.write_str(name)
    }
}
