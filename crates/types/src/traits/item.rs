//! The votable item abstraction
//!
//! An [`Item`] is anything the network can approve: a contract, a document, a test stub. The core
//! only ever asks an item for its identity, its relations to other items, and its verdict on
//! itself.

use std::{fmt::Debug, sync::Arc};

use chrono::{DateTime, Utc};

use crate::data::{ErrorRecord, HashId};

/// Capability interface of a votable item
///
/// Relations are expressed as ids (or, for items created together with this one, as items that
/// can check themselves). The core resolves ids through the ledger on demand and never holds a
/// graph of live items.
pub trait Item: Debug + Send + Sync + 'static {
    /// Content hash of the item
    fn id(&self) -> HashId;

    /// Ids of the items that must become `REVOKED` when this item is approved
    fn revoking_items(&self) -> Vec<HashId>;

    /// Items created atomically together with this one
    fn new_items(&self) -> Vec<Arc<dyn Item>>;

    /// Ids of the items that must already be approved for this item to be valid
    fn referenced_item_ids(&self) -> Vec<HashId>;

    /// Local verdict of the item on itself
    ///
    /// # Errors
    /// Returns every problem found when the item is not valid.
    fn self_check(&self) -> Result<(), Vec<ErrorRecord>>;

    /// When the item was issued. Items older than the node's creation age limit are declined.
    fn created_at(&self) -> Option<DateTime<Utc>> {
        None
    }

    /// When an approved record of this item may be purged. `None` keeps it forever.
    fn expires_at(&self) -> Option<DateTime<Utc>> {
        None
    }
}
