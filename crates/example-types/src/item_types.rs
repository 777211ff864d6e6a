use std::sync::Arc;

use chrono::{DateTime, Utc};
use quorum_types::{
    data::{ErrorCode, ErrorRecord, HashId},
    traits::Item,
};
use rand::RngCore;

/// An item whose validity is decided at construction.
///
/// Identity is the hash of a random payload, so two test items never collide. Relations are
/// added with the builder methods.
#[derive(Clone, Debug)]
pub struct TestItem {
    /// Content hash
    id: HashId,
    /// Outcome of the self check
    is_ok: bool,
    /// Items revoked by this one
    revoking: Vec<HashId>,
    /// Items created together with this one
    new_items: Vec<Arc<TestItem>>,
    /// Items that must be approved already
    references: Vec<HashId>,
    /// Issue time
    created_at: Option<DateTime<Utc>>,
    /// Expiration of the approved record
    expires_at: Option<DateTime<Utc>>,
}

impl TestItem {
    /// A fresh item that passes (`is_ok`) or fails its self check
    #[must_use]
    pub fn new(is_ok: bool) -> Self {
        let mut payload = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut payload);
        Self {
            id: HashId::of(&payload),
            is_ok,
            revoking: Vec::new(),
            new_items: Vec::new(),
            references: Vec::new(),
            created_at: None,
            expires_at: None,
        }
    }

    /// A fresh valid item
    #[must_use]
    pub fn ok() -> Self {
        Self::new(true)
    }

    /// A fresh item failing its self check
    #[must_use]
    pub fn bad() -> Self {
        Self::new(false)
    }

    /// Revoke `id` on approval
    #[must_use]
    pub fn revoking(mut self, id: HashId) -> Self {
        self.revoking.push(id);
        self
    }

    /// Create `item` together with this one
    #[must_use]
    pub fn with_new_item(mut self, item: TestItem) -> Self {
        self.new_items.push(Arc::new(item));
        self
    }

    /// Require `id` to be approved
    #[must_use]
    pub fn referencing(mut self, id: HashId) -> Self {
        self.references.push(id);
        self
    }

    /// Set the issue time
    #[must_use]
    pub fn created(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Set the expiration of the approved record
    #[must_use]
    pub fn expiring(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Ids of the items created together with this one
    #[must_use]
    pub fn new_item_ids(&self) -> Vec<HashId> {
        self.new_items.iter().map(|item| item.id).collect()
    }

    /// Share the item
    #[must_use]
    pub fn shared(self) -> Arc<dyn Item> {
        Arc::new(self)
    }
}

impl Item for TestItem {
    fn id(&self) -> HashId {
        self.id
    }

    fn revoking_items(&self) -> Vec<HashId> {
        self.revoking.clone()
    }

    fn new_items(&self) -> Vec<Arc<dyn Item>> {
        self.new_items
            .iter()
            .map(|item| Arc::clone(item) as Arc<dyn Item>)
            .collect()
    }

    fn referenced_item_ids(&self) -> Vec<HashId> {
        self.references.clone()
    }

    fn self_check(&self) -> Result<(), Vec<ErrorRecord>> {
        if self.is_ok {
            Ok(())
        } else {
            Err(vec![ErrorRecord::new(
                ErrorCode::Failure,
                self.id.to_string(),
                "test item is marked bad",
            )])
        }
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }
}

/// Stands in for an item known only by id, e.g. to vote on an id some other node holds.
///
/// Always passes its self check and has no relations.
#[derive(Clone, Copy, Debug)]
pub struct FakeItem(pub HashId);

impl Item for FakeItem {
    fn id(&self) -> HashId {
        self.0
    }

    fn revoking_items(&self) -> Vec<HashId> {
        Vec::new()
    }

    fn new_items(&self) -> Vec<Arc<dyn Item>> {
        Vec::new()
    }

    fn referenced_item_ids(&self) -> Vec<HashId> {
        Vec::new()
    }

    fn self_check(&self) -> Result<(), Vec<ErrorRecord>> {
        Ok(())
    }
}
