//! Short-lived cache of the items a node has seen

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use quorum_types::{
    data::{ErrorRecord, HashId},
    traits::Item,
};
use tokio::time::Instant;

/// A cached item together with what the node found wrong with it
#[derive(Debug)]
struct CachedItem {
    /// The item
    item: Arc<dyn Item>,
    /// Problems found by the last local check
    errors: Vec<ErrorRecord>,
    /// When the item was last put into the cache
    cached_at: Instant,
}

/// Items registered on or received by a node, kept for a limited time
#[derive(Debug)]
pub(crate) struct ItemCache {
    /// How long an entry lives
    max_age: Duration,
    /// The entries
    entries: DashMap<HashId, CachedItem>,
}

impl ItemCache {
    /// An empty cache whose entries live for `max_age`
    pub(crate) fn new(max_age: Duration) -> Self {
        Self {
            max_age,
            entries: DashMap::new(),
        }
    }

    /// Cache an item, refreshing its age. Errors found earlier are kept.
    pub(crate) fn put(&self, item: Arc<dyn Item>) {
        let now = Instant::now();
        self.entries
            .entry(item.id())
            .and_modify(|entry| {
                entry.item = Arc::clone(&item);
                entry.cached_at = now;
            })
            .or_insert_with(|| CachedItem {
                item: Arc::clone(&item),
                errors: Vec::new(),
                cached_at: now,
            });
    }

    /// The cached item, if it has not expired
    pub(crate) fn get(&self, id: &HashId) -> Option<Arc<dyn Item>> {
        self.evict_if_expired(id);
        self.entries.get(id).map(|entry| Arc::clone(&entry.item))
    }

    /// Whether the item is cached
    pub(crate) fn contains(&self, id: &HashId) -> bool {
        self.get(id).is_some()
    }

    /// Problems found by the last local check of the item
    pub(crate) fn errors(&self, id: &HashId) -> Vec<ErrorRecord> {
        self.evict_if_expired(id);
        self.entries
            .get(id)
            .map(|entry| entry.errors.clone())
            .unwrap_or_default()
    }

    /// Replace the problems recorded for a cached item
    pub(crate) fn set_errors(&self, id: &HashId, errors: Vec<ErrorRecord>) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.errors = errors;
        }
    }

    /// Drop every expired entry, returning how many were dropped
    pub(crate) fn purge(&self) -> usize {
        let before = self.entries.len();
        let max_age = self.max_age;
        self.entries
            .retain(|_, entry| entry.cached_at.elapsed() < max_age);
        before.saturating_sub(self.entries.len())
    }

    /// Drop the entry of `id` if it expired
    fn evict_if_expired(&self, id: &HashId) {
        let max_age = self.max_age;
        self.entries
            .remove_if(id, |_, entry| entry.cached_at.elapsed() >= max_age);
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, time::Duration};

    use quorum_types::{
        data::{ErrorCode, ErrorRecord, HashId},
        traits::Item,
    };

    use super::ItemCache;

    #[derive(Debug)]
    struct Blob(HashId);

    impl Item for Blob {
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

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let cache = ItemCache::new(Duration::from_secs(60));
        let id = HashId::random();
        cache.put(Arc::new(Blob(id)));
        cache.set_errors(&id, vec![ErrorRecord::new(ErrorCode::Failure, "blob", "bad")]);
        assert!(cache.contains(&id));
        assert_eq!(cache.errors(&id).len(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get(&id).is_none());
        assert!(cache.errors(&id).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_counts_expired_entries() {
        let cache = ItemCache::new(Duration::from_secs(60));
        cache.put(Arc::new(Blob(HashId::random())));
        tokio::time::advance(Duration::from_secs(30)).await;
        let fresh = HashId::random();
        cache.put(Arc::new(Blob(fresh)));
        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(cache.purge(), 1);
        assert!(cache.contains(&fresh));
    }
}
