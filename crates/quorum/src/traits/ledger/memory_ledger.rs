//! [`BTreeMap`] based implementation of the ledger trait
//!
//! This module provides a non-persisting adapter for the [`Ledger`] trait, used by tests and the
//! emulated network demo.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_lock::RwLock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quorum_types::{
    data::{HashId, StateRecord},
    item_state::ItemState,
    traits::ledger::{Ledger, LedgerError, LedgerResult, RecordChange, TestableLedger},
};
use tracing::trace;

/// Internal state for a [`MemoryLedger`]
#[derive(Debug, Default)]
struct MemoryLedgerInternal {
    /// One record per item
    records: BTreeMap<HashId, StateRecord>,
}

/// In memory, ephemeral, ledger for a [`Node`](crate::Node)
///
/// One lock guards the whole map, so every operation, `commit` included, is atomic.
#[derive(Clone, Debug, Default)]
pub struct MemoryLedger {
    /// The inner state of this [`MemoryLedger`]
    inner: Arc<RwLock<MemoryLedgerInternal>>,
    /// When set, every operation fails as if the backend were down
    unavailable: Arc<AtomicBool>,
}

impl MemoryLedger {
    /// Create a new, empty ledger
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) the backing store
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Fail if the backend is marked unavailable
    fn ensure_available(&self) -> LedgerResult {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(LedgerError::Unavailable {
                reason: "memory ledger switched off".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TestableLedger for MemoryLedger {
    fn construct_tmp_ledger() -> LedgerResult<Self> {
        Ok(Self::empty())
    }

    async fn snapshot(&self) -> Vec<StateRecord> {
        self.inner.read().await.records.values().cloned().collect()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn find_or_create(&self, id: HashId) -> LedgerResult<StateRecord> {
        self.ensure_available()?;
        let mut inner = self.inner.write().await;
        Ok(inner
            .records
            .entry(id)
            .or_insert_with(|| {
                trace!(%id, "creating pending record");
                StateRecord::pending(id)
            })
            .clone())
    }

    async fn get_record(&self, id: &HashId) -> LedgerResult<Option<StateRecord>> {
        self.ensure_available()?;
        Ok(self.inner.read().await.records.get(id).cloned())
    }

    async fn save(&self, record: &StateRecord) -> LedgerResult {
        self.ensure_available()?;
        self.inner
            .write()
            .await
            .records
            .insert(record.id, record.clone());
        Ok(())
    }

    async fn destroy(&self, id: &HashId) -> LedgerResult {
        self.ensure_available()?;
        self.inner.write().await.records.remove(id);
        Ok(())
    }

    async fn commit(&self, changes: Vec<RecordChange>) -> LedgerResult {
        self.ensure_available()?;
        let mut inner = self.inner.write().await;
        for change in changes {
            match change {
                RecordChange::Save(record) => {
                    inner.records.insert(record.id, record);
                }
                RecordChange::Destroy(id) => {
                    inner.records.remove(&id);
                }
            }
        }
        Ok(())
    }

    async fn lock_to_revoke(
        &self,
        id: &HashId,
        locker: &HashId,
    ) -> LedgerResult<Option<StateRecord>> {
        self.ensure_available()?;
        let mut inner = self.inner.write().await;
        let Some(record) = inner.records.get_mut(id) else {
            return Ok(None);
        };
        match record.state {
            ItemState::Approved => {
                record.state = ItemState::Locked;
                record.locked_by = Some(*locker);
                Ok(Some(record.clone()))
            }
            // taking the same lock twice is harmless
            ItemState::Locked if record.locked_by == Some(*locker) => Ok(Some(record.clone())),
            _ => Ok(None),
        }
    }

    async fn create_output_lock(
        &self,
        id: &HashId,
        locker: &HashId,
    ) -> LedgerResult<Option<StateRecord>> {
        self.ensure_available()?;
        let mut inner = self.inner.write().await;
        match inner.records.get(id) {
            Some(record)
                if record.state == ItemState::LockedForCreation
                    && record.locked_by == Some(*locker) =>
            {
                Ok(Some(record.clone()))
            }
            Some(_) => Ok(None),
            None => {
                let record = StateRecord {
                    state: ItemState::LockedForCreation,
                    locked_by: Some(*locker),
                    ..StateRecord::pending(*id)
                };
                inner.records.insert(*id, record.clone());
                Ok(Some(record))
            }
        }
    }

    async fn unlock(&self, id: &HashId, locker: &HashId) -> LedgerResult {
        self.ensure_available()?;
        let mut inner = self.inner.write().await;
        let Some(record) = inner.records.get_mut(id) else {
            return Ok(());
        };
        if record.locked_by != Some(*locker) {
            return Ok(());
        }
        match record.state {
            ItemState::Locked => {
                record.state = ItemState::Approved;
                record.locked_by = None;
            }
            ItemState::LockedForCreation => {
                inner.records.remove(id);
            }
            _ => record.locked_by = None,
        }
        Ok(())
    }

    async fn cleanup(&self, now: DateTime<Utc>) -> LedgerResult<usize> {
        self.ensure_available()?;
        let mut inner = self.inner.write().await;
        let before = inner.records.len();
        inner.records.retain(|_, record| !record.is_expired(now));
        Ok(before - inner.records.len())
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use quorum_types::{
        data::{HashId, StateRecord},
        item_state::ItemState,
        traits::ledger::{Ledger, LedgerError, RecordChange, RecordHandle, TestableLedger},
    };

    use super::MemoryLedger;

    async fn approved(ledger: &MemoryLedger) -> HashId {
        let id = HashId::random();
        let record = StateRecord {
            state: ItemState::Approved,
            ..StateRecord::pending(id)
        };
        ledger.save(&record).await.unwrap();
        id
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_find_or_create_creates_once() {
        let ledger = Arc::new(MemoryLedger::construct_tmp_ledger().unwrap());
        let id = HashId::random();
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let ledger = Arc::clone(&ledger);
            tasks.push(tokio::spawn(
                async move { ledger.find_or_create(id).await.unwrap() },
            ));
        }
        let mut created = Vec::new();
        for task in tasks {
            created.push(task.await.unwrap().created_at);
        }
        assert!(created.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(ledger.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn revoke_lock_is_exclusive() {
        let ledger = MemoryLedger::empty();
        let id = approved(&ledger).await;
        let (first, second) = (HashId::random(), HashId::random());

        let locked = ledger.lock_to_revoke(&id, &first).await.unwrap().unwrap();
        assert_eq!(locked.state, ItemState::Locked);
        assert_eq!(locked.locked_by, Some(first));
        assert!(ledger.lock_to_revoke(&id, &second).await.unwrap().is_none());

        // only the owner can release it
        ledger.unlock(&id, &second).await.unwrap();
        let record = ledger.get_record(&id).await.unwrap().unwrap();
        assert_eq!(record.state, ItemState::Locked);
        ledger.unlock(&id, &first).await.unwrap();
        let record = ledger.get_record(&id).await.unwrap().unwrap();
        assert_eq!(record.state, ItemState::Approved);
        assert_eq!(record.locked_by, None);
    }

    #[tokio::test]
    async fn output_lock_reserves_missing_ids_only() {
        let ledger = MemoryLedger::empty();
        let existing = approved(&ledger).await;
        let parent = HashId::random();
        assert!(ledger
            .create_output_lock(&existing, &parent)
            .await
            .unwrap()
            .is_none());

        let fresh = HashId::random();
        let record = ledger
            .create_output_lock(&fresh, &parent)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, ItemState::LockedForCreation);

        // releasing a creation lock returns the id to UNDEFINED
        ledger.unlock(&fresh, &parent).await.unwrap();
        assert!(ledger.get_record(&fresh).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn commit_applies_every_change() {
        let ledger = MemoryLedger::empty();
        let revoked = approved(&ledger).await;
        let dropped = approved(&ledger).await;
        let parent = HashId::random();
        ledger
            .commit(vec![
                RecordChange::Save(StateRecord {
                    state: ItemState::Approved,
                    ..StateRecord::pending(parent)
                }),
                RecordChange::Save(StateRecord {
                    state: ItemState::Revoked,
                    ..StateRecord::pending(revoked)
                }),
                RecordChange::Destroy(dropped),
            ])
            .await
            .unwrap();
        let states: Vec<_> = ledger
            .snapshot()
            .await
            .into_iter()
            .map(|record| (record.id, record.state))
            .collect();
        assert_eq!(states.len(), 2);
        assert!(states.contains(&(parent, ItemState::Approved)));
        assert!(states.contains(&(revoked, ItemState::Revoked)));
    }

    #[tokio::test]
    async fn cleanup_purges_expired_records() {
        let ledger = MemoryLedger::empty();
        let now = Utc::now();
        let keep = approved(&ledger).await;
        let expired = HashId::random();
        ledger
            .save(&StateRecord {
                state: ItemState::Declined,
                expires_at: Some(now - Duration::minutes(1)),
                ..StateRecord::pending(expired)
            })
            .await
            .unwrap();

        assert_eq!(ledger.cleanup(now).await.unwrap(), 1);
        assert!(ledger.get_record(&keep).await.unwrap().is_some());
        assert!(ledger.get_record(&expired).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn handle_buffers_until_saved() {
        let ledger = Arc::new(MemoryLedger::empty());
        let id = HashId::random();
        let mut handle = RecordHandle::find_or_create(&ledger, id).await.unwrap();
        handle.set_state(ItemState::Declined);
        assert_eq!(
            ledger.get_record(&id).await.unwrap().unwrap().state,
            ItemState::Pending
        );
        handle.save().await.unwrap();
        assert_eq!(
            ledger.get_record(&id).await.unwrap().unwrap().state,
            ItemState::Declined
        );

        handle.destroy().await.unwrap();
        let mut stale = RecordHandle::find_or_create(&ledger, id).await.unwrap();
        ledger.destroy(&id).await.unwrap();
        assert!(matches!(
            stale.reload().await,
            Err(LedgerError::RecordNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn unavailable_backend_fails_every_call() {
        let ledger = MemoryLedger::empty();
        ledger.set_unavailable(true);
        assert!(matches!(
            ledger.get_record(&HashId::random()).await,
            Err(LedgerError::Unavailable { .. })
        ));
        ledger.set_unavailable(false);
        assert!(ledger.get_record(&HashId::random()).await.is_ok());
    }
}
