//! Abstract ledger holding one state record per item
//!
//! This module provides the [`Ledger`] trait, consumed by elections and resync processes, and the
//! [`RecordHandle`] convenience wrapper offering the buffered `set_state`/`save` style of access.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::Snafu;

use crate::{
    data::{HashId, StateRecord},
    item_state::ItemState,
};

/// Errors that can occur in the ledger
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LedgerError {
    /// The backing store cannot be reached
    #[snafu(display("ledger unavailable: {reason}"))]
    Unavailable {
        /// What the backend reported
        reason: String,
    },
    /// A handle operation needs a record that does not exist
    #[snafu(display("no ledger record for {id}"))]
    RecordNotFound {
        /// The missing record
        id: HashId,
    },
}

/// Result for a ledger operation
pub type LedgerResult<T = ()> = std::result::Result<T, LedgerError>;

/// One write applied as part of an atomic [`Ledger::commit`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordChange {
    /// Write the record as given
    Save(StateRecord),
    /// Remove the record, returning its item to `UNDEFINED`
    Destroy(HashId),
}

/// Durable per-item state records.
///
/// Implementations must serialize concurrent operations on the same id and must guarantee that a
/// completed write is visible to every subsequent read made through the same ledger.
#[async_trait]
pub trait Ledger: Send + Sync + 'static {
    /// Return the existing record or create a `PENDING` one. Only one of several concurrent
    /// callers for the same id creates the record.
    async fn find_or_create(&self, id: HashId) -> LedgerResult<StateRecord>;

    /// Return the record of the item, if any
    async fn get_record(&self, id: &HashId) -> LedgerResult<Option<StateRecord>>;

    /// Write a record, replacing any record with the same id
    async fn save(&self, record: &StateRecord) -> LedgerResult;

    /// Remove a record. Removing a missing record is not an error.
    async fn destroy(&self, id: &HashId) -> LedgerResult;

    /// Apply all changes as one write: either every change is visible or none is
    async fn commit(&self, changes: Vec<RecordChange>) -> LedgerResult;

    /// Atomically move an `APPROVED` record to `LOCKED`, held by `locker`.
    ///
    /// Returns the locked record, or `None` when the record is missing or not approved.
    async fn lock_to_revoke(&self, id: &HashId, locker: &HashId)
        -> LedgerResult<Option<StateRecord>>;

    /// Atomically create a `LOCKED_FOR_CREATION` record held by `locker`.
    ///
    /// Returns the new record, or `None` when any record already exists for the id.
    async fn create_output_lock(
        &self,
        id: &HashId,
        locker: &HashId,
    ) -> LedgerResult<Option<StateRecord>>;

    /// Release a hold taken by `locker`: `LOCKED` goes back to `APPROVED`, `LOCKED_FOR_CREATION`
    /// is destroyed. Records held by someone else are left alone.
    async fn unlock(&self, id: &HashId, locker: &HashId) -> LedgerResult;

    /// Purge every record expired at `now`, returning how many were removed
    async fn cleanup(&self, now: DateTime<Utc>) -> LedgerResult<usize>;
}

/// Extra functionality required by the test harness
#[async_trait]
pub trait TestableLedger: Ledger + Sized {
    /// Create an empty, throwaway ledger
    ///
    /// # Errors
    /// If the backing store cannot be set up
    fn construct_tmp_ledger() -> LedgerResult<Self>;

    /// Every record currently held, in id order
    async fn snapshot(&self) -> Vec<StateRecord>;
}

/// A record together with the ledger it lives in.
///
/// Changes made with [`set_state`](RecordHandle::set_state) are buffered until
/// [`save`](RecordHandle::save) is awaited.
#[derive(Debug)]
pub struct RecordHandle<L: Ledger + ?Sized> {
    /// The owning ledger
    ledger: Arc<L>,
    /// Local, possibly unsaved, copy of the record
    record: StateRecord,
}

impl<L: Ledger + ?Sized> RecordHandle<L> {
    /// Find the record of `id`, creating a `PENDING` one if needed
    ///
    /// # Errors
    /// If the ledger fails
    pub async fn find_or_create(ledger: &Arc<L>, id: HashId) -> LedgerResult<Self> {
        let record = ledger.find_or_create(id).await?;
        Ok(Self {
            ledger: Arc::clone(ledger),
            record,
        })
    }

    /// Get a handle on an existing record
    ///
    /// # Errors
    /// If the ledger fails
    pub async fn get(ledger: &Arc<L>, id: &HashId) -> LedgerResult<Option<Self>> {
        Ok(ledger.get_record(id).await?.map(|record| Self {
            ledger: Arc::clone(ledger),
            record,
        }))
    }

    /// Id of the record
    #[must_use]
    pub fn id(&self) -> HashId {
        self.record.id
    }

    /// Current (possibly unsaved) state
    #[must_use]
    pub fn state(&self) -> ItemState {
        self.record.state
    }

    /// Current (possibly unsaved) record
    #[must_use]
    pub fn record(&self) -> &StateRecord {
        &self.record
    }

    /// Buffer a state change
    pub fn set_state(&mut self, state: ItemState) -> &mut Self {
        self.record.state = state;
        self
    }

    /// Buffer an expiration change
    pub fn set_expires_at(&mut self, expires_at: Option<DateTime<Utc>>) -> &mut Self {
        self.record.expires_at = expires_at;
        self
    }

    /// Commit the buffered changes
    ///
    /// # Errors
    /// If the ledger fails
    pub async fn save(&mut self) -> LedgerResult {
        self.ledger.save(&self.record).await
    }

    /// Remove the record, returning the item to `UNDEFINED`
    ///
    /// # Errors
    /// If the ledger fails
    pub async fn destroy(self) -> LedgerResult {
        self.ledger.destroy(&self.record.id).await
    }

    /// Discard buffered changes and read the record again
    ///
    /// # Errors
    /// [`LedgerError::RecordNotFound`] if the record was destroyed in the meantime
    pub async fn reload(&mut self) -> LedgerResult<&mut Self> {
        let id = self.record.id;
        self.record = self
            .ledger
            .get_record(&id)
            .await?
            .ok_or(LedgerError::RecordNotFound { id })?;
        Ok(self)
    }
}
