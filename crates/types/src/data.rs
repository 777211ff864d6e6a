//! Provides the data types shared by the consensus core
//!
//! - [`HashId`]: the content hash identifying an item
//! - [`StateRecord`]: the ledger row holding the state of one item
//! - [`Vote`]: a single node's opinion about an item
//! - [`ItemResult`]: what callers get back when they ask about an item

use std::fmt::{self, Debug, Display};

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::item_state::ItemState;

/// Length, in bytes, of a [`HashId`]
pub const HASH_ID_LEN: usize = 32;

/// Content hash identifying a versioned item. Equality is by hash value.
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HashId([u8; HASH_ID_LEN]);

impl HashId {
    /// Hash the given content
    #[must_use]
    pub fn of(content: &[u8]) -> Self {
        let digest = Sha256::digest(content);
        let mut bytes = [0u8; HASH_ID_LEN];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// An id for content nobody has: random bytes, hashed
    #[must_use]
    pub fn random() -> Self {
        let mut seed = [0u8; 64];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::of(&seed)
    }

    /// Wrap an existing digest
    #[must_use]
    pub const fn from_bytes(bytes: [u8; HASH_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; HASH_ID_LEN] {
        &self.0
    }
}

impl Display for HashId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // short form is enough to tell items apart in logs
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Debug for HashId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashId({self})")
    }
}

/// Index of a node in the network
#[derive(
    Copy, Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct NodeId(pub u64);

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node_{}", self.0)
    }
}

/// A node's verdict on an item
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum Opinion {
    /// The node would approve the item
    Positive,
    /// The node would decline the item
    Negative,
}

impl Opinion {
    /// The pending state a node records while it holds this opinion
    #[must_use]
    pub fn pending_state(self) -> ItemState {
        match self {
            Opinion::Positive => ItemState::PendingPositive,
            Opinion::Negative => ItemState::PendingNegative,
        }
    }

    /// The opinion implied by a recorded state, if that state carries one
    #[must_use]
    pub fn from_state(state: ItemState) -> Option<Self> {
        match state {
            ItemState::Approved | ItemState::PendingPositive => Some(Opinion::Positive),
            ItemState::Declined | ItemState::Revoked | ItemState::PendingNegative => {
                Some(Opinion::Negative)
            }
            _ => None,
        }
    }
}

/// One node's opinion about one item. Never persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    /// The item voted on
    pub item_id: HashId,
    /// Who voted
    pub voter: NodeId,
    /// What they think
    pub opinion: Opinion,
    /// When the opinion was formed
    pub timestamp: DateTime<Utc>,
}

impl Vote {
    /// Create a vote stamped with the current time
    #[must_use]
    pub fn new(item_id: HashId, voter: NodeId, opinion: Opinion) -> Self {
        Self {
            item_id,
            voter,
            opinion,
            timestamp: Utc::now(),
        }
    }
}

/// Persisted state of one item, owned by the ledger
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    /// The item this record describes
    pub id: HashId,
    /// Current state
    pub state: ItemState,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// When the record may be purged from the ledger
    pub expires_at: Option<DateTime<Utc>>,
    /// The item holding this record in `LOCKED` or `LOCKED_FOR_CREATION`
    pub locked_by: Option<HashId>,
}

impl StateRecord {
    /// A fresh `PENDING` record
    #[must_use]
    pub fn pending(id: HashId) -> Self {
        Self {
            id,
            state: ItemState::Pending,
            created_at: Utc::now(),
            expires_at: None,
            locked_by: None,
        }
    }

    /// Whether the record has outlived its expiration at `now`
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

/// Category of a validation failure
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The item's own check failed
    Failure,
    /// A referenced item is not in an acceptable state
    BadRef,
    /// An item to be revoked is missing or cannot be locked
    BadRevoke,
    /// An item to be created already has a record
    NewItemExists,
    /// An item to be created failed its own check
    BadNewItem,
    /// The item is in a state that does not allow the operation
    BadState,
    /// The item or one of its parts expired
    Expired,
}

/// A validation failure attached to an item
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// What went wrong
    pub error: ErrorCode,
    /// Which object it concerns
    pub object_name: String,
    /// Human readable details
    pub message: String,
}

impl ErrorRecord {
    /// Build an error record
    pub fn new(error: ErrorCode, object_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error,
            object_name: object_name.into(),
            message: message.into(),
        }
    }
}

impl Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} in {}: {}", self.error, self.object_name, self.message)
    }
}

/// Answer to a caller asking about an item
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResult {
    /// State of the item on the answering node
    pub state: ItemState,
    /// Whether the node holds a copy of the item itself
    pub have_copy: bool,
    /// When the ledger record was created
    pub created_at: Option<DateTime<Utc>>,
    /// When the ledger record expires
    pub expires_at: Option<DateTime<Utc>>,
    /// Validation failures collected while processing the item
    pub errors: Vec<ErrorRecord>,
}

impl ItemResult {
    /// The result for an item the node has no record of
    #[must_use]
    pub fn undefined() -> Self {
        Self {
            state: ItemState::Undefined,
            have_copy: false,
            created_at: None,
            expires_at: None,
            errors: Vec::new(),
        }
    }

    /// The result describing a ledger record
    #[must_use]
    pub fn from_record(record: &StateRecord, have_copy: bool) -> Self {
        Self {
            state: record.state,
            have_copy,
            created_at: Some(record.created_at),
            expires_at: record.expires_at,
            errors: Vec::new(),
        }
    }

    /// Attach validation errors
    #[must_use]
    pub fn with_errors(mut self, errors: Vec<ErrorRecord>) -> Self {
        self.errors = errors;
        self
    }
}

impl Display for ItemResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ItemResult<{}", self.state)?;
        if let Some(created_at) = self.created_at {
            write!(f, " created {created_at}")?;
        }
        if let Some(expires_at) = self.expires_at {
            write!(f, " expires {expires_at}")?;
        }
        if !self.errors.is_empty() {
            write!(f, " errors: {}", self.errors.len())?;
        }
        f.write_str(">")
    }
}
