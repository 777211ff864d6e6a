//! Network message types
//!
//! This module contains types used to represent the messages nodes exchange about items.

use std::{fmt, sync::Arc};

use crate::{
    data::{HashId, NodeId, Vote},
    item_state::ItemState,
    traits::item::Item,
};

/// Incoming message
#[derive(Clone, Debug)]
pub struct Message {
    /// The sender of this message
    pub sender: NodeId,

    /// The message kind
    pub kind: MessageKind,
}

/// Enum representation of any message type
#[derive(Clone)]
pub enum MessageKind {
    /// The sender's own vote on an item, together with a request for the recipient's vote.
    ///
    /// The item travels with the request so the recipient can check it locally.
    VoteRequest {
        /// The item being elected
        item: Arc<dyn Item>,
        /// The sender's opinion
        vote: Vote,
    },
    /// Reply to a vote request
    Vote(Vote),
    /// Ask for the state the recipient has recorded for an item
    StateQuery {
        /// The item in question
        item_id: HashId,
    },
    /// Reply to a state query
    StateReply {
        /// The item in question
        item_id: HashId,
        /// Its state in the sender's ledger
        state: ItemState,
    },
}

impl MessageKind {
    /// The item this message is about
    #[must_use]
    pub fn item_id(&self) -> HashId {
        match self {
            MessageKind::VoteRequest { vote, .. } | MessageKind::Vote(vote) => vote.item_id,
            MessageKind::StateQuery { item_id } | MessageKind::StateReply { item_id, .. } => {
                *item_id
            }
        }
    }
}

impl fmt::Debug for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::VoteRequest { vote, .. } => f
                .debug_struct("VoteRequest")
                .field("item_id", &vote.item_id)
                .field("opinion", &vote.opinion)
                .finish(),
            MessageKind::Vote(vote) => f
                .debug_struct("Vote")
                .field("item_id", &vote.item_id)
                .field("opinion", &vote.opinion)
                .finish(),
            MessageKind::StateQuery { item_id } => {
                f.debug_struct("StateQuery").field("item_id", item_id).finish()
            }
            MessageKind::StateReply { item_id, state } => f
                .debug_struct("StateReply")
                .field("item_id", item_id)
                .field("state", state)
                .finish(),
        }
    }
}
