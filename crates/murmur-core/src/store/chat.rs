//! A single conversation thread

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::event::EventId;
use crate::identity::Pubkey;
use crate::store::DirectMessage;

/// A conversation with one counterparty.
///
/// There is exactly one chat per counterparty no matter which encryption
/// scheme individual messages used; legacy and modern traffic merge into
/// the same thread.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Chat {
    /// The other participant; also the chat's identity
    pub counterparty: Pubkey,
    /// Count of received, unread, inbound messages
    pub unread_count: usize,
    /// Id of the newest message by `created_at`
    pub last_message_id: Option<EventId>,
    /// True once any contained message used the legacy scheme
    pub has_legacy: bool,
    /// Hidden from the chat list by the user
    pub hidden: bool,
    /// All messages, keyed by id
    pub messages: HashMap<EventId, DirectMessage>,
}

impl Chat {
    /// Create an empty chat for a counterparty.
    pub fn new(counterparty: Pubkey) -> Self {
        Self {
            counterparty,
            unread_count: 0,
            last_message_id: None,
            has_legacy: false,
            hidden: false,
            messages: HashMap::new(),
        }
    }

    /// The newest message, if any.
    pub fn last_message(&self) -> Option<&DirectMessage> {
        self.last_message_id.and_then(|id| self.messages.get(&id))
    }

    /// Timestamp of the newest message, or 0 for an empty chat.
    pub fn last_activity(&self) -> i64 {
        self.last_message().map(|m| m.created_at).unwrap_or(0)
    }

    /// Messages ordered oldest-first by `created_at`, with the message id
    /// as a deterministic tie-break.
    pub fn sorted_messages(&self) -> Vec<&DirectMessage> {
        let mut messages: Vec<&DirectMessage> = self.messages.values().collect();
        messages.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.as_bytes().cmp(b.id.as_bytes()))
        });
        messages
    }

    /// Number of messages in the chat.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the chat has no messages.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Recompute the newest-message pointer after an insert.
    pub(crate) fn refresh_last_message(&mut self, candidate: EventId) {
        let replace = match self.last_message() {
            None => true,
            Some(current) => {
                let new = &self.messages[&candidate];
                (new.created_at, new.id.as_bytes()) > (current.created_at, current.id.as_bytes())
            }
        };
        if replace {
            self.last_message_id = Some(candidate);
        }
    }
}
