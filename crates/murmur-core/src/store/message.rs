//! Decrypted direct message record

use serde::{Deserialize, Serialize};

use crate::codec::{LegacyMessage, Rumor};
use crate::crypto::Algorithm;
use crate::event::{Event, EventId, Tag};
use crate::identity::Pubkey;

/// A decrypted direct message as it lives in a chat.
///
/// Identity is the `id`; a message id is unique across every chat, which
/// is what makes re-syncing the same relay window idempotent.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct DirectMessage {
    /// Unique message identifier
    pub id: EventId,
    /// True author
    pub author: Pubkey,
    /// True creation timestamp (unix seconds)
    pub created_at: i64,
    /// Decrypted message body
    pub content: String,
    /// Whether the local identity wrote this message
    pub outgoing: bool,
    /// Tags carried by the inner message
    pub tags: Vec<Tag>,
    /// Still waiting for the relay to accept it
    pub pending: bool,
    /// Publish was attempted and failed
    pub failed: bool,
    /// Arrived from the network (as opposed to optimistic local insert)
    pub received: bool,
    /// Seen by the user
    pub read: bool,
    /// Which encryption scheme carried it
    pub algorithm: Algorithm,
}

impl DirectMessage {
    /// Build from an unwrapped envelope rumor.
    pub fn from_rumor(rumor: &Rumor, local: &Pubkey, algorithm: Algorithm) -> Self {
        let outgoing = rumor.pubkey == *local;
        Self {
            id: rumor.id,
            author: rumor.pubkey,
            created_at: rumor.created_at,
            content: rumor.content.clone(),
            outgoing,
            tags: rumor.tags.clone(),
            pending: false,
            failed: false,
            received: true,
            // Our own messages never count as unread.
            read: outgoing,
            algorithm,
        }
    }

    /// Build from a decrypted flat legacy event.
    pub fn from_legacy(event: &Event, decrypted: &LegacyMessage, local: &Pubkey) -> Self {
        let outgoing = event.pubkey == *local;
        Self {
            id: event.id,
            author: event.pubkey,
            created_at: event.created_at,
            content: decrypted.content.clone(),
            outgoing,
            tags: event.tags.clone(),
            pending: false,
            failed: false,
            received: true,
            read: outgoing,
            algorithm: Algorithm::Legacy,
        }
    }

    /// Build the optimistic local copy of a message being sent.
    pub fn outgoing_pending(rumor: &Rumor) -> Self {
        Self {
            id: rumor.id,
            author: rumor.pubkey,
            created_at: rumor.created_at,
            content: rumor.content.clone(),
            outgoing: true,
            tags: rumor.tags.clone(),
            pending: true,
            failed: false,
            received: false,
            read: true,
            algorithm: Algorithm::Modern,
        }
    }

    /// Whether this message counts toward a chat's unread total.
    pub fn counts_unread(&self) -> bool {
        self.received && !self.outgoing && !self.read
    }
}
