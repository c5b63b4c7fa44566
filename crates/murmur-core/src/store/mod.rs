//! Conversation state: the authoritative chat map
//!
//! [`ChatStore`] owns every conversation for the active account. All
//! mutation funnels through a handful of entry points that rebuild the
//! chat map and publish it atomically (copy-on-write): readers grab an
//! `Arc` snapshot and never observe a half-applied change, so no reader
//! ever needs a lock across its own work.
//!
//! Dedup is global, not per-chat: a message id that exists anywhere in
//! the store is never added again. Re-running a sync over an unchanged
//! relay window is therefore a no-op by construction.
//!
//! Consumers that render the chat list subscribe to [`ChatEvent`]
//! notifications over a broadcast channel instead of polling.

mod chat;
mod message;

pub use chat::Chat;
pub use message::DirectMessage;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::crypto::Algorithm;
use crate::error::MurmurResult;
use crate::event::EventId;
use crate::identity::Pubkey;
use crate::storage::MessageStore;

/// Capacity of the change-notification channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Immutable snapshot of every conversation.
#[derive(Clone, Debug, Default)]
pub struct ChatMap {
    /// One chat per counterparty
    pub chats: HashMap<Pubkey, Chat>,
    /// Every message id present in any chat
    pub seen: HashSet<EventId>,
}

/// Change notifications emitted by the store.
#[derive(Clone, Debug)]
pub enum ChatEvent {
    /// A new message landed in a chat
    MessageAdded {
        /// The chat that changed
        chat: Pubkey,
        /// The new message
        message: EventId,
    },
    /// A chat's messages were all marked read
    ChatRead {
        /// The chat that changed
        chat: Pubkey,
    },
    /// A chat's hidden flag changed
    ChatHidden {
        /// The chat that changed
        chat: Pubkey,
        /// The new hidden state
        hidden: bool,
    },
}

/// Owner of the conversation map for one account.
pub struct ChatStore {
    local: Pubkey,
    snapshot: RwLock<Arc<ChatMap>>,
    events: broadcast::Sender<ChatEvent>,
    persistence: Option<Arc<dyn MessageStore>>,
}

impl ChatStore {
    /// Create an empty in-memory store.
    pub fn new(local: Pubkey) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            local,
            snapshot: RwLock::new(Arc::new(ChatMap::default())),
            events,
            persistence: None,
        }
    }

    /// Create a store mirroring every change into `persistence`, and load
    /// previously stored chats.
    pub fn with_persistence(local: Pubkey, persistence: Arc<dyn MessageStore>) -> MurmurResult<Self> {
        let store = Self {
            persistence: Some(persistence.clone()),
            ..Self::new(local)
        };

        for (counterparty, messages, hidden) in persistence.load_chats()? {
            for message in messages {
                store.insert(&counterparty, message, false);
            }
            if hidden {
                let mut guard = store.snapshot.write();
                let mut map = ChatMap::clone(&guard);
                if let Some(chat) = map.chats.get_mut(&counterparty) {
                    chat.hidden = true;
                }
                *guard = Arc::new(map);
            }
        }
        Ok(store)
    }

    /// The local account this store belongs to.
    pub fn local(&self) -> Pubkey {
        self.local
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// Current immutable snapshot of every chat.
    pub fn snapshot(&self) -> Arc<ChatMap> {
        self.snapshot.read().clone()
    }

    /// Add a message to a counterparty's chat.
    ///
    /// The single mutation entry point for new messages. No-ops (with a
    /// log line) on duplicate ids and invalid counterparties. Returns
    /// whether the message was actually added.
    pub fn add_message(&self, counterparty: &Pubkey, message: DirectMessage) -> bool {
        self.insert(counterparty, message, true)
    }

    fn insert(&self, counterparty: &Pubkey, message: DirectMessage, persist: bool) -> bool {
        if *counterparty == Pubkey::ZERO || *counterparty == self.local {
            warn!(%counterparty, "refusing to file message under invalid counterparty");
            return false;
        }

        let event = {
            let mut guard = self.snapshot.write();
            if guard.seen.contains(&message.id) {
                debug!(message = %message.id, "duplicate message ignored");
                return false;
            }

            let mut map = ChatMap::clone(&guard);
            map.seen.insert(message.id);

            let chat = map
                .chats
                .entry(*counterparty)
                .or_insert_with(|| Chat::new(*counterparty));

            if message.counts_unread() {
                chat.unread_count += 1;
            }
            if message.algorithm == Algorithm::Legacy {
                chat.has_legacy = true;
            }
            // A new message always surfaces a chat the user had hidden.
            chat.hidden = false;

            let id = message.id;
            if persist {
                if let Some(persistence) = &self.persistence {
                    if let Err(err) = persistence.save_message(counterparty, &message) {
                        warn!(message = %id, error = %err, "failed to persist message");
                    }
                }
            }
            chat.messages.insert(id, message);
            chat.refresh_last_message(id);

            *guard = Arc::new(map);
            ChatEvent::MessageAdded {
                chat: *counterparty,
                message: id,
            }
        };

        let _ = self.events.send(event);
        true
    }

    /// Mark every inbound message in a chat read and zero its unread
    /// count, in memory and in the persisted store together.
    pub fn mark_chat_as_read(&self, counterparty: &Pubkey) -> MurmurResult<()> {
        {
            let mut guard = self.snapshot.write();
            if !guard.chats.contains_key(counterparty) {
                return Ok(());
            }

            if let Some(persistence) = &self.persistence {
                persistence.mark_chat_read(counterparty)?;
            }

            let mut map = ChatMap::clone(&guard);
            let chat = map
                .chats
                .get_mut(counterparty)
                .expect("presence checked above");
            chat.unread_count = 0;
            for message in chat.messages.values_mut() {
                if !message.outgoing {
                    message.read = true;
                }
            }
            *guard = Arc::new(map);
        }

        let _ = self.events.send(ChatEvent::ChatRead { chat: *counterparty });
        Ok(())
    }

    /// Hide a chat from the conversation list (user-initiated; the only
    /// way a chat leaves the list).
    pub fn hide_chat(&self, counterparty: &Pubkey, hidden: bool) -> MurmurResult<()> {
        {
            let mut guard = self.snapshot.write();
            if !guard.chats.contains_key(counterparty) {
                return Ok(());
            }

            if let Some(persistence) = &self.persistence {
                persistence.hide_chat(counterparty, hidden)?;
            }

            let mut map = ChatMap::clone(&guard);
            map.chats
                .get_mut(counterparty)
                .expect("presence checked above")
                .hidden = hidden;
            *guard = Arc::new(map);
        }

        let _ = self.events.send(ChatEvent::ChatHidden {
            chat: *counterparty,
            hidden,
        });
        Ok(())
    }

    /// Update the delivery flags of an optimistic outgoing message.
    pub fn set_delivery_state(
        &self,
        counterparty: &Pubkey,
        message: &EventId,
        pending: bool,
        failed: bool,
    ) {
        let mut guard = self.snapshot.write();
        let mut map = ChatMap::clone(&guard);
        let Some(chat) = map.chats.get_mut(counterparty) else {
            return;
        };
        let Some(message) = chat.messages.get_mut(message) else {
            return;
        };
        message.pending = pending;
        message.failed = failed;
        *guard = Arc::new(map);
    }

    /// Get a chat by counterparty.
    pub fn chat(&self, counterparty: &Pubkey) -> Option<Chat> {
        self.snapshot.read().chats.get(counterparty).cloned()
    }

    /// Messages of a chat ordered oldest-first.
    pub fn chat_messages(&self, counterparty: &Pubkey) -> Vec<DirectMessage> {
        self.snapshot
            .read()
            .chats
            .get(counterparty)
            .map(|chat| chat.sorted_messages().into_iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Visible chats ordered by newest activity first.
    ///
    /// Equal timestamps fall back to the counterparty key so the order is
    /// deterministic.
    pub fn sorted_chats(&self) -> Vec<Chat> {
        let snapshot = self.snapshot.read();
        let mut chats: Vec<Chat> = snapshot
            .chats
            .values()
            .filter(|chat| !chat.hidden)
            .cloned()
            .collect();
        chats.sort_by(|a, b| {
            b.last_activity()
                .cmp(&a.last_activity())
                .then_with(|| b.counterparty.cmp(&a.counterparty))
        });
        chats
    }

    /// Sum of unread counts across all visible chats.
    pub fn total_unread(&self) -> usize {
        self.snapshot
            .read()
            .chats
            .values()
            .filter(|chat| !chat.hidden)
            .map(|chat| chat.unread_count)
            .sum()
    }
}

impl std::fmt::Debug for ChatStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot.read();
        f.debug_struct("ChatStore")
            .field("local", &self.local)
            .field("chats", &snapshot.chats.len())
            .field("messages", &snapshot.seen.len())
            .finish()
    }
}
