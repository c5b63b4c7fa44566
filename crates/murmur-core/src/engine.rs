//! Engine facade wiring the messaging subsystem together
//!
//! [`MurmurEngine`] owns one account's crypto front-end, decryption
//! queue, chat store, and sync controller, and exposes the operations a
//! client shell needs: send, sync, paginate, mark read, query chats,
//! subscribe to changes.
//!
//! ```ignore
//! use murmur_core::{Identity, MemoryRelay, MurmurEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let relay = MemoryRelay::new();
//!     let engine = MurmurEngine::new(Identity::generate(), relay);
//!
//!     engine.send_message(&friend, "hello").await?;
//!     engine.sync().await?;
//!
//!     for chat in engine.chats() {
//!         println!("{}: {} unread", chat.counterparty, chat.unread_count);
//!     }
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::codec::{self, EnvelopePair};
use crate::crypto::{Algorithm, CryptoEnvelope, SignerAuthority};
use crate::error::{MurmurError, MurmurResult};
use crate::event::{Event, EventId, Kind, Tag};
use crate::identity::{Identity, Pubkey};
use crate::relay::Relay;
use crate::scheduler::DecryptScheduler;
use crate::storage::MessageStore;
use crate::store::{Chat, ChatEvent, ChatStore, DirectMessage};
use crate::sync::SyncController;

/// Facade over the direct-messaging subsystem for one account.
pub struct MurmurEngine {
    crypto: Arc<CryptoEnvelope>,
    scheduler: Arc<DecryptScheduler>,
    chats: Arc<ChatStore>,
    sync: SyncController,
    relay: Arc<dyn Relay>,
}

impl MurmurEngine {
    /// Create an engine for a locally held identity, in-memory only.
    pub fn new(identity: Identity, relay: Arc<dyn Relay>) -> Self {
        let crypto = Arc::new(CryptoEnvelope::local(identity));
        let chats = Arc::new(ChatStore::new(crypto.pubkey()));
        Self::assemble(crypto, chats, relay)
    }

    /// Create an engine for a locally held identity with persistent
    /// message storage, loading previously stored chats.
    pub fn with_persistence(
        identity: Identity,
        relay: Arc<dyn Relay>,
        storage: Arc<dyn MessageStore>,
    ) -> MurmurResult<Self> {
        let crypto = Arc::new(CryptoEnvelope::local(identity));
        let chats = Arc::new(ChatStore::with_persistence(crypto.pubkey(), storage)?);
        Ok(Self::assemble(crypto, chats, relay))
    }

    /// Create an engine for an account whose keys live in an external
    /// authority. Inbound decryption is serialized through the queue.
    pub fn delegated(
        pubkey: Pubkey,
        authority: Arc<dyn SignerAuthority>,
        relay: Arc<dyn Relay>,
    ) -> Self {
        let crypto = Arc::new(CryptoEnvelope::delegated(pubkey, authority));
        let chats = Arc::new(ChatStore::new(pubkey));
        Self::assemble(crypto, chats, relay)
    }

    fn assemble(crypto: Arc<CryptoEnvelope>, chats: Arc<ChatStore>, relay: Arc<dyn Relay>) -> Self {
        let scheduler = Arc::new(DecryptScheduler::new(crypto.clone()));
        let sync = SyncController::new(
            crypto.clone(),
            scheduler.clone(),
            chats.clone(),
            relay.clone(),
        );
        Self {
            crypto,
            scheduler,
            chats,
            sync,
            relay,
        }
    }

    /// The account's public key.
    pub fn pubkey(&self) -> Pubkey {
        self.crypto.pubkey()
    }

    /// Send a sealed message to `recipient`.
    ///
    /// Builds the envelope pair, files an optimistic pending copy into
    /// the chat, publishes both envelopes, then settles the delivery
    /// flags. Returns the message id.
    pub async fn send_message(&self, recipient: &Pubkey, content: &str) -> MurmurResult<EventId> {
        self.validate_recipient(recipient)?;
        let EnvelopePair {
            rumor,
            recipient_envelope,
            self_envelope,
        } = codec::build_envelope(content, recipient, &self.crypto).await?;

        let message = DirectMessage::outgoing_pending(&rumor);
        let id = message.id;
        self.chats.add_message(recipient, message);

        let published = self.relay.publish(recipient_envelope).await;
        // The self copy is best-effort; other sessions just miss it.
        if let Err(err) = self.relay.publish(self_envelope).await {
            debug!(message = %id, error = %err, "self copy publish failed");
        }

        match published {
            Ok(()) => {
                self.chats.set_delivery_state(recipient, &id, false, false);
                Ok(id)
            }
            Err(err) => {
                warn!(message = %id, error = %err, "message publish failed");
                self.chats.set_delivery_state(recipient, &id, false, true);
                Err(err)
            }
        }
    }

    /// Send a flat legacy message, for counterparties that never
    /// upgraded past the old scheme.
    pub async fn send_legacy(&self, recipient: &Pubkey, content: &str) -> MurmurResult<EventId> {
        self.validate_recipient(recipient)?;
        let ciphertext = self
            .crypto
            .encrypt(content, recipient, Algorithm::Legacy)
            .await?;
        let identity = self.crypto.identity().ok_or_else(|| {
            MurmurError::KeyUnavailable("sending requires a local private key".to_string())
        })?;
        let event = Event::sign_new(
            identity,
            chrono::Utc::now().timestamp(),
            Kind::LEGACY_DM,
            vec![Tag::recipient(recipient)],
            ciphertext,
        )?;
        let id = event.id;

        let decrypted = codec::LegacyMessage {
            counterparty: *recipient,
            content: content.to_string(),
        };
        let mut message = DirectMessage::from_legacy(&event, &decrypted, &self.pubkey());
        message.received = false;
        self.chats.add_message(recipient, message);

        self.relay.publish(event).await?;
        Ok(id)
    }

    /// Run an incremental sync pass.
    pub async fn sync(&self) -> MurmurResult<()> {
        self.sync.load().await
    }

    /// Page backwards through older history. Returns whether more pages
    /// may still exist.
    pub async fn load_older(&self) -> MurmurResult<bool> {
        self.sync.load_more().await
    }

    /// Whether a sync pass is currently running.
    pub fn is_syncing(&self) -> bool {
        self.sync.is_loading()
    }

    /// Visible chats, newest activity first.
    pub fn chats(&self) -> Vec<Chat> {
        self.chats.sorted_chats()
    }

    /// One chat by counterparty.
    pub fn chat(&self, counterparty: &Pubkey) -> Option<Chat> {
        self.chats.chat(counterparty)
    }

    /// Messages of a chat, oldest first.
    pub fn messages(&self, counterparty: &Pubkey) -> Vec<DirectMessage> {
        self.chats.chat_messages(counterparty)
    }

    /// Mark a whole chat read.
    pub fn mark_read(&self, counterparty: &Pubkey) -> MurmurResult<()> {
        self.chats.mark_chat_as_read(counterparty)
    }

    /// Hide or unhide a chat.
    pub fn hide_chat(&self, counterparty: &Pubkey, hidden: bool) -> MurmurResult<()> {
        self.chats.hide_chat(counterparty, hidden)
    }

    /// Total unread count across visible chats.
    pub fn total_unread(&self) -> usize {
        self.chats.total_unread()
    }

    /// Subscribe to chat change notifications.
    pub fn events(&self) -> broadcast::Receiver<ChatEvent> {
        self.chats.subscribe()
    }

    /// Direct access to the chat store (for embedding in a larger app).
    pub fn chat_store(&self) -> Arc<ChatStore> {
        self.chats.clone()
    }

    /// Tear down interactive work: every queued decrypt is rejected.
    ///
    /// Called on logout or when the conversation view goes away.
    pub fn shutdown(&self) {
        self.scheduler.clear();
    }

    fn validate_recipient(&self, recipient: &Pubkey) -> MurmurResult<()> {
        if *recipient == Pubkey::ZERO || *recipient == self.pubkey() {
            return Err(MurmurError::InvalidCounterparty(recipient.to_hex()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for MurmurEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MurmurEngine")
            .field("pubkey", &self.pubkey())
            .field("sync", &self.sync)
            .finish()
    }
}
