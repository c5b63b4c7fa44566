//! Murmur Core Library
//!
//! Encrypted direct messaging over a network of independent relay
//! servers. Messages travel as three nested records (rumor, seal,
//! envelope) authored by a single-use key, so relays learn neither the
//! sender nor the true send time; an older single-layer format is still
//! read and written for counterparties that never upgraded.
//!
//! ## Core pieces
//!
//! - [`CryptoEnvelope`]: the two encryption algorithms with
//!   auto-negotiation, optionally delegated to an external key holder
//! - [`codec`]: builds and unwraps the three-layer envelope
//! - [`DecryptScheduler`]: serializes decrypts that may prompt the user
//! - [`ChatStore`]: copy-on-write conversation map with global message
//!   dedup and read-state tracking
//! - [`SyncController`]: incremental and paginated sync sweeps against
//!   the relay collaborator
//!
//! ## Quick Start
//!
//! ```ignore
//! use murmur_core::{Identity, MemoryRelay, MurmurEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let relay = MemoryRelay::new();
//!     let engine = MurmurEngine::new(Identity::generate(), relay);
//!
//!     engine.send_message(&friend_pubkey, "hello").await?;
//!     engine.sync().await?;
//!
//!     for chat in engine.chats() {
//!         println!("{}: {} unread", chat.counterparty, chat.unread_count);
//!     }
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod event;
pub mod identity;
pub mod relay;
pub mod scheduler;
pub mod storage;
pub mod store;
pub mod sync;

// Re-exports
pub use codec::{EnvelopePair, LegacyMessage, Rumor, Unwrapped};
pub use crypto::{Algorithm, CryptoEnvelope, SignerAuthority};
pub use engine::MurmurEngine;
pub use error::{MurmurError, MurmurResult};
pub use event::{Event, EventId, Kind, Tag};
pub use identity::{Identity, Pubkey};
pub use relay::{Filter, MemoryRelay, Relay, RelayUpdate, SubscriptionHandle};
pub use scheduler::{DecryptScheduler, UnwrapJob};
pub use storage::{MemoryMessageStore, MessageStore, RedbMessageStore};
pub use store::{Chat, ChatEvent, ChatMap, ChatStore, DirectMessage};
pub use sync::{SyncController, PAGE_SIZE};
