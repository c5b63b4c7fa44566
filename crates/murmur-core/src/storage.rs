//! Persistent message storage using redb
//!
//! The chat store mirrors every accepted message into a
//! [`MessageStore`], keyed by (local identity, chat, message id), and
//! bulk-loads it again on cold start. Storage keeps its own existence
//! check so re-saving a known id is a cheap no-op, independent of the
//! in-memory dedup.
//!
//! [`RedbMessageStore`] is the on-disk implementation;
//! [`MemoryMessageStore`] backs tests.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::error::{MurmurError, MurmurResult};
use crate::event::EventId;
use crate::identity::Pubkey;
use crate::store::DirectMessage;

// Table definitions
const MESSAGES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("messages");
const SEEN_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("seen_ids");
const CHAT_META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("chat_meta");

/// Persistence collaborator for decrypted messages and chat flags.
pub trait MessageStore: Send + Sync {
    /// Save one message under its chat. Saving a known id is a no-op.
    fn save_message(&self, chat: &Pubkey, message: &DirectMessage) -> MurmurResult<()>;

    /// Whether a message id was ever stored for this account.
    fn contains(&self, id: &EventId) -> MurmurResult<bool>;

    /// Flag every inbound message of a chat as read.
    fn mark_chat_read(&self, chat: &Pubkey) -> MurmurResult<()>;

    /// Persist a chat's hidden flag.
    fn hide_chat(&self, chat: &Pubkey, hidden: bool) -> MurmurResult<()>;

    /// Load every stored chat: (counterparty, messages, hidden).
    fn load_chats(&self) -> MurmurResult<Vec<(Pubkey, Vec<DirectMessage>, bool)>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ChatMeta {
    hidden: bool,
}

/// On-disk message store backed by redb.
#[derive(Clone)]
pub struct RedbMessageStore {
    db: Arc<RwLock<Database>>,
    local: Pubkey,
}

impl RedbMessageStore {
    /// Open (or create) the database at `path` for one account.
    pub fn new(path: impl AsRef<Path>, local: Pubkey) -> MurmurResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(MESSAGES_TABLE)?;
            let _ = write_txn.open_table(SEEN_TABLE)?;
            let _ = write_txn.open_table(CHAT_META_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
            local,
        })
    }

    fn message_key(&self, chat: &Pubkey, id: &EventId) -> String {
        format!("{}/{}/{}", self.local.to_hex(), chat.to_hex(), id.to_hex())
    }

    fn chat_prefix(&self, chat: &Pubkey) -> String {
        format!("{}/{}/", self.local.to_hex(), chat.to_hex())
    }

    fn seen_key(&self, id: &EventId) -> String {
        format!("{}/{}", self.local.to_hex(), id.to_hex())
    }

    fn meta_key(&self, chat: &Pubkey) -> String {
        format!("{}/{}", self.local.to_hex(), chat.to_hex())
    }

    /// The exclusive upper bound for a `/`-terminated key prefix.
    fn prefix_end(prefix: &str) -> String {
        // '0' is the successor of '/' in ASCII.
        format!("{}0", prefix.trim_end_matches('/'))
    }
}

impl MessageStore for RedbMessageStore {
    fn save_message(&self, chat: &Pubkey, message: &DirectMessage) -> MurmurResult<()> {
        if self.contains(&message.id)? {
            return Ok(());
        }

        let data = postcard::to_allocvec(message)
            .map_err(|e| MurmurError::Serialization(e.to_string()))?;
        let key = self.message_key(chat, &message.id);
        let seen_key = self.seen_key(&message.id);

        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(MESSAGES_TABLE)?;
            table.insert(key.as_str(), data.as_slice())?;
            let mut seen = write_txn.open_table(SEEN_TABLE)?;
            seen.insert(seen_key.as_str(), [1u8].as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn contains(&self, id: &EventId) -> MurmurResult<bool> {
        let key = self.seen_key(id);
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SEEN_TABLE)?;
        Ok(table.get(key.as_str())?.is_some())
    }

    fn mark_chat_read(&self, chat: &Pubkey) -> MurmurResult<()> {
        let prefix = self.chat_prefix(chat);
        let end = Self::prefix_end(&prefix);

        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(MESSAGES_TABLE)?;

            let mut updates: Vec<(String, Vec<u8>)> = Vec::new();
            for entry in table.range(prefix.as_str()..end.as_str())? {
                let (key, value) = entry?;
                let mut message: DirectMessage = postcard::from_bytes(value.value())
                    .map_err(|e| MurmurError::Serialization(e.to_string()))?;
                if !message.outgoing && !message.read {
                    message.read = true;
                    let data = postcard::to_allocvec(&message)
                        .map_err(|e| MurmurError::Serialization(e.to_string()))?;
                    updates.push((key.value().to_string(), data));
                }
            }
            for (key, data) in updates {
                table.insert(key.as_str(), data.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn hide_chat(&self, chat: &Pubkey, hidden: bool) -> MurmurResult<()> {
        let key = self.meta_key(chat);
        let data = postcard::to_allocvec(&ChatMeta { hidden })
            .map_err(|e| MurmurError::Serialization(e.to_string()))?;

        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(CHAT_META_TABLE)?;
            table.insert(key.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn load_chats(&self) -> MurmurResult<Vec<(Pubkey, Vec<DirectMessage>, bool)>> {
        let account_prefix = format!("{}/", self.local.to_hex());
        let end = Self::prefix_end(&account_prefix);

        let db = self.db.read();
        let read_txn = db.begin_read()?;

        let mut by_chat: HashMap<Pubkey, Vec<DirectMessage>> = HashMap::new();
        let table = read_txn.open_table(MESSAGES_TABLE)?;
        for entry in table.range(account_prefix.as_str()..end.as_str())? {
            let (key, value) = entry?;
            let chat_hex = key
                .value()
                .split('/')
                .nth(1)
                .ok_or_else(|| MurmurError::Serialization("malformed message key".to_string()))?;
            let chat = Pubkey::from_hex(chat_hex)?;
            let message: DirectMessage = postcard::from_bytes(value.value())
                .map_err(|e| MurmurError::Serialization(e.to_string()))?;
            by_chat.entry(chat).or_default().push(message);
        }

        let meta_table = read_txn.open_table(CHAT_META_TABLE)?;
        let mut chats = Vec::with_capacity(by_chat.len());
        for (chat, messages) in by_chat {
            let hidden = match meta_table.get(self.meta_key(&chat).as_str())? {
                Some(value) => postcard::from_bytes::<ChatMeta>(value.value())
                    .map_err(|e| MurmurError::Serialization(e.to_string()))?
                    .hidden,
                None => false,
            };
            chats.push((chat, messages, hidden));
        }
        Ok(chats)
    }
}

/// In-memory message store for tests.
#[derive(Default)]
pub struct MemoryMessageStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    messages: HashMap<Pubkey, HashMap<EventId, DirectMessage>>,
    hidden: HashMap<Pubkey, bool>,
    seen: HashSet<EventId>,
}

impl MemoryMessageStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageStore for MemoryMessageStore {
    fn save_message(&self, chat: &Pubkey, message: &DirectMessage) -> MurmurResult<()> {
        let mut inner = self.inner.lock();
        if !inner.seen.insert(message.id) {
            return Ok(());
        }
        inner
            .messages
            .entry(*chat)
            .or_default()
            .insert(message.id, message.clone());
        Ok(())
    }

    fn contains(&self, id: &EventId) -> MurmurResult<bool> {
        Ok(self.inner.lock().seen.contains(id))
    }

    fn mark_chat_read(&self, chat: &Pubkey) -> MurmurResult<()> {
        let mut inner = self.inner.lock();
        if let Some(messages) = inner.messages.get_mut(chat) {
            for message in messages.values_mut() {
                if !message.outgoing {
                    message.read = true;
                }
            }
        }
        Ok(())
    }

    fn hide_chat(&self, chat: &Pubkey, hidden: bool) -> MurmurResult<()> {
        self.inner.lock().hidden.insert(*chat, hidden);
        Ok(())
    }

    fn load_chats(&self) -> MurmurResult<Vec<(Pubkey, Vec<DirectMessage>, bool)>> {
        let inner = self.inner.lock();
        Ok(inner
            .messages
            .iter()
            .map(|(chat, messages)| {
                let hidden = inner.hidden.get(chat).copied().unwrap_or(false);
                (*chat, messages.values().cloned().collect(), hidden)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Rumor;
    use crate::crypto::Algorithm;
    use crate::identity::Identity;

    fn sample_message(seed: u8, created_at: i64, local: &Pubkey) -> DirectMessage {
        let author = Identity::from_seed(&[seed; 32]);
        let rumor = Rumor::new_chat(&author.pubkey(), local, created_at, format!("msg {}", seed))
            .expect("Should build rumor");
        DirectMessage::from_rumor(&rumor, local, Algorithm::Modern)
    }

    #[test]
    fn test_redb_save_and_load() {
        let dir = tempfile::tempdir().expect("Should create tempdir");
        let local = Identity::from_seed(&[1u8; 32]).pubkey();
        let chat = Identity::from_seed(&[2u8; 32]).pubkey();
        let store =
            RedbMessageStore::new(dir.path().join("messages.redb"), local).expect("Should open");

        let message = sample_message(2, 1000, &local);
        store.save_message(&chat, &message).expect("Should save");

        assert!(store.contains(&message.id).expect("Should check"));

        let chats = store.load_chats().expect("Should load");
        assert_eq!(chats.len(), 1);
        let (loaded_chat, messages, hidden) = &chats[0];
        assert_eq!(loaded_chat, &chat);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0], message);
        assert!(!hidden);
    }

    #[test]
    fn test_redb_survives_reopen() {
        let dir = tempfile::tempdir().expect("Should create tempdir");
        let path = dir.path().join("messages.redb");
        let local = Identity::from_seed(&[1u8; 32]).pubkey();
        let chat = Identity::from_seed(&[2u8; 32]).pubkey();
        let message = sample_message(2, 1000, &local);

        {
            let store = RedbMessageStore::new(&path, local).expect("Should open");
            store.save_message(&chat, &message).expect("Should save");
            store.hide_chat(&chat, true).expect("Should hide");
        }

        let store = RedbMessageStore::new(&path, local).expect("Should reopen");
        let chats = store.load_chats().expect("Should load");
        assert_eq!(chats.len(), 1);
        assert!(chats[0].2);
        assert_eq!(chats[0].1[0], message);
    }

    #[test]
    fn test_redb_mark_chat_read() {
        let dir = tempfile::tempdir().expect("Should create tempdir");
        let local = Identity::from_seed(&[1u8; 32]).pubkey();
        let chat = Identity::from_seed(&[2u8; 32]).pubkey();
        let store =
            RedbMessageStore::new(dir.path().join("messages.redb"), local).expect("Should open");

        store
            .save_message(&chat, &sample_message(2, 1000, &local))
            .expect("Should save");
        store
            .save_message(&chat, &sample_message(3, 2000, &local))
            .expect("Should save");

        store.mark_chat_read(&chat).expect("Should mark read");

        let chats = store.load_chats().expect("Should load");
        assert!(chats[0].1.iter().all(|m| m.read));
    }

    #[test]
    fn test_redb_duplicate_save_is_noop() {
        let dir = tempfile::tempdir().expect("Should create tempdir");
        let local = Identity::from_seed(&[1u8; 32]).pubkey();
        let chat = Identity::from_seed(&[2u8; 32]).pubkey();
        let store =
            RedbMessageStore::new(dir.path().join("messages.redb"), local).expect("Should open");

        let message = sample_message(2, 1000, &local);
        store.save_message(&chat, &message).expect("Should save");

        let mut altered = message.clone();
        altered.content = "rewritten".to_string();
        store.save_message(&chat, &altered).expect("Should accept");

        let chats = store.load_chats().expect("Should load");
        assert_eq!(chats[0].1.len(), 1);
        assert_eq!(chats[0].1[0].content, "msg 2");
    }

    #[test]
    fn test_redb_isolates_accounts() {
        let dir = tempfile::tempdir().expect("Should create tempdir");
        let path = dir.path().join("messages.redb");
        let alice = Identity::from_seed(&[1u8; 32]).pubkey();
        let bob = Identity::from_seed(&[9u8; 32]).pubkey();
        let chat = Identity::from_seed(&[2u8; 32]).pubkey();

        let alice_store = RedbMessageStore::new(&path, alice).expect("Should open");
        alice_store
            .save_message(&chat, &sample_message(2, 1000, &alice))
            .expect("Should save");

        drop(alice_store);
        let bob_store = RedbMessageStore::new(&path, bob).expect("Should open");
        assert!(bob_store.load_chats().expect("Should load").is_empty());
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let local = Identity::from_seed(&[1u8; 32]).pubkey();
        let chat = Identity::from_seed(&[2u8; 32]).pubkey();
        let store = MemoryMessageStore::new();

        let message = sample_message(2, 1000, &local);
        store.save_message(&chat, &message).expect("Should save");
        assert!(store.contains(&message.id).expect("Should check"));

        let chats = store.load_chats().expect("Should load");
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].1.len(), 1);
    }
}
