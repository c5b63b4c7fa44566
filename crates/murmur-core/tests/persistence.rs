//! Cold-start persistence across engine restarts
//!
//! Messages, read state, and hidden flags are mirrored into the redb
//! store as they change; a fresh engine over the same database must see
//! the same conversations without any relay traffic.

use std::path::PathBuf;
use std::sync::Arc;

use murmur_core::{Identity, MemoryRelay, MurmurEngine, Relay, RedbMessageStore};
use tempfile::TempDir;

/// Test context owning the temporary database shared across "restarts".
struct TestContext {
    _temp_dir: TempDir,
    db_path: PathBuf,
}

impl TestContext {
    fn new() -> anyhow::Result<Self> {
        let temp_dir = TempDir::new()?;
        let db_path = temp_dir.path().join("messages.redb");
        Ok(Self {
            _temp_dir: temp_dir,
            db_path,
        })
    }

    /// Build an engine for `seed` backed by this context's database.
    fn create_engine(&self, seed: u8, relay: Arc<dyn Relay>) -> anyhow::Result<MurmurEngine> {
        let identity = Identity::from_seed(&[seed; 32]);
        let storage = Arc::new(RedbMessageStore::new(&self.db_path, identity.pubkey())?);
        Ok(MurmurEngine::with_persistence(identity, relay, storage)?)
    }
}

#[tokio::test]
async fn chats_survive_a_restart() -> anyhow::Result<()> {
    let ctx = TestContext::new()?;
    let relay = MemoryRelay::new();

    let alice = MurmurEngine::new(Identity::from_seed(&[1u8; 32]), relay.clone());
    let bob_pk = Identity::from_seed(&[2u8; 32]).pubkey();

    alice.send_message(&bob_pk, "persisted hello").await?;

    {
        let bob = ctx.create_engine(2, relay.clone())?;
        bob.sync().await?;
        assert_eq!(bob.total_unread(), 1);
    }

    // A fresh engine over the same database, with no relay traffic, sees
    // the stored conversation.
    let bob = ctx.create_engine(2, MemoryRelay::new())?;

    let chat = bob.chat(&alice.pubkey()).expect("chat should be hydrated");
    assert_eq!(chat.len(), 1);
    assert_eq!(chat.unread_count, 1);
    assert_eq!(chat.last_message().unwrap().content, "persisted hello");
    Ok(())
}

#[tokio::test]
async fn read_state_survives_a_restart() -> anyhow::Result<()> {
    let ctx = TestContext::new()?;
    let relay = MemoryRelay::new();

    let alice = MurmurEngine::new(Identity::from_seed(&[1u8; 32]), relay.clone());
    let bob_pk = Identity::from_seed(&[2u8; 32]).pubkey();
    let alice_pk = alice.pubkey();

    alice.send_message(&bob_pk, "one").await?;
    alice.send_message(&bob_pk, "two").await?;

    {
        let bob = ctx.create_engine(2, relay.clone())?;
        bob.sync().await?;
        assert_eq!(bob.total_unread(), 2);

        bob.mark_read(&alice_pk)?;
    }

    let bob = ctx.create_engine(2, MemoryRelay::new())?;

    assert_eq!(bob.total_unread(), 0);
    let chat = bob.chat(&alice_pk).expect("chat should be hydrated");
    assert_eq!(chat.len(), 2);
    Ok(())
}

#[tokio::test]
async fn hidden_flag_survives_a_restart() -> anyhow::Result<()> {
    let ctx = TestContext::new()?;
    let relay = MemoryRelay::new();

    let alice = MurmurEngine::new(Identity::from_seed(&[1u8; 32]), relay.clone());
    let bob_pk = Identity::from_seed(&[2u8; 32]).pubkey();
    let alice_pk = alice.pubkey();

    alice.send_message(&bob_pk, "noise").await?;

    {
        let bob = ctx.create_engine(2, relay.clone())?;
        bob.sync().await?;
        bob.hide_chat(&alice_pk, true)?;
        assert!(bob.chats().is_empty());
    }

    let bob = ctx.create_engine(2, MemoryRelay::new())?;

    assert!(bob.chats().is_empty());
    assert!(bob.chat(&alice_pk).expect("chat still loadable").hidden);
    Ok(())
}
