//! Three-layer envelope codec for direct messages
//!
//! A message travels as three nested records:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Envelope (kind 1059)                                       │
//! │  - authored and signed by a single-use key                  │
//! │  - `p` tag addresses the recipient                          │
//! │  - content: encrypted Seal                                  │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │  Seal (kind 13)                                       │  │
//! │  │  - authored and signed by the real sender             │  │
//! │  │  - timestamp randomized within the past 48 hours      │  │
//! │  │  - content: encrypted Rumor                           │  │
//! │  │  ┌─────────────────────────────────────────────────┐  │  │
//! │  │  │  Rumor (kind 14, unsigned)                      │  │  │
//! │  │  │  - true author, true timestamp, plaintext       │  │  │
//! │  │  └─────────────────────────────────────────────────┘  │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every send produces two envelopes carrying the same rumor: one
//! addressed to the recipient and one addressed back to the sender, so
//! other sessions of the sender can reconstruct the conversation. Both
//! are signed by the same single-use key, which is discarded immediately
//! after signing.
//!
//! Unwrapping is best-effort: the relay network is open, anyone can
//! publish garbage, so every structural or cryptographic failure drops
//! the one message (with a log line) and never aborts the caller. The
//! single fatal exception is a missing key capability.
//!
//! The flat single-layer legacy format (kind 4) is handled by
//! [`unwrap_legacy`].

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::crypto::{Algorithm, CryptoEnvelope};
use crate::error::{MurmurError, MurmurResult};
use crate::event::{first_recipient, Event, EventId, Kind, Tag};
use crate::identity::{Identity, Pubkey};

/// Seal and envelope timestamps are pushed back by a random offset of up
/// to this many seconds (48 hours) to frustrate metadata correlation.
pub const TIMESTAMP_SKEW_SECS: i64 = 48 * 60 * 60;

/// An unsigned plaintext message, the innermost envelope layer.
///
/// Never transmitted in this form; it only exists before sealing and
/// after a successful unwrap.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Rumor {
    /// Content identifier, computed like an event id but never signed
    pub id: EventId,
    /// True author
    pub pubkey: Pubkey,
    /// True creation timestamp (unix seconds)
    pub created_at: i64,
    /// Inner message kind
    pub kind: Kind,
    /// Tags; carries the `p` tag naming the counterpart
    pub tags: Vec<Tag>,
    /// Plaintext message body
    pub content: String,
}

impl Rumor {
    /// Build a new chat rumor addressed to `recipient`.
    pub fn new_chat(
        author: &Pubkey,
        recipient: &Pubkey,
        created_at: i64,
        content: String,
    ) -> MurmurResult<Self> {
        let tags = vec![Tag::recipient(recipient)];
        let id = Event::compute_id(author, created_at, Kind::CHAT, &tags, &content)?;
        Ok(Rumor {
            id,
            pubkey: *author,
            created_at,
            kind: Kind::CHAT,
            tags,
            content,
        })
    }

    /// The addressed counterpart (`p` tag), if any.
    pub fn recipient(&self) -> Option<Pubkey> {
        first_recipient(&self.tags)
    }

    /// Recompute the content identifier and compare with the declared one.
    fn id_is_canonical(&self) -> bool {
        Event::compute_id(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content)
            .map(|computed| computed == self.id)
            .unwrap_or(false)
    }
}

/// The two envelopes produced by one send.
#[derive(Debug, Clone)]
pub struct EnvelopePair {
    /// The plaintext rumor both envelopes carry
    pub rumor: Rumor,
    /// Envelope addressed to the recipient
    pub recipient_envelope: Event,
    /// Envelope addressed back to the sender
    pub self_envelope: Event,
}

/// A decrypted flat legacy message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyMessage {
    /// The other participant in the thread
    pub counterparty: Pubkey,
    /// Decrypted message body
    pub content: String,
}

/// The result of running one queued unwrap job.
#[derive(Debug, Clone)]
pub enum Unwrapped {
    /// A rumor recovered from a three-layer envelope
    Sealed(Rumor),
    /// A plaintext recovered from a flat legacy event
    Legacy(LegacyMessage),
}

/// A timestamp pushed back by a random offset within the skew window.
fn skewed_timestamp(now: i64) -> i64 {
    use rand::Rng;
    now - rand::rng().random_range(0..TIMESTAMP_SKEW_SECS)
}

/// Build the envelope pair for a new outgoing message.
///
/// Requires local private key material: the seal is signed with the
/// account identity. The seal is encrypted per target (to the recipient
/// for their envelope, back to the sender for the self copy) so each can
/// open it keyed by the seal author. The single-use envelope key is
/// dropped as soon as both envelopes are signed.
pub async fn build_envelope(
    content: &str,
    recipient: &Pubkey,
    crypto: &CryptoEnvelope,
) -> MurmurResult<EnvelopePair> {
    let identity = crypto.identity().ok_or_else(|| {
        MurmurError::KeyUnavailable("sending requires a local private key".to_string())
    })?;
    let sender = crypto.pubkey();
    let now = chrono::Utc::now().timestamp();

    let rumor = Rumor::new_chat(&sender, recipient, now, content.to_string())?;
    let rumor_json =
        serde_json::to_string(&rumor).map_err(|e| MurmurError::Serialization(e.to_string()))?;

    let single_use = Identity::generate();

    let recipient_envelope =
        wrap_for(&rumor_json, recipient, identity, &single_use, crypto, now).await?;
    let self_envelope = wrap_for(&rumor_json, &sender, identity, &single_use, crypto, now).await?;

    Ok(EnvelopePair {
        rumor,
        recipient_envelope,
        self_envelope,
    })
}

/// Seal the rumor to one target and wrap the seal with the single-use key.
async fn wrap_for(
    rumor_json: &str,
    target: &Pubkey,
    identity: &Identity,
    single_use: &Identity,
    crypto: &CryptoEnvelope,
    now: i64,
) -> MurmurResult<Event> {
    let sealed_content = crypto.encrypt(rumor_json, target, Algorithm::Modern).await?;
    let seal = Event::sign_new(
        identity,
        skewed_timestamp(now),
        Kind::SEAL,
        Vec::new(),
        sealed_content,
    )?;
    let seal_json = seal.to_json()?;

    let wrapped_content = crypto.encrypt_with_key(single_use, target, &seal_json)?;
    Event::sign_new(
        single_use,
        skewed_timestamp(now),
        Kind::ENVELOPE,
        vec![Tag::recipient(target)],
        wrapped_content,
    )
}

/// Unwrap a three-layer envelope down to its rumor.
///
/// Returns `Ok(None)` for everything that should be dropped: wrong
/// addressee, undecryptable content, malformed layers, or a spoofed
/// inner author. Only a fatal key-capability failure is returned as an
/// error.
pub async fn unwrap_envelope(
    event: &Event,
    crypto: &CryptoEnvelope,
) -> MurmurResult<Option<Rumor>> {
    let me = crypto.pubkey();

    // Addressed to us, or our own self copy.
    if event.recipient() != Some(me) && event.pubkey != me {
        debug!(envelope = %event.id, "envelope not addressed to this identity");
        return Ok(None);
    }

    match try_unwrap_envelope(event, crypto).await {
        Ok(rumor) => Ok(Some(rumor)),
        Err(err) if err.is_fatal() => Err(err),
        Err(MurmurError::SpoofDetected) => {
            warn!(envelope = %event.id, "rejected envelope with spoofed inner author");
            Ok(None)
        }
        Err(err) => {
            debug!(envelope = %event.id, error = %err, "envelope dropped");
            Ok(None)
        }
    }
}

/// The fallible body of [`unwrap_envelope`], with typed failures.
async fn try_unwrap_envelope(event: &Event, crypto: &CryptoEnvelope) -> MurmurResult<Rumor> {
    let (seal_json, _) = crypto.auto_decrypt(&event.content, &event.pubkey).await?;

    let seal = Event::from_json(&seal_json)?;
    if seal.kind != Kind::SEAL {
        return Err(MurmurError::MalformedEnvelope(format!(
            "inner record has kind {}, expected a seal",
            seal.kind.0
        )));
    }
    seal.verify()?;

    let (rumor_json, _) = crypto.auto_decrypt(&seal.content, &seal.pubkey).await?;

    let rumor: Rumor = serde_json::from_str(&rumor_json)
        .map_err(|e| MurmurError::MalformedEnvelope(format!("rumor decode failed: {}", e)))?;
    if !rumor.id_is_canonical() {
        return Err(MurmurError::MalformedEnvelope(
            "rumor id does not match its content".to_string(),
        ));
    }

    // Anti-spoof: the sealed author must be whoever signed the seal.
    if rumor.pubkey != seal.pubkey {
        return Err(MurmurError::SpoofDetected);
    }

    Ok(rumor)
}

/// Decrypt a flat single-layer legacy message.
///
/// The counterpart is the event author, unless the local identity wrote
/// the event itself, in which case it comes from the addressing tag.
pub async fn unwrap_legacy(
    event: &Event,
    crypto: &CryptoEnvelope,
) -> MurmurResult<Option<LegacyMessage>> {
    if event.kind != Kind::LEGACY_DM {
        debug!(event = %event.id, kind = event.kind.0, "not a legacy direct message");
        return Ok(None);
    }

    let me = crypto.pubkey();
    let counterparty = if event.pubkey == me {
        match event.recipient() {
            Some(recipient) => recipient,
            None => {
                warn!(event = %event.id, "own legacy message has no recipient tag");
                return Ok(None);
            }
        }
    } else {
        event.pubkey
    };

    let content = match crypto.auto_decrypt(&event.content, &counterparty).await {
        Ok((plaintext, _)) => plaintext,
        Err(err) if err.is_fatal() => return Err(err),
        Err(err) => {
            debug!(event = %event.id, error = %err, "legacy message failed to decrypt");
            return Ok(None);
        }
    };

    Ok(Some(LegacyMessage {
        counterparty,
        content,
    }))
}
