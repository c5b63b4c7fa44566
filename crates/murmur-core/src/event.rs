//! Signed relay event records
//!
//! Everything a relay stores or forwards is an [`Event`]: a signed record
//! `{id, pubkey, created_at, kind, tags, content, sig}` serialized as
//! JSON. The id is the SHA-256 of a canonical serialization of the other
//! fields, and the signature is Ed25519 over the id bytes.
//!
//! Three kinds matter to this engine:
//!
//! | Kind | Meaning |
//! |------|---------|
//! | 4    | Flat legacy-encrypted direct message |
//! | 13   | Seal (signed record carrying an encrypted inner message) |
//! | 1059 | Envelope (single-use-key record carrying an encrypted seal) |
//!
//! Addressing uses the relational tag `["p", <hex pubkey>]`.

use std::fmt;

use ed25519_dalek::Signature;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::{MurmurError, MurmurResult};
use crate::identity::{verify_signature, Identity, Pubkey};

/// A 32-byte event identifier (SHA-256 of the canonical event form).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId([u8; 32]);

impl EventId {
    /// Wrap raw id bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        EventId(bytes)
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> MurmurResult<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| MurmurError::MalformedEnvelope(format!("invalid event id hex: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| MurmurError::MalformedEnvelope("event id must be 32 bytes".to_string()))?;
        Ok(EventId(bytes))
    }

    /// Get the raw id bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex-encode the id.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({}..)", hex::encode(&self.0[..4]))
    }
}

impl Serialize for EventId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        EventId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Event kind discriminator.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kind(pub u16);

impl Kind {
    /// Flat single-layer legacy-encrypted direct message.
    pub const LEGACY_DM: Kind = Kind(4);
    /// Signed seal carrying an encrypted inner message.
    pub const SEAL: Kind = Kind(13);
    /// Plaintext chat message (only ever appears inside a seal).
    pub const CHAT: Kind = Kind(14);
    /// Outer envelope authored by a single-use key.
    pub const ENVELOPE: Kind = Kind(1059);
}

impl fmt::Debug for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kind({})", self.0)
    }
}

/// A free-form event tag: a list of strings where the first element names
/// the tag type.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// The relational tag addressing an event to a recipient.
    pub fn recipient(pubkey: &Pubkey) -> Self {
        Tag(vec!["p".to_string(), pubkey.to_hex()])
    }

    /// The tag type name, if any.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// The tag value (second element), if any.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Extract the first addressed recipient from a tag list.
pub(crate) fn first_recipient(tags: &[Tag]) -> Option<Pubkey> {
    tags.iter()
        .filter(|t| t.name() == Some("p"))
        .find_map(|t| t.value().and_then(|v| Pubkey::from_hex(v).ok()))
}

/// A signed event record as relays store and forward it.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Event {
    /// SHA-256 of the canonical event form
    pub id: EventId,
    /// Author's public key
    pub pubkey: Pubkey,
    /// Unix timestamp in seconds
    pub created_at: i64,
    /// Event kind
    pub kind: Kind,
    /// Tag list; `["p", <hex>]` marks addressing
    pub tags: Vec<Tag>,
    /// Payload (ciphertext for all kinds this engine handles)
    pub content: String,
    /// Ed25519 signature over the id bytes, hex-encoded
    pub sig: String,
}

impl Event {
    /// Compute the canonical id for the given event fields.
    ///
    /// The canonical form is the JSON array
    /// `[0, pubkey, created_at, kind, tags, content]`, hashed with SHA-256.
    pub fn compute_id(
        pubkey: &Pubkey,
        created_at: i64,
        kind: Kind,
        tags: &[Tag],
        content: &str,
    ) -> MurmurResult<EventId> {
        let canonical =
            serde_json::to_string(&(0u8, pubkey.to_hex(), created_at, kind.0, tags, content))
                .map_err(|e| MurmurError::Serialization(e.to_string()))?;
        let digest = Sha256::digest(canonical.as_bytes());
        Ok(EventId(digest.into()))
    }

    /// Build and sign a new event with the given identity.
    pub fn sign_new(
        identity: &Identity,
        created_at: i64,
        kind: Kind,
        tags: Vec<Tag>,
        content: String,
    ) -> MurmurResult<Self> {
        let pubkey = identity.pubkey();
        let id = Self::compute_id(&pubkey, created_at, kind, &tags, &content)?;
        let sig = identity.sign(id.as_bytes());
        Ok(Event {
            id,
            pubkey,
            created_at,
            kind,
            tags,
            content,
            sig: hex::encode(sig.to_bytes()),
        })
    }

    /// Verify the event id and signature.
    pub fn verify(&self) -> MurmurResult<()> {
        let expected =
            Self::compute_id(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content)?;
        if expected != self.id {
            return Err(MurmurError::SignatureInvalid(
                "event id does not match canonical form".to_string(),
            ));
        }

        let sig_bytes = hex::decode(&self.sig)
            .map_err(|e| MurmurError::SignatureInvalid(format!("invalid signature hex: {}", e)))?;
        let sig_bytes: [u8; 64] = sig_bytes
            .try_into()
            .map_err(|_| MurmurError::SignatureInvalid("signature must be 64 bytes".to_string()))?;
        let signature = Signature::from_bytes(&sig_bytes);

        if !verify_signature(&self.pubkey, self.id.as_bytes(), &signature) {
            return Err(MurmurError::SignatureInvalid(
                "signature does not verify against author key".to_string(),
            ));
        }
        Ok(())
    }

    /// The first addressed recipient (`p` tag), if any.
    pub fn recipient(&self) -> Option<Pubkey> {
        first_recipient(&self.tags)
    }

    /// Decode an event from its JSON wire form with typed validation.
    pub fn from_json(json: &str) -> MurmurResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| MurmurError::MalformedEnvelope(format!("event decode failed: {}", e)))
    }

    /// Encode the event to its JSON wire form.
    pub fn to_json(&self) -> MurmurResult<String> {
        serde_json::to_string(self).map_err(|e| MurmurError::Serialization(e.to_string()))
    }
}
