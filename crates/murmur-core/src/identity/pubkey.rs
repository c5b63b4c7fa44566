//! Public key identity type
//!
//! A [`Pubkey`] is the 32-byte Ed25519 public key that identifies a
//! participant everywhere in the protocol: as event author, as the value
//! of addressing tags, and as the key a [`Chat`](crate::store::Chat) is
//! filed under. It serializes as lowercase hex on the wire.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::MurmurError;

/// A 32-byte public key identifying a protocol participant.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pubkey([u8; 32]);

impl Pubkey {
    /// The all-zero placeholder key. Never a valid counterparty.
    pub const ZERO: Pubkey = Pubkey([0u8; 32]);

    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Pubkey(bytes)
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, MurmurError> {
        let bytes = hex::decode(s)
            .map_err(|e| MurmurError::Identity(format!("invalid pubkey hex: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| MurmurError::Identity("pubkey must be 32 bytes".to_string()))?;
        Ok(Pubkey(bytes))
    }

    /// Get the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex-encode the key.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short prefix for log output.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pubkey({}..)", self.short())
    }
}

impl FromStr for Pubkey {
    type Err = MurmurError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Pubkey::from_hex(s)
    }
}

impl Serialize for Pubkey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Pubkey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Pubkey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let pk = Pubkey::from_bytes([7u8; 32]);
        let recovered = Pubkey::from_hex(&pk.to_hex()).expect("Should parse");
        assert_eq!(pk, recovered);
    }

    #[test]
    fn test_rejects_short_hex() {
        assert!(Pubkey::from_hex("abcd").is_err());
    }

    #[test]
    fn test_rejects_non_hex() {
        assert!(Pubkey::from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn test_serde_as_hex_string() {
        let pk = Pubkey::from_bytes([0xabu8; 32]);
        let json = serde_json::to_string(&pk).expect("Should serialize");
        assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));

        let back: Pubkey = serde_json::from_str(&json).expect("Should deserialize");
        assert_eq!(pk, back);
    }

    #[test]
    fn test_zero_placeholder() {
        assert_eq!(Pubkey::ZERO.as_bytes(), &[0u8; 32]);
    }
}
