//! Modern direct-message encryption
//!
//! Authenticated encryption with a derived conversation key:
//!
//! ```text
//! shared    = X25519(self_secret, counterparty_pubkey)
//! salt      = sorted(self_pubkey, counterparty_pubkey) concatenated
//! conv_key  = HKDF-SHA256(ikm = shared, salt, info = "murmur-conversation-key-v2")
//! ```
//!
//! The salt sorts the two public keys so both directions of a
//! conversation derive the same key. Wire format is a versioned binary
//! blob, base64-encoded:
//!
//! ```text
//! base64( [version: 1 byte] || [nonce: 12 bytes] || [ciphertext + tag] )
//! ```

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{MurmurError, MurmurResult};
use crate::identity::{Identity, Pubkey};

/// Current ciphertext format version.
pub const VERSION: u8 = 2;

/// Domain separation string for conversation-key derivation.
const HKDF_INFO: &[u8] = b"murmur-conversation-key-v2";

const NONCE_SIZE: usize = 12;

/// Derive the symmetric conversation key between the local identity and a
/// counterparty. Deterministic and direction-independent.
pub fn conversation_key(identity: &Identity, counterparty: &Pubkey) -> MurmurResult<[u8; 32]> {
    let shared = identity.shared_secret(counterparty)?;

    let own = identity.pubkey();
    let (lo, hi) = if own.as_bytes() <= counterparty.as_bytes() {
        (own, *counterparty)
    } else {
        (*counterparty, own)
    };
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(lo.as_bytes());
    salt[32..].copy_from_slice(hi.as_bytes());

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), &shared);
    let mut key = [0u8; 32];
    hkdf.expand(HKDF_INFO, &mut key)
        .expect("HKDF expand never fails for 32-byte output");
    Ok(key)
}

/// Encrypt a plaintext to a counterparty with the modern scheme.
pub fn encrypt(identity: &Identity, counterparty: &Pubkey, plaintext: &str) -> MurmurResult<String> {
    let key = conversation_key(identity, counterparty)?;
    let cipher = ChaCha20Poly1305::new(&key.into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| MurmurError::Crypto(format!("encryption failed: {}", e)))?;

    let mut payload = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len());
    payload.push(VERSION);
    payload.extend_from_slice(&nonce_bytes);
    payload.extend_from_slice(&ciphertext);

    Ok(BASE64.encode(payload))
}

/// Decrypt a modern-format ciphertext from a counterparty.
pub fn decrypt(identity: &Identity, counterparty: &Pubkey, payload: &str) -> MurmurResult<String> {
    let bytes = BASE64
        .decode(payload)
        .map_err(|e| MurmurError::AlgorithmMismatch(format!("payload not base64: {}", e)))?;

    if bytes.len() < 1 + NONCE_SIZE + 16 {
        return Err(MurmurError::AlgorithmMismatch(
            "payload too short for versioned format".to_string(),
        ));
    }
    if bytes[0] != VERSION {
        return Err(MurmurError::AlgorithmMismatch(format!(
            "unknown ciphertext version {}",
            bytes[0]
        )));
    }

    let key = conversation_key(identity, counterparty)?;
    let cipher = ChaCha20Poly1305::new(&key.into());
    let nonce = Nonce::from_slice(&bytes[1..1 + NONCE_SIZE]);

    let plaintext = cipher
        .decrypt(nonce, &bytes[1 + NONCE_SIZE..])
        .map_err(|e| MurmurError::Crypto(format!("decryption failed: {}", e)))?;

    String::from_utf8(plaintext)
        .map_err(|e| MurmurError::Crypto(format!("plaintext not UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let alice = Identity::from_seed(&[1u8; 32]);
        let bob = Identity::from_seed(&[2u8; 32]);

        let ct = encrypt(&alice, &bob.pubkey(), "hello bob").expect("Should encrypt");
        let pt = decrypt(&bob, &alice.pubkey(), &ct).expect("Should decrypt");
        assert_eq!(pt, "hello bob");
    }

    #[test]
    fn test_conversation_key_symmetric() {
        let alice = Identity::from_seed(&[1u8; 32]);
        let bob = Identity::from_seed(&[2u8; 32]);

        let k1 = conversation_key(&alice, &bob.pubkey()).expect("Should derive");
        let k2 = conversation_key(&bob, &alice.pubkey()).expect("Should derive");
        assert_eq!(k1, k2);
    }

    #[test]
    fn test_conversation_key_distinct_pairs() {
        let alice = Identity::from_seed(&[1u8; 32]);
        let bob = Identity::from_seed(&[2u8; 32]);
        let carol = Identity::from_seed(&[3u8; 32]);

        let ab = conversation_key(&alice, &bob.pubkey()).expect("Should derive");
        let ac = conversation_key(&alice, &carol.pubkey()).expect("Should derive");
        assert_ne!(ab, ac);
    }

    #[test]
    fn test_version_byte_checked() {
        let alice = Identity::from_seed(&[1u8; 32]);
        let bob = Identity::from_seed(&[2u8; 32]);

        let ct = encrypt(&alice, &bob.pubkey(), "hello").expect("Should encrypt");
        let mut bytes = BASE64.decode(&ct).expect("Should decode");
        bytes[0] = 99;
        let err = decrypt(&bob, &alice.pubkey(), &BASE64.encode(bytes)).unwrap_err();
        assert!(matches!(err, MurmurError::AlgorithmMismatch(_)));
    }

    #[test]
    fn test_non_base64_is_mismatch() {
        let alice = Identity::from_seed(&[1u8; 32]);
        let bob = Identity::from_seed(&[2u8; 32]);

        let err = decrypt(&alice, &bob.pubkey(), "ct?iv=nonce").unwrap_err();
        assert!(matches!(err, MurmurError::AlgorithmMismatch(_)));
    }

    #[test]
    fn test_wrong_counterparty_fails() {
        let alice = Identity::from_seed(&[1u8; 32]);
        let bob = Identity::from_seed(&[2u8; 32]);
        let carol = Identity::from_seed(&[3u8; 32]);

        let ct = encrypt(&alice, &bob.pubkey(), "secret").expect("Should encrypt");
        assert!(decrypt(&carol, &alice.pubkey(), &ct).is_err());
    }

    #[test]
    fn test_self_conversation_roundtrip() {
        // Used by self-addressed copies of sent messages.
        let alice = Identity::from_seed(&[1u8; 32]);

        let ct = encrypt(&alice, &alice.pubkey(), "note to self").expect("Should encrypt");
        let pt = decrypt(&alice, &alice.pubkey(), &ct).expect("Should decrypt");
        assert_eq!(pt, "note to self");
    }
}
