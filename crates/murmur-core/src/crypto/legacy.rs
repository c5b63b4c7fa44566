//! Legacy direct-message encryption
//!
//! The older scheme: ChaCha20-Poly1305 keyed directly by the raw X25519
//! shared secret, with no key-derivation step. Ciphertext carries an
//! explicit `?iv=` marker separating the payload from the nonce, which is
//! how [`auto_decrypt`](super::CryptoEnvelope::auto_decrypt) recognizes
//! legacy traffic without trial decryption.
//!
//! Wire format: `base64(ciphertext || tag) + "?iv=" + base64(nonce)`

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;

use crate::error::{MurmurError, MurmurResult};
use crate::identity::{Identity, Pubkey};

/// Marker separating ciphertext from nonce in legacy payloads.
pub const LEGACY_MARKER: &str = "?iv=";

const NONCE_SIZE: usize = 12;

/// Check whether a ciphertext is in the legacy format.
pub fn is_legacy(ciphertext: &str) -> bool {
    ciphertext.contains(LEGACY_MARKER)
}

/// Encrypt a plaintext to a counterparty with the legacy scheme.
pub fn encrypt(identity: &Identity, counterparty: &Pubkey, plaintext: &str) -> MurmurResult<String> {
    let key = identity.shared_secret(counterparty)?;
    let cipher = ChaCha20Poly1305::new(&key.into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| MurmurError::Crypto(format!("legacy encryption failed: {}", e)))?;

    Ok(format!(
        "{}{}{}",
        BASE64.encode(ciphertext),
        LEGACY_MARKER,
        BASE64.encode(nonce_bytes)
    ))
}

/// Decrypt a legacy-format ciphertext from a counterparty.
pub fn decrypt(identity: &Identity, counterparty: &Pubkey, payload: &str) -> MurmurResult<String> {
    let (ct_b64, nonce_b64) = payload.split_once(LEGACY_MARKER).ok_or_else(|| {
        MurmurError::AlgorithmMismatch("missing legacy nonce marker".to_string())
    })?;

    let ciphertext = BASE64
        .decode(ct_b64)
        .map_err(|e| MurmurError::AlgorithmMismatch(format!("legacy payload not base64: {}", e)))?;
    let nonce_bytes = BASE64
        .decode(nonce_b64)
        .map_err(|e| MurmurError::AlgorithmMismatch(format!("legacy nonce not base64: {}", e)))?;
    if nonce_bytes.len() != NONCE_SIZE {
        return Err(MurmurError::AlgorithmMismatch(format!(
            "legacy nonce must be {} bytes, got {}",
            NONCE_SIZE,
            nonce_bytes.len()
        )));
    }

    let key = identity.shared_secret(counterparty)?;
    let cipher = ChaCha20Poly1305::new(&key.into());
    let nonce = Nonce::from_slice(&nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, ciphertext.as_slice())
        .map_err(|e| MurmurError::Crypto(format!("legacy decryption failed: {}", e)))?;

    String::from_utf8(plaintext)
        .map_err(|e| MurmurError::Crypto(format!("legacy plaintext not UTF-8: {}", e)))
}
