//! Local signing and key-agreement keys

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};
use zeroize::Zeroizing;

use crate::error::{MurmurError, MurmurResult};
use crate::identity::Pubkey;

/// Local identity holding private key material.
///
/// Wraps an Ed25519 signing key and the X25519 secret derived from it.
/// The agreement secret is the clamped Ed25519 scalar, so the public
/// half of both operations is the same 32-byte [`Pubkey`].
#[derive(Clone)]
pub struct Identity {
    signing: SigningKey,
    agreement: X25519StaticSecret,
}

impl Identity {
    /// Generate a fresh random identity.
    ///
    /// Uses the system's cryptographically secure random source directly
    /// to avoid rand version conflicts between crypto crates.
    pub fn generate() -> Self {
        let mut seed = Zeroizing::new([0u8; 32]);
        getrandom::getrandom(seed.as_mut()).expect("system random source unavailable");
        Self::from_seed(&seed)
    }

    /// Build a deterministic identity from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(seed);
        let agreement = X25519StaticSecret::from(signing.to_scalar_bytes());
        Self { signing, agreement }
    }

    /// The public key identifying this identity.
    pub fn pubkey(&self) -> Pubkey {
        Pubkey::from_bytes(self.signing.verifying_key().to_bytes())
    }

    /// Sign a message with Ed25519.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    /// Compute the X25519 shared secret with a counterparty.
    ///
    /// The counterparty's agreement key is the Montgomery form of their
    /// Ed25519 public key, so the shared secret is symmetric: both sides
    /// derive the same 32 bytes from their own secret and the other's
    /// [`Pubkey`].
    pub fn shared_secret(&self, counterparty: &Pubkey) -> MurmurResult<[u8; 32]> {
        let verifying = VerifyingKey::from_bytes(counterparty.as_bytes())
            .map_err(|e| MurmurError::Identity(format!("invalid counterparty key: {}", e)))?;
        let montgomery = verifying.to_montgomery();
        let peer = X25519PublicKey::from(montgomery.to_bytes());

        let shared = self.agreement.diffie_hellman(&peer);
        if !shared.was_contributory() {
            return Err(MurmurError::Crypto(
                "key agreement produced a non-contributory secret".to_string(),
            ));
        }
        Ok(shared.to_bytes())
    }
}

/// Verify an Ed25519 signature against a public key.
pub fn verify_signature(pubkey: &Pubkey, message: &[u8], signature: &Signature) -> bool {
    match VerifyingKey::from_bytes(pubkey.as_bytes()) {
        Ok(key) => key.verify(message, signature).is_ok(),
        Err(_) => false,
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("pubkey", &self.pubkey())
            .finish_non_exhaustive()
    }
}
