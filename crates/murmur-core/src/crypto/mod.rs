//! Direct-message encryption primitives and algorithm negotiation
//!
//! Two schemes are supported side by side:
//!
//! - [`Algorithm::Legacy`] — symmetric cipher keyed by the raw key
//!   agreement secret, recognizable by its `?iv=` ciphertext marker
//! - [`Algorithm::Modern`] — authenticated encryption under a derived
//!   conversation key, with a versioned ciphertext format
//!
//! [`CryptoEnvelope`] is the single entry point. It either computes with
//! the account's local private key or, when the account is backed by an
//! external [`SignerAuthority`] (a key holder outside this process that
//! may prompt the user before each operation), delegates to it. Callers
//! that decrypt bursts of inbound traffic check
//! [`CryptoEnvelope::is_interactive`] and route through the
//! [`DecryptScheduler`](crate::scheduler::DecryptScheduler) so the user
//! sees one prompt at a time.

pub mod legacy;
pub mod modern;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MurmurError, MurmurResult};
use crate::identity::{Identity, Pubkey};

pub use legacy::LEGACY_MARKER;

/// Which encryption scheme a ciphertext or message used.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum Algorithm {
    /// Older scheme with the explicit `?iv=` marker
    Legacy,
    /// Current versioned authenticated scheme
    Modern,
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Algorithm::Legacy => write!(f, "legacy"),
            Algorithm::Modern => write!(f, "modern"),
        }
    }
}

/// An external key holder exposing the same encrypt/decrypt contract as
/// the local code paths.
///
/// Implementations may suspend for a long time: an interactive authority
/// typically shows the user an approval prompt per operation. Rejection
/// surfaces as an error from the call.
#[async_trait]
pub trait SignerAuthority: Send + Sync {
    /// Encrypt a plaintext to `counterparty` with the given algorithm.
    async fn encrypt(
        &self,
        algorithm: Algorithm,
        counterparty: &Pubkey,
        plaintext: &str,
    ) -> MurmurResult<String>;

    /// Decrypt a ciphertext from `counterparty` with the given algorithm.
    async fn decrypt(
        &self,
        algorithm: Algorithm,
        counterparty: &Pubkey,
        ciphertext: &str,
    ) -> MurmurResult<String>;
}

/// Encrypt/decrypt front-end for the active account.
///
/// Holds the account pubkey plus whichever capability is available:
/// local private key material, an external authority, or both. When an
/// authority is configured all identity-keyed operations go through it;
/// otherwise they run locally. With neither capability every operation
/// fails with [`MurmurError::KeyUnavailable`].
pub struct CryptoEnvelope {
    pubkey: Pubkey,
    identity: Option<Identity>,
    authority: Option<Arc<dyn SignerAuthority>>,
}

impl CryptoEnvelope {
    /// Build from a locally held identity.
    pub fn local(identity: Identity) -> Self {
        Self {
            pubkey: identity.pubkey(),
            identity: Some(identity),
            authority: None,
        }
    }

    /// Build for an account whose keys live in an external authority.
    pub fn delegated(pubkey: Pubkey, authority: Arc<dyn SignerAuthority>) -> Self {
        Self {
            pubkey,
            identity: None,
            authority: Some(authority),
        }
    }

    /// The active account's public key.
    pub fn pubkey(&self) -> Pubkey {
        self.pubkey
    }

    /// The local identity, when private key material is held in-process.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Whether operations delegate to an authority that may prompt the
    /// user interactively.
    pub fn is_interactive(&self) -> bool {
        self.authority.is_some()
    }

    /// Encrypt a plaintext to `counterparty` with the given algorithm.
    pub async fn encrypt(
        &self,
        plaintext: &str,
        counterparty: &Pubkey,
        algorithm: Algorithm,
    ) -> MurmurResult<String> {
        if let Some(authority) = &self.authority {
            return authority.encrypt(algorithm, counterparty, plaintext).await;
        }
        let identity = self.require_identity()?;
        match algorithm {
            Algorithm::Legacy => legacy::encrypt(identity, counterparty, plaintext),
            Algorithm::Modern => modern::encrypt(identity, counterparty, plaintext),
        }
    }

    /// Decrypt a ciphertext from `counterparty` with the given algorithm.
    pub async fn decrypt(
        &self,
        ciphertext: &str,
        counterparty: &Pubkey,
        algorithm: Algorithm,
    ) -> MurmurResult<String> {
        if let Some(authority) = &self.authority {
            return authority.decrypt(algorithm, counterparty, ciphertext).await;
        }
        let identity = self.require_identity()?;
        match algorithm {
            Algorithm::Legacy => legacy::decrypt(identity, counterparty, ciphertext),
            Algorithm::Modern => modern::decrypt(identity, counterparty, ciphertext),
        }
    }

    /// Modern encryption under an explicit (single-use) private key.
    ///
    /// Never delegated: the key is provided by the caller, so there is
    /// nothing for an authority to guard.
    pub fn encrypt_with_key(
        &self,
        key: &Identity,
        recipient: &Pubkey,
        plaintext: &str,
    ) -> MurmurResult<String> {
        modern::encrypt(key, recipient, plaintext)
    }

    /// Decrypt with algorithm auto-negotiation.
    ///
    /// Legacy-marked ciphertext is only ever tried as legacy. Anything
    /// else is tried as modern first, then legacy. Both failing is
    /// [`MurmurError::AlgorithmExhausted`]; a missing key capability is
    /// fatal and propagated as-is.
    pub async fn auto_decrypt(
        &self,
        ciphertext: &str,
        counterparty: &Pubkey,
    ) -> MurmurResult<(String, Algorithm)> {
        if legacy::is_legacy(ciphertext) {
            let plaintext = self.decrypt(ciphertext, counterparty, Algorithm::Legacy).await?;
            return Ok((plaintext, Algorithm::Legacy));
        }

        match self.decrypt(ciphertext, counterparty, Algorithm::Modern).await {
            Ok(plaintext) => Ok((plaintext, Algorithm::Modern)),
            Err(err) if err.is_fatal() => Err(err),
            Err(modern_err) => {
                debug!(%counterparty, error = %modern_err, "modern decrypt failed, trying legacy");
                match self.decrypt(ciphertext, counterparty, Algorithm::Legacy).await {
                    Ok(plaintext) => Ok((plaintext, Algorithm::Legacy)),
                    Err(err) if err.is_fatal() => Err(err),
                    Err(legacy_err) => {
                        debug!(%counterparty, error = %legacy_err, "legacy fallback failed");
                        Err(MurmurError::AlgorithmExhausted)
                    }
                }
            }
        }
    }

    fn require_identity(&self) -> MurmurResult<&Identity> {
        self.identity.as_ref().ok_or_else(|| {
            MurmurError::KeyUnavailable(
                "no private key and no external signing authority".to_string(),
            )
        })
    }
}

impl std::fmt::Debug for CryptoEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoEnvelope")
            .field("pubkey", &self.pubkey)
            .field("local_key", &self.identity.is_some())
            .field("delegated", &self.authority.is_some())
            .finish()
    }
}
