//! Local identity and public key types
//!
//! A Murmur identity is a single 32-byte key that serves both roles the
//! protocol needs:
//!
//! - **Signing**: Ed25519 signatures over event ids
//! - **Key agreement**: X25519 Diffie-Hellman, using the clamped Ed25519
//!   scalar on the secret side and the Montgomery form of the Ed25519
//!   public key on the peer side
//!
//! This means a counterparty is fully identified by the one [`Pubkey`]
//! carried on their events; no separate exchange key is published.

mod keys;
mod pubkey;

pub use keys::Identity;
pub use pubkey::Pubkey;

pub(crate) use keys::verify_signature;
