//! Error types for the Murmur messaging engine

use std::time::Duration;

use thiserror::Error;

/// Main error type for Murmur operations
#[derive(Error, Debug)]
pub enum MurmurError {
    /// Ciphertext does not match the attempted algorithm (recoverable,
    /// callers may retry with the other algorithm)
    #[error("Algorithm mismatch: {0}")]
    AlgorithmMismatch(String),

    /// Every supported algorithm failed to decrypt the ciphertext
    #[error("No supported algorithm could decrypt the payload")]
    AlgorithmExhausted,

    /// No private key material and no external signing authority available
    #[error("No decryption capability: {0}")]
    KeyUnavailable(String),

    /// Structural or parse failure at any envelope layer
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Inner message author does not match the seal author
    #[error("Sender mismatch between envelope layers")]
    SpoofDetected,

    /// A queued decrypt was cancelled before it could run
    #[error("Decryption queue cleared")]
    QueueCleared,

    /// A sync sweep was forcibly closed after its time budget
    #[error("Sync sweep timed out after {0:?}")]
    SyncTimeout(Duration),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Signature verification failed
    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    /// Identity-related error (keys, encodings)
    #[error("Identity error: {0}")]
    Identity(String),

    /// Message addressed to an invalid counterparty
    #[error("Invalid counterparty: {0}")]
    InvalidCounterparty(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Relay subscription or publish failure
    #[error("Relay error: {0}")]
    Relay(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MurmurError {
    /// Whether this failure is account-level and must abort a whole sync,
    /// as opposed to a per-message failure that only drops one event.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MurmurError::KeyUnavailable(_))
    }
}

/// Result type alias using MurmurError
pub type MurmurResult<T> = Result<T, MurmurError>;
