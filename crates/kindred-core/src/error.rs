//! Error types for kindred-core.
//!
//! Propagation policy: only validation and encryption errors surface
//! synchronously to the submitter. Provider errors are absorbed by the
//! routing fallback chain, store errors on the cache/audit/rate-limit
//! paths degrade gracefully, and processing errors feed the retry loop.

use thiserror::Error;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// Bad input, rejected before persistence
    #[error("validation error: {0}")]
    Validation(String),

    /// Payload encryption/decryption failed (fatal at submission)
    #[error("encryption error: {0}")]
    Encryption(#[from] kindred_crypto::CryptoError),

    /// Job or dead-letter entry does not exist (or is not visible
    /// to the requester)
    #[error("not found")]
    NotFound,

    /// Dead-letter entry was already re-submitted once
    #[error("dead-letter entry already retried")]
    AlreadyRetried,

    /// Terminal: the job failed with no retries left
    #[error("retries exhausted after {0} attempts")]
    ExhaustedRetries(u32),

    /// Backing store error
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Payload (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
