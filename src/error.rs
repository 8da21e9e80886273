//! Error types shared across the guard services.
//!
//! Read paths (session lookup, rate-limit store access) recover from these locally;
//! only configuration errors are meant to stop the process.

use thiserror::Error;

/// Failure talking to the key-value store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Store command timed out after {0} ms")]
    Timeout(u64),

    #[error("Malformed value at key {key}: {reason}")]
    Malformed { key: String, reason: String },
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Session manager errors
///
/// Lookup callers never see `Encryption` or `Serialization`; those collapse into
/// "session not found" so a tampered token cannot tell decryption apart from a miss.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session encryption key not configured (set {0})")]
    MissingEncryptionKey(String),

    #[error("Session encryption failed: {0}")]
    Encryption(String),

    #[error("Session serialization failed: {0}")]
    Serialization(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// MCP registry and verification errors
#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("MCP integrity check failed for server '{server}': {}", errors.join("; "))]
    Rejected { server: String, errors: Vec<String> },

    #[error("MCP server '{server}' names shared secret variable {var}, which is not set")]
    MissingSharedSecret { server: String, var: String },
}
