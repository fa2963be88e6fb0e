//! Transparency log error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogError {
    /// Writes are paused while a tree head is sealed. Retry shortly.
    #[error("Log is sealing; appends are paused")]
    LogSealed,

    /// A proof did not verify. Never ignore this.
    #[error("Proof verification failed: {0}")]
    ProofVerificationFailed(String),

    #[error("Entry index {index} out of range for tree size {tree_size}")]
    IndexOutOfRange { index: u64, tree_size: u64 },

    #[error("Invalid tree sizes: old {old_size}, new {new_size}")]
    InvalidTreeSize { old_size: u64, new_size: u64 },

    #[error("No sealed tree head yet")]
    NoTreeHead,

    #[error("Hash chain broken at entry {index}: {reason}")]
    ChainBroken { index: u64, reason: String },

    #[error("Invalid tree head signature: {0}")]
    InvalidSignature(String),

    #[error("Anchoring failed: {0}")]
    Anchor(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] qlafs_core::CoreError),
}

pub type Result<T> = std::result::Result<T, LogError>;
