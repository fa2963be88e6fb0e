//! Core error types

use thiserror::Error;

/// Core error type shared by the QLAFS crates
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration could not be parsed or failed validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// Key material was malformed
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    /// Signature bytes were malformed or did not verify
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// Hex decoding failed
    #[error("Hex decoding error: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
