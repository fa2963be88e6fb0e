//! Core functionality for the QLAFS trust establishment system.
//!
//! This crate provides the digests, signing helpers, configuration and
//! logging setup shared by the fingerprint, consensus and transparency crates.

pub mod config;
pub mod digest;
pub mod error;
pub mod logging;
pub mod signing;

pub use config::{
    AnchorKind, ConsensusConfig, LogFormat, LoggingConfig, NodeConfig, QlafsConfig,
    RegistryConfig, StoreKind, TransparencyConfig, TrustConfig, TrustWeights, ValidatorSpec,
};
pub use digest::{hash_domain, now_ms, to_hex, Digest, DomainHasher, ZERO_DIGEST};
pub use error::{CoreError, Result};
pub use signing::{
    generate_signing_key, sign_digest, signing_key_from_hex, verify_digest, PublicKeyBytes,
};

// Key types re-exported so downstream crates agree on one ed25519 version
pub use ed25519_dalek::{SigningKey, VerifyingKey};
