//! Consensus error types

use crate::message::Phase;
use qlafs_fingerprint::FingerprintError;
use thiserror::Error;

/// Errors produced by the registry and the consensus engine
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConsensusError {
    /// Every view change was exhausted without finalization
    #[error("Consensus timeout in round {round} during {phase} phase")]
    ConsensusTimeout { round: u64, phase: Phase },

    #[error("Insufficient validators: {active} active, {required} required")]
    InsufficientValidators { active: usize, required: usize },

    #[error("Unknown validator: {0}")]
    UnknownValidator(String),

    #[error("Duplicate proposal: {0}")]
    DuplicateProposal(String),

    #[error("Invalid vote signature from {0}")]
    InvalidSignature(String),

    #[error("Invalid quorum certificate: {0}")]
    InvalidCertificate(String),

    #[error("Fingerprint error: {0}")]
    Fingerprint(#[from] FingerprintError),

    /// The proposal driver panicked; only that proposal is affected
    #[error("Proposal driver failed: {0}")]
    DriverFailed(String),

    #[error("Consensus engine is shut down")]
    EngineShutdown,
}

pub type Result<T> = std::result::Result<T, ConsensusError>;
