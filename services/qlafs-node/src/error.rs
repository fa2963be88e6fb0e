//! Node error types

use qlafs_consensus::ConsensusError;
use qlafs_core::CoreError;
use qlafs_fingerprint::FingerprintError;
use qlafs_transparency::LogError;
use qlafs_trust::TrustError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    /// Evidence or subject was unusable; the caller may resubmit
    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Trust(#[from] TrustError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Validator {0} is already hosted by this node")]
    ValidatorAlreadyHosted(String),
}

pub type Result<T> = std::result::Result<T, NodeError>;
