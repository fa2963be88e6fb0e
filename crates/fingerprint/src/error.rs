//! Fingerprint error types

use crate::evidence::EvidenceKind;
use thiserror::Error;

/// Errors that can occur while generating or validating a fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FingerprintError {
    /// A digester's required evidence is absent. The caller may resubmit
    /// with complete evidence.
    #[error("Evidence incomplete: {kind} evidence is missing '{field}'")]
    EvidenceIncomplete { kind: EvidenceKind, field: String },

    #[error("Invalid subject id: {0}")]
    InvalidSubject(String),

    /// Composite hash does not match the sub-hashes
    #[error("Fingerprint integrity mismatch for subject {subject_id}")]
    IntegrityMismatch { subject_id: String },

    /// History received a version that does not advance
    #[error("Non-monotonic fingerprint version for {subject_id}: latest {latest}, got {got}")]
    NonMonotonicVersion {
        subject_id: String,
        latest: u64,
        got: u64,
    },
}

pub type Result<T> = std::result::Result<T, FingerprintError>;
