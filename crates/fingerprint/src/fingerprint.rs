//! The composite agent fingerprint.

use crate::error::{FingerprintError, Result};
use crate::evidence::EvidenceKind;
use qlafs_core::{hash_domain, Digest};
use serde::{Deserialize, Serialize};

const COMPOSITE_DOMAIN: &[u8] = b"QLAFS-FP-COMPOSITE-V1";

/// Composite cryptographic identity of an agent.
///
/// `composite_hash` depends only on the four sub-hashes; `version` and
/// `generated_at` are metadata and never feed into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentFingerprint {
    pub subject_id: String,
    pub static_hash: Digest,
    pub behavioral_hash: Digest,
    pub cognitive_hash: Digest,
    pub compositional_hash: Digest,
    pub composite_hash: Digest,
    pub version: u64,
    /// Unix milliseconds
    pub generated_at: u64,
}

/// Digest of the four sub-hashes in the fixed order
/// static, behavioral, cognitive, compositional.
pub fn compose(
    static_hash: &Digest,
    behavioral_hash: &Digest,
    cognitive_hash: &Digest,
    compositional_hash: &Digest,
) -> Digest {
    hash_domain(
        COMPOSITE_DOMAIN,
        &[
            &static_hash[..],
            &behavioral_hash[..],
            &cognitive_hash[..],
            &compositional_hash[..],
        ],
    )
}

impl AgentFingerprint {
    /// Sub-hash for one evidence class
    pub fn component(&self, kind: EvidenceKind) -> &Digest {
        match kind {
            EvidenceKind::Static => &self.static_hash,
            EvidenceKind::Behavioral => &self.behavioral_hash,
            EvidenceKind::Cognitive => &self.cognitive_hash,
            EvidenceKind::Compositional => &self.compositional_hash,
        }
    }

    /// Recompute the composite from the sub-hashes
    pub fn expected_composite(&self) -> Digest {
        compose(
            &self.static_hash,
            &self.behavioral_hash,
            &self.cognitive_hash,
            &self.compositional_hash,
        )
    }

    pub fn verify_integrity(&self) -> Result<()> {
        if self.expected_composite() != self.composite_hash {
            return Err(FingerprintError::IntegrityMismatch {
                subject_id: self.subject_id.clone(),
            });
        }
        Ok(())
    }

    pub fn composite_hex(&self) -> String {
        hex::encode(self.composite_hash)
    }

    /// Component-wise comparison with another fingerprint
    pub fn compare(&self, other: &AgentFingerprint) -> FingerprintComparison {
        let matches: Vec<(EvidenceKind, bool)> = EvidenceKind::ALL
            .iter()
            .map(|kind| (*kind, self.component(*kind) == other.component(*kind)))
            .collect();

        let matched = matches.iter().filter(|(_, m)| *m).count();
        let mismatched_components = matches
            .iter()
            .filter(|(_, m)| !*m)
            .map(|(kind, _)| *kind)
            .collect();

        FingerprintComparison {
            same_subject: self.subject_id == other.subject_id,
            identical: self.composite_hash == other.composite_hash,
            similarity: matched as f64 / EvidenceKind::ALL.len() as f64,
            mismatched_components,
        }
    }
}

/// Result of comparing two fingerprints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintComparison {
    pub same_subject: bool,
    pub identical: bool,
    /// Fraction of matching sub-hashes in [0, 1]
    pub similarity: f64,
    pub mismatched_components: Vec<EvidenceKind>,
}
