//! Log entries and their hash chain.

use crate::error::{LogError, Result};
use qlafs_consensus::{Decision, FinalizedVerdict};
use qlafs_core::{hash_domain, Digest};
use serde::{Deserialize, Serialize};

const ENTRY_DOMAIN: &[u8] = b"QLAFS-LOG-ENTRY-V1";

/// What a log entry records about a finalized verdict.
///
/// Serialized with serde_json in field declaration order; that byte string is
/// what the entry hash commits to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictPayload {
    pub proposal_id: String,
    pub subject_id: String,
    pub decision: Decision,
    pub round: u64,
    pub fingerprint_version: u64,
    pub static_hash: Digest,
    pub behavioral_hash: Digest,
    pub cognitive_hash: Digest,
    pub compositional_hash: Digest,
    pub composite_hash: Digest,
    pub certificate_digest: Digest,
    pub signers: Vec<String>,
}

impl VerdictPayload {
    pub fn from_verdict(verdict: &FinalizedVerdict) -> Self {
        let fp = &verdict.fingerprint;
        Self {
            proposal_id: verdict.proposal_id.clone(),
            subject_id: verdict.subject_id.clone(),
            decision: verdict.decision,
            round: verdict.round,
            fingerprint_version: fp.version,
            static_hash: fp.static_hash,
            behavioral_hash: fp.behavioral_hash,
            cognitive_hash: fp.cognitive_hash,
            compositional_hash: fp.compositional_hash,
            composite_hash: fp.composite_hash,
            certificate_digest: verdict.certificate.digest(),
            signers: verdict.certificate.signers(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// An appended, hash-chained log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub entry_index: u64,
    pub payload: VerdictPayload,
    pub previous_hash: Digest,
    /// `H(previous_hash || appended_at || serialized payload)`
    pub entry_hash: Digest,
    /// Unix milliseconds
    pub appended_at: u64,
}

pub fn chain_hash(previous_hash: &Digest, appended_at: u64, payload_bytes: &[u8]) -> Digest {
    hash_domain(
        ENTRY_DOMAIN,
        &[&previous_hash[..], &appended_at.to_be_bytes()[..], payload_bytes],
    )
}

impl LogEntry {
    pub fn new(
        entry_index: u64,
        previous_hash: Digest,
        payload: VerdictPayload,
        appended_at: u64,
    ) -> Result<Self> {
        let entry_hash = chain_hash(&previous_hash, appended_at, &payload.to_bytes()?);
        Ok(Self {
            entry_index,
            payload,
            previous_hash,
            entry_hash,
            appended_at,
        })
    }

    pub fn proposal_id(&self) -> &str {
        &self.payload.proposal_id
    }

    /// Recompute the entry hash and check it links to `expected_previous`
    pub fn verify_link(&self, expected_previous: &Digest) -> Result<()> {
        if &self.previous_hash != expected_previous {
            return Err(LogError::ChainBroken {
                index: self.entry_index,
                reason: "previous hash does not match predecessor".to_string(),
            });
        }
        let recomputed = chain_hash(&self.previous_hash, self.appended_at, &self.payload.to_bytes()?);
        if recomputed != self.entry_hash {
            return Err(LogError::ChainBroken {
                index: self.entry_index,
                reason: "entry hash does not match payload".to_string(),
            });
        }
        Ok(())
    }
}
