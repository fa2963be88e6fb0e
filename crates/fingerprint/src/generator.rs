//! Fingerprint generation.

use crate::digester::{
    BehavioralDigester, CognitiveDigester, CompositionalDigester, EvidenceDigester,
    StaticDigester,
};
use crate::error::{FingerprintError, Result};
use crate::evidence::{Evidence, EvidenceKind};
use crate::fingerprint::{compose, AgentFingerprint};
use qlafs_core::now_ms;
use std::sync::Arc;
use tracing::debug;

/// Generates composite fingerprints from evidence.
///
/// Each sub-hash is produced by a pluggable digester. Generation is atomic:
/// if any digester fails, no fingerprint is returned.
#[derive(Clone)]
pub struct FingerprintGenerator {
    static_digester: Arc<dyn EvidenceDigester>,
    behavioral_digester: Arc<dyn EvidenceDigester>,
    cognitive_digester: Arc<dyn EvidenceDigester>,
    compositional_digester: Arc<dyn EvidenceDigester>,
}

impl FingerprintGenerator {
    /// Generator with the built-in digesters
    pub fn new() -> Self {
        Self {
            static_digester: Arc::new(StaticDigester),
            behavioral_digester: Arc::new(BehavioralDigester),
            cognitive_digester: Arc::new(CognitiveDigester),
            compositional_digester: Arc::new(CompositionalDigester),
        }
    }

    /// Replace the digester for the class reported by `digester.kind()`
    pub fn with_digester(mut self, digester: Arc<dyn EvidenceDigester>) -> Self {
        match digester.kind() {
            EvidenceKind::Static => self.static_digester = digester,
            EvidenceKind::Behavioral => self.behavioral_digester = digester,
            EvidenceKind::Cognitive => self.cognitive_digester = digester,
            EvidenceKind::Compositional => self.compositional_digester = digester,
        }
        self
    }

    /// Generate version 1 of a subject's fingerprint
    pub fn generate(&self, subject_id: &str, evidence: &Evidence) -> Result<AgentFingerprint> {
        self.generate_next(subject_id, evidence, None)
    }

    /// Generate a fingerprint whose version follows `previous`
    pub fn generate_next(
        &self,
        subject_id: &str,
        evidence: &Evidence,
        previous: Option<&AgentFingerprint>,
    ) -> Result<AgentFingerprint> {
        if subject_id.trim().is_empty() {
            return Err(FingerprintError::InvalidSubject(
                "subject_id must not be empty".to_string(),
            ));
        }
        if let Some(prev) = previous {
            if prev.subject_id != subject_id {
                return Err(FingerprintError::InvalidSubject(format!(
                    "previous fingerprint belongs to {}",
                    prev.subject_id
                )));
            }
        }

        // All four digests are computed before anything is assembled
        let static_hash = self.static_digester.digest(evidence)?;
        let behavioral_hash = self.behavioral_digester.digest(evidence)?;
        let cognitive_hash = self.cognitive_digester.digest(evidence)?;
        let compositional_hash = self.compositional_digester.digest(evidence)?;

        let composite_hash = compose(
            &static_hash,
            &behavioral_hash,
            &cognitive_hash,
            &compositional_hash,
        );
        let version = previous.map(|p| p.version + 1).unwrap_or(1);

        debug!(
            subject_id = %subject_id,
            version,
            composite = %hex::encode(composite_hash),
            "Fingerprint generated"
        );

        Ok(AgentFingerprint {
            subject_id: subject_id.to_string(),
            static_hash,
            behavioral_hash,
            cognitive_hash,
            compositional_hash,
            composite_hash,
            version,
            generated_at: now_ms(),
        })
    }
}

impl Default for FingerprintGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FingerprintGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FingerprintGenerator").finish_non_exhaustive()
    }
}
