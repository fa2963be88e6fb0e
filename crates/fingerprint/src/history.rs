//! Per-subject fingerprint history.

use crate::error::{FingerprintError, Result};
use crate::fingerprint::AgentFingerprint;
use std::collections::HashMap;

/// Ordered fingerprint versions per subject.
///
/// Versions must strictly increase per subject; older entries are never
/// rewritten.
#[derive(Debug, Default, Clone)]
pub struct FingerprintHistory {
    entries: HashMap<String, Vec<AgentFingerprint>>,
}

impl FingerprintHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fingerprint after checking integrity and version order
    pub fn record(&mut self, fingerprint: AgentFingerprint) -> Result<()> {
        fingerprint.verify_integrity()?;

        let versions = self
            .entries
            .entry(fingerprint.subject_id.clone())
            .or_default();
        if let Some(latest) = versions.last() {
            if fingerprint.version <= latest.version {
                return Err(FingerprintError::NonMonotonicVersion {
                    subject_id: fingerprint.subject_id.clone(),
                    latest: latest.version,
                    got: fingerprint.version,
                });
            }
        }
        versions.push(fingerprint);
        Ok(())
    }

    pub fn latest(&self, subject_id: &str) -> Option<&AgentFingerprint> {
        self.entries.get(subject_id).and_then(|v| v.last())
    }

    /// All versions for a subject, oldest first
    pub fn versions(&self, subject_id: &str) -> &[AgentFingerprint] {
        self.entries
            .get(subject_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn subjects(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}
