//! Derivation of trust inputs from log history and the registry.

use qlafs_consensus::{Decision, ValidatorRegistry, ValidatorStatus};
use qlafs_transparency::LogEntry;
use serde::{Deserialize, Serialize};

/// The five normalized terms of the trust formula, each in `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TrustInputs {
    pub verification_history: f64,
    pub consensus_participation: f64,
    pub behavioral_consistency: f64,
    pub performance_metrics: f64,
    pub security_incidents: f64,
}

impl TrustInputs {
    /// Derive inputs for one subject.
    ///
    /// `entries` are the subject's log entries oldest first. `performance` is
    /// supplied by the metrics collaborator; absent means 0.0.
    pub fn derive(
        entries: &[LogEntry],
        registry: &ValidatorRegistry,
        performance: Option<f64>,
        incident_saturation: u32,
    ) -> Self {
        Self {
            verification_history: verification_history(entries),
            consensus_participation: consensus_participation(entries, registry),
            behavioral_consistency: behavioral_consistency(entries),
            performance_metrics: normalize(performance.unwrap_or(0.0)),
            security_incidents: security_incidents(entries, incident_saturation),
        }
    }

    /// Copy with every term forced into `[0, 1]`; NaN becomes 0
    pub fn clamped(&self) -> Self {
        Self {
            verification_history: normalize(self.verification_history),
            consensus_participation: normalize(self.consensus_participation),
            behavioral_consistency: normalize(self.behavioral_consistency),
            performance_metrics: normalize(self.performance_metrics),
            security_incidents: normalize(self.security_incidents),
        }
    }
}

pub(crate) fn normalize(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn accepted(entries: &[LogEntry]) -> impl Iterator<Item = &LogEntry> {
    entries
        .iter()
        .filter(|e| e.payload.decision == Decision::Accept)
}

/// Accepted verdicts over all finalized verdicts
fn verification_history(entries: &[LogEntry]) -> f64 {
    if entries.is_empty() {
        return 0.0;
    }
    accepted(entries).count() as f64 / entries.len() as f64
}

/// Mean share of each certificate's signers still in good standing.
///
/// Suspicion is a temporary liveness penalty, so suspected signers still
/// count; blacklisted or deregistered ones do not.
fn consensus_participation(entries: &[LogEntry], registry: &ValidatorRegistry) -> f64 {
    let fractions: Vec<f64> = entries
        .iter()
        .filter(|e| !e.payload.signers.is_empty())
        .map(|e| {
            let good = e
                .payload
                .signers
                .iter()
                .filter(|id| {
                    matches!(
                        registry.status(id),
                        Some(ValidatorStatus::Active | ValidatorStatus::Suspected)
                    )
                })
                .count();
            good as f64 / e.payload.signers.len() as f64
        })
        .collect();

    if fractions.is_empty() {
        return 0.0;
    }
    fractions.iter().sum::<f64>() / fractions.len() as f64
}

/// One minus the share of consecutive accepted verdicts whose behavioral
/// hash changed
fn behavioral_consistency(entries: &[LogEntry]) -> f64 {
    let hashes: Vec<_> = accepted(entries).map(|e| e.payload.behavioral_hash).collect();
    match hashes.len() {
        0 => 0.0,
        1 => 1.0,
        n => {
            let changes = hashes.windows(2).filter(|w| w[0] != w[1]).count();
            1.0 - changes as f64 / (n - 1) as f64
        }
    }
}

/// Rejected verdicts relative to the saturation point
fn security_incidents(entries: &[LogEntry], saturation: u32) -> f64 {
    let rejected = entries
        .iter()
        .filter(|e| e.payload.decision == Decision::Reject)
        .count();
    if rejected == 0 {
        return 0.0;
    }
    if saturation == 0 {
        return 1.0;
    }
    (rejected as f64 / saturation as f64).min(1.0)
}
