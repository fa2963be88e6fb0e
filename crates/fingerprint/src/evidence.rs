//! Evidence model.
//!
//! Evidence arrives from the agent lifecycle orchestrator as JSON, so every
//! section and every required field is optional at the type level. The
//! digesters decide what is required and report `EvidenceIncomplete` when
//! something is missing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The four independent evidence classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Static,
    Behavioral,
    Cognitive,
    Compositional,
}

impl EvidenceKind {
    /// Fixed order used when composing the four sub-hashes
    pub const ALL: [EvidenceKind; 4] = [
        EvidenceKind::Static,
        EvidenceKind::Behavioral,
        EvidenceKind::Cognitive,
        EvidenceKind::Compositional,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceKind::Static => "static",
            EvidenceKind::Behavioral => "behavioral",
            EvidenceKind::Cognitive => "cognitive",
            EvidenceKind::Compositional => "compositional",
        }
    }

    /// Hash domain for this evidence class
    pub fn domain(&self) -> &'static [u8] {
        match self {
            EvidenceKind::Static => b"QLAFS-FP-STATIC-V1",
            EvidenceKind::Behavioral => b"QLAFS-FP-BEHAVIORAL-V1",
            EvidenceKind::Cognitive => b"QLAFS-FP-COGNITIVE-V1",
            EvidenceKind::Compositional => b"QLAFS-FP-COMPOSITIONAL-V1",
        }
    }
}

impl fmt::Display for EvidenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Complete evidence bundle for one agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Evidence {
    pub static_evidence: Option<StaticEvidence>,
    pub behavioral: Option<BehavioralEvidence>,
    pub cognitive: Option<CognitiveEvidence>,
    pub compositional: Option<CompositionalEvidence>,
}

/// Code and configuration identity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticEvidence {
    pub model_id: Option<String>,
    pub model_version: Option<String>,
    /// Hex digest of the deployed artifact
    pub code_digest: Option<String>,
    pub configuration: BTreeMap<String, String>,
    /// Treated as a set: order does not affect the digest
    pub dependencies: Vec<String>,
}

/// Response to a single behavioral probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorSample {
    pub probe_id: String,
    /// Hex digest of the normalized response
    pub response_digest: String,
    pub latency_ms: u64,
}

/// Observed runtime behavior
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BehavioralEvidence {
    /// Keyed by `probe_id`: order does not affect the digest
    pub samples: Vec<BehaviorSample>,
    pub error_rate: Option<f64>,
}

/// Reasoning characteristics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CognitiveEvidence {
    /// Ordered reasoning trace digests
    pub reasoning_traces: Vec<String>,
    pub capability_scores: BTreeMap<String, f64>,
}

/// A component an agent is built from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRef {
    pub name: String,
    pub digest: String,
}

/// Lineage and composition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositionalEvidence {
    pub components: Vec<ComponentRef>,
    pub parent_agents: Vec<String>,
    pub orchestration_pattern: Option<String>,
}

impl Evidence {
    pub fn with_static(mut self, evidence: StaticEvidence) -> Self {
        self.static_evidence = Some(evidence);
        self
    }

    pub fn with_behavioral(mut self, evidence: BehavioralEvidence) -> Self {
        self.behavioral = Some(evidence);
        self
    }

    pub fn with_cognitive(mut self, evidence: CognitiveEvidence) -> Self {
        self.cognitive = Some(evidence);
        self
    }

    pub fn with_compositional(mut self, evidence: CompositionalEvidence) -> Self {
        self.compositional = Some(evidence);
        self
    }
}
