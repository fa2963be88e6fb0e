//! Composite agent fingerprinting for QLAFS.
//!
//! An agent's identity is the digest of four independent evidence classes:
//! static (code and configuration), behavioral (probe responses),
//! cognitive (reasoning) and compositional (lineage). Each class is reduced
//! by a pluggable [`EvidenceDigester`]; the four sub-hashes are then
//! combined in a fixed order into the composite hash that validators vote
//! on.

pub mod digester;
pub mod error;
pub mod evidence;
pub mod fingerprint;
pub mod generator;
pub mod history;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use digester::{
    BehavioralDigester, CognitiveDigester, CompositionalDigester, EvidenceDigester,
    StaticDigester,
};
pub use error::{FingerprintError, Result};
pub use evidence::{
    BehaviorSample, BehavioralEvidence, CognitiveEvidence, ComponentRef, CompositionalEvidence,
    Evidence, EvidenceKind, StaticEvidence,
};
pub use fingerprint::{compose, AgentFingerprint, FingerprintComparison};
pub use generator::FingerprintGenerator;
pub use history::FingerprintHistory;
