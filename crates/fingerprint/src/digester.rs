//! Evidence digesters.
//!
//! Each evidence class is reduced to a 32-byte digest by an
//! [`EvidenceDigester`]. Collections that carry no meaningful order are
//! sorted on every field before hashing so that validators which received the
//! same evidence in a different order still converge on the same digest.
//! Nothing is normalised or deduplicated: any change to the evidence bytes
//! changes the digest.

use crate::error::{FingerprintError, Result};
use crate::evidence::{Evidence, EvidenceKind};
use qlafs_core::{Digest, DomainHasher};

/// Capability that turns one evidence class into a sub-hash
pub trait EvidenceDigester: Send + Sync {
    /// The evidence class handled by this digester
    fn kind(&self) -> EvidenceKind;

    /// Digest the evidence or fail with `EvidenceIncomplete`
    fn digest(&self, evidence: &Evidence) -> Result<Digest>;
}

fn missing(kind: EvidenceKind, field: &str) -> FingerprintError {
    FingerprintError::EvidenceIncomplete {
        kind,
        field: field.to_string(),
    }
}

fn required<'a>(kind: EvidenceKind, field: &str, value: &'a Option<String>) -> Result<&'a str> {
    match value.as_deref() {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(missing(kind, field)),
    }
}

/// Digests model identity, artifact digest, configuration and dependencies
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticDigester;

impl EvidenceDigester for StaticDigester {
    fn kind(&self) -> EvidenceKind {
        EvidenceKind::Static
    }

    fn digest(&self, evidence: &Evidence) -> Result<Digest> {
        let kind = self.kind();
        let ev = evidence
            .static_evidence
            .as_ref()
            .ok_or_else(|| missing(kind, "static_evidence"))?;

        let model_id = required(kind, "model_id", &ev.model_id)?;
        let model_version = required(kind, "model_version", &ev.model_version)?;
        let code_digest = required(kind, "code_digest", &ev.code_digest)?;

        let mut hasher = DomainHasher::new(kind.domain());
        hasher
            .str_field(model_id)
            .str_field(model_version)
            .str_field(code_digest);

        hasher.u64_field(ev.configuration.len() as u64);
        for (key, value) in &ev.configuration {
            hasher.str_field(key).str_field(value);
        }

        let mut dependencies: Vec<&str> = ev.dependencies.iter().map(String::as_str).collect();
        dependencies.sort_unstable();
        hasher.u64_field(dependencies.len() as u64);
        for dep in dependencies {
            hasher.str_field(dep);
        }

        Ok(hasher.finalize())
    }
}

/// Digests probe responses and error rate
#[derive(Debug, Default, Clone, Copy)]
pub struct BehavioralDigester;

impl EvidenceDigester for BehavioralDigester {
    fn kind(&self) -> EvidenceKind {
        EvidenceKind::Behavioral
    }

    fn digest(&self, evidence: &Evidence) -> Result<Digest> {
        let kind = self.kind();
        let ev = evidence
            .behavioral
            .as_ref()
            .ok_or_else(|| missing(kind, "behavioral"))?;

        if ev.samples.is_empty() {
            return Err(missing(kind, "samples"));
        }
        let error_rate = ev.error_rate.ok_or_else(|| missing(kind, "error_rate"))?;

        let mut samples: Vec<_> = ev.samples.iter().collect();
        samples.sort_by(|a, b| {
            (&a.probe_id, &a.response_digest, a.latency_ms)
                .cmp(&(&b.probe_id, &b.response_digest, b.latency_ms))
        });

        let mut hasher = DomainHasher::new(kind.domain());
        hasher.u64_field(samples.len() as u64);
        for sample in samples {
            hasher
                .str_field(&sample.probe_id)
                .str_field(&sample.response_digest)
                .u64_field(sample.latency_ms);
        }
        hasher.f64_field(error_rate);

        Ok(hasher.finalize())
    }
}

/// Digests reasoning traces and capability scores
#[derive(Debug, Default, Clone, Copy)]
pub struct CognitiveDigester;

impl EvidenceDigester for CognitiveDigester {
    fn kind(&self) -> EvidenceKind {
        EvidenceKind::Cognitive
    }

    fn digest(&self, evidence: &Evidence) -> Result<Digest> {
        let kind = self.kind();
        let ev = evidence
            .cognitive
            .as_ref()
            .ok_or_else(|| missing(kind, "cognitive"))?;

        if ev.reasoning_traces.is_empty() {
            return Err(missing(kind, "reasoning_traces"));
        }
        if ev.capability_scores.is_empty() {
            return Err(missing(kind, "capability_scores"));
        }

        let mut hasher = DomainHasher::new(kind.domain());
        // Trace order is meaningful
        hasher.u64_field(ev.reasoning_traces.len() as u64);
        for trace in &ev.reasoning_traces {
            hasher.str_field(trace);
        }
        hasher.u64_field(ev.capability_scores.len() as u64);
        for (capability, score) in &ev.capability_scores {
            hasher.str_field(capability).f64_field(*score);
        }

        Ok(hasher.finalize())
    }
}

/// Digests components, lineage and orchestration pattern
#[derive(Debug, Default, Clone, Copy)]
pub struct CompositionalDigester;

impl EvidenceDigester for CompositionalDigester {
    fn kind(&self) -> EvidenceKind {
        EvidenceKind::Compositional
    }

    fn digest(&self, evidence: &Evidence) -> Result<Digest> {
        let kind = self.kind();
        let ev = evidence
            .compositional
            .as_ref()
            .ok_or_else(|| missing(kind, "compositional"))?;

        if ev.components.is_empty() {
            return Err(missing(kind, "components"));
        }
        let pattern = required(kind, "orchestration_pattern", &ev.orchestration_pattern)?;

        let mut components: Vec<_> = ev.components.iter().collect();
        components.sort_by(|a, b| (&a.name, &a.digest).cmp(&(&b.name, &b.digest)));

        let mut parents: Vec<&str> = ev.parent_agents.iter().map(String::as_str).collect();
        parents.sort_unstable();

        let mut hasher = DomainHasher::new(kind.domain());
        hasher.u64_field(components.len() as u64);
        for component in components {
            hasher
                .str_field(&component.name)
                .str_field(&component.digest);
        }
        hasher.u64_field(parents.len() as u64);
        for parent in parents {
            hasher.str_field(parent);
        }
        hasher.str_field(pattern);

        Ok(hasher.finalize())
    }
}
