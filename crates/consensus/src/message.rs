//! Consensus protocol messages and signed votes.

use crate::error::{ConsensusError, Result};
use qlafs_core::{hash_domain, sign_digest, verify_digest, Digest, PublicKeyBytes, SigningKey};
use qlafs_fingerprint::{AgentFingerprint, Evidence};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

const VOTE_DOMAIN: &[u8] = b"QLAFS-VOTE-V1";

/// Proposal lifecycle phase.
///
/// Ordering follows protocol progress, so `phase >= Phase::Commit` means the
/// proposal has at least reached commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    PrePrepare,
    Prepare,
    Commit,
    Finalized,
    Aborted,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::PrePrepare => "pre-prepare",
            Phase::Prepare => "prepare",
            Phase::Commit => "commit",
            Phase::Finalized => "finalized",
            Phase::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Finalized | Phase::Aborted)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validator's verdict on a proposed fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Accept,
    Reject,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Accept => "accept",
            Decision::Reject => "reject",
        }
    }

    pub fn flipped(&self) -> Decision {
        match self {
            Decision::Accept => Decision::Reject,
            Decision::Reject => Decision::Accept,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What is being agreed on: the submitted fingerprint and the evidence every
/// validator recomputes it from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalRequest {
    pub proposal_id: String,
    pub subject_id: String,
    pub evidence: Evidence,
    pub fingerprint: AgentFingerprint,
}

impl ProposalRequest {
    /// New request with a random proposal id
    pub fn new(evidence: Evidence, fingerprint: AgentFingerprint) -> Self {
        Self {
            proposal_id: uuid::Uuid::new_v4().to_string(),
            subject_id: fingerprint.subject_id.clone(),
            evidence,
            fingerprint,
        }
    }
}

/// Signed prepare or commit vote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub proposal_id: String,
    pub round: u64,
    /// `Prepare` or `Commit`
    pub phase: Phase,
    pub validator_id: String,
    pub decision: Decision,
    /// Composite hash the validator is voting on
    pub composite_hash: Digest,
    /// Reason given for a reject vote
    pub justification: Option<String>,
    /// Ed25519 signature over [`Vote::signing_digest`]
    pub signature: Vec<u8>,
}

impl Vote {
    /// Create and sign a vote
    #[allow(clippy::too_many_arguments)]
    pub fn signed(
        key: &SigningKey,
        validator_id: &str,
        proposal_id: &str,
        round: u64,
        phase: Phase,
        decision: Decision,
        composite_hash: Digest,
        justification: Option<String>,
    ) -> Self {
        let mut vote = Self {
            proposal_id: proposal_id.to_string(),
            round,
            phase,
            validator_id: validator_id.to_string(),
            decision,
            composite_hash,
            justification,
            signature: Vec::new(),
        };
        vote.signature = sign_digest(key, &vote.signing_digest());
        vote
    }

    /// Digest covered by the signature.
    ///
    /// The justification is advisory and not signed.
    pub fn signing_digest(&self) -> Digest {
        hash_domain(
            VOTE_DOMAIN,
            &[
                self.proposal_id.as_bytes(),
                &self.round.to_be_bytes(),
                self.phase.as_str().as_bytes(),
                self.validator_id.as_bytes(),
                self.decision.as_str().as_bytes(),
                &self.composite_hash,
            ],
        )
    }

    pub fn verify(&self, public_key: &PublicKeyBytes) -> Result<()> {
        verify_digest(public_key, &self.signing_digest(), &self.signature)
            .map_err(|_| ConsensusError::InvalidSignature(self.validator_id.clone()))
    }

    /// Same position: decision and composite hash agree
    pub fn matches(&self, other: &Vote) -> bool {
        self.decision == other.decision && self.composite_hash == other.composite_hash
    }

    /// Two votes by one validator for the same proposal, round and phase
    /// that disagree
    pub fn conflicts_with(&self, other: &Vote) -> bool {
        self.validator_id == other.validator_id
            && self.proposal_id == other.proposal_id
            && self.round == other.round
            && self.phase == other.phase
            && !self.matches(other)
    }
}

/// Messages exchanged over the [`MessageBus`](crate::network::MessageBus)
#[derive(Debug, Clone)]
pub enum ConsensusMessage {
    /// Engine asks the round leader to start a round
    Propose {
        proposal: Arc<ProposalRequest>,
        round: u64,
        committee: Arc<Vec<String>>,
    },
    /// Leader broadcasts the proposal for a round
    PrePrepare {
        proposal: Arc<ProposalRequest>,
        round: u64,
        leader: String,
        committee: Arc<Vec<String>>,
    },
    Vote(Vote),
}

impl ConsensusMessage {
    pub fn proposal_id(&self) -> &str {
        match self {
            ConsensusMessage::Propose { proposal, .. }
            | ConsensusMessage::PrePrepare { proposal, .. } => &proposal.proposal_id,
            ConsensusMessage::Vote(vote) => &vote.proposal_id,
        }
    }
}

/// Leader of `round` within an ordered committee
pub fn leader_for(committee: &[String], round: u64) -> Option<&String> {
    if committee.is_empty() {
        return None;
    }
    committee.get((round % committee.len() as u64) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use qlafs_core::generate_signing_key;

    fn vote(key: &SigningKey, decision: Decision) -> Vote {
        Vote::signed(key, "validator-1", "p-1", 0, Phase::Prepare, decision, [1u8; 32], None)
    }

    #[test]
    fn test_vote_signature_round_trip() {
        let key = generate_signing_key();
        let v = vote(&key, Decision::Accept);
        assert!(v.verify(&key.verifying_key().to_bytes()).is_ok());

        let other = generate_signing_key();
        assert!(v.verify(&other.verifying_key().to_bytes()).is_err());
    }

    #[test]
    fn test_tampered_vote_rejected() {
        let key = generate_signing_key();
        let mut v = vote(&key, Decision::Accept);
        v.decision = Decision::Reject;
        assert_eq!(
            v.verify(&key.verifying_key().to_bytes()),
            Err(ConsensusError::InvalidSignature("validator-1".to_string()))
        );
    }

    #[test]
    fn test_conflict_detection() {
        let key = generate_signing_key();
        let a = vote(&key, Decision::Accept);
        let b = vote(&key, Decision::Reject);
        assert!(a.conflicts_with(&b));
        assert!(!a.conflicts_with(&a.clone()));

        let mut next_round = b.clone();
        next_round.round = 1;
        assert!(!a.conflicts_with(&next_round));
    }

    #[test]
    fn test_leader_rotation() {
        let committee: Vec<String> = (1..=7).map(|i| format!("validator-{}", i)).collect();
        assert_eq!(leader_for(&committee, 0).unwrap(), "validator-1");
        assert_eq!(leader_for(&committee, 8).unwrap(), "validator-2");
        assert!(leader_for(&[], 0).is_none());
    }

    #[test]
    fn test_phase_ordering() {
        assert!(Phase::PrePrepare < Phase::Prepare);
        assert!(Phase::Commit < Phase::Finalized);
        assert!(Phase::Aborted.is_terminal());
        assert!(!Phase::Commit.is_terminal());
    }
}
