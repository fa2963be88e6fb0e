//! Vote tallies and quorum certificates
//!
//! A [`VoteTally`] holds at most one counted vote per validator for a single
//! proposal, round and phase. Conflicting votes are equivocation: the
//! validator is excluded from the tally for the rest of the round.

use crate::error::{ConsensusError, Result};
use crate::message::{Decision, Phase, Vote};
use qlafs_core::{Digest, DomainHasher, PublicKeyBytes};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

const CERTIFICATE_DOMAIN: &[u8] = b"QLAFS-QC-V1";

/// Outcome of adding a vote to a tally
#[derive(Debug, Clone, PartialEq)]
pub enum TallyInsert {
    /// First vote from this validator
    Counted,
    /// Identical retransmission, overwrote the previous copy
    Duplicate,
    /// Conflicts with the validator's previous vote
    Equivocation { previous: Vote },
    /// Validator was already excluded for equivocating
    Excluded,
}

/// Votes for one phase of one round
#[derive(Debug, Clone, Default)]
pub struct VoteTally {
    counted: HashMap<String, Vote>,
    // Last vote seen per validator, including excluded ones, so that every
    // further flip is reported again
    last_seen: HashMap<String, Vote>,
    excluded: HashSet<String>,
}

impl VoteTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, vote: Vote) -> TallyInsert {
        let voter = vote.validator_id.clone();

        if let Some(previous) = self.last_seen.get(&voter) {
            if previous.conflicts_with(&vote) {
                let previous = previous.clone();
                self.excluded.insert(voter.clone());
                self.counted.remove(&voter);
                self.last_seen.insert(voter, vote);
                return TallyInsert::Equivocation { previous };
            }
        }

        if self.excluded.contains(&voter) {
            self.last_seen.insert(voter, vote);
            return TallyInsert::Excluded;
        }

        self.last_seen.insert(voter.clone(), vote.clone());
        match self.counted.insert(voter, vote) {
            Some(_) => TallyInsert::Duplicate,
            None => TallyInsert::Counted,
        }
    }

    /// Exclude a validator found equivocating in another phase
    pub fn exclude(&mut self, validator_id: &str) {
        self.excluded.insert(validator_id.to_string());
        self.counted.remove(validator_id);
    }

    pub fn is_excluded(&self, validator_id: &str) -> bool {
        self.excluded.contains(validator_id)
    }

    pub fn len(&self) -> usize {
        self.counted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counted.is_empty()
    }

    /// Largest group of matching votes as `(decision, composite, count)`.
    ///
    /// Ties break on the smaller `(decision, composite)` so every observer
    /// picks the same group.
    pub fn leading(&self) -> Option<(Decision, Digest, usize)> {
        let mut groups: BTreeMap<(Decision, Digest), usize> = BTreeMap::new();
        for vote in self.counted.values() {
            *groups.entry((vote.decision, vote.composite_hash)).or_default() += 1;
        }
        groups
            .into_iter()
            .max_by(|(ka, ca), (kb, cb)| ca.cmp(cb).then_with(|| kb.cmp(ka)))
            .map(|((decision, composite), count)| (decision, composite, count))
    }

    /// Group that reached `quorum`, if any
    pub fn quorum_reached(&self, quorum: usize) -> Option<(Decision, Digest)> {
        match self.leading() {
            Some((decision, composite, count)) if count >= quorum => Some((decision, composite)),
            _ => None,
        }
    }

    /// Counted votes matching a position, ordered by validator id
    pub fn matching(&self, decision: Decision, composite: &Digest) -> Vec<Vote> {
        let mut votes: Vec<Vote> = self
            .counted
            .values()
            .filter(|v| v.decision == decision && &v.composite_hash == composite)
            .cloned()
            .collect();
        votes.sort_by(|a, b| a.validator_id.cmp(&b.validator_id));
        votes
    }
}

/// Proof of finalization: 2f+1 matching signed commit votes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumCertificate {
    pub proposal_id: String,
    pub round: u64,
    pub decision: Decision,
    pub composite_hash: Digest,
    pub votes: Vec<Vote>,
}

impl QuorumCertificate {
    /// Build a certificate from matching commit votes
    pub fn from_votes(
        proposal_id: &str,
        round: u64,
        decision: Decision,
        composite_hash: Digest,
        mut votes: Vec<Vote>,
    ) -> Self {
        votes.sort_by(|a, b| a.validator_id.cmp(&b.validator_id));
        Self {
            proposal_id: proposal_id.to_string(),
            round,
            decision,
            composite_hash,
            votes,
        }
    }

    pub fn signers(&self) -> Vec<String> {
        self.votes.iter().map(|v| v.validator_id.clone()).collect()
    }

    /// Digest binding the certificate contents and every signature
    pub fn digest(&self) -> Digest {
        let mut hasher = DomainHasher::new(CERTIFICATE_DOMAIN);
        hasher
            .str_field(&self.proposal_id)
            .u64_field(self.round)
            .str_field(self.decision.as_str())
            .field(&self.composite_hash)
            .u64_field(self.votes.len() as u64);
        for vote in &self.votes {
            hasher.str_field(&vote.validator_id).field(&vote.signature);
        }
        hasher.finalize()
    }

    /// Check threshold, distinct signers, vote consistency and signatures.
    ///
    /// `public_key` resolves a validator id to its registered key.
    pub fn verify<F>(&self, quorum: usize, public_key: F) -> Result<()>
    where
        F: Fn(&str) -> Option<PublicKeyBytes>,
    {
        if self.votes.len() < quorum {
            return Err(ConsensusError::InvalidCertificate(format!(
                "{} votes, quorum is {}",
                self.votes.len(),
                quorum
            )));
        }

        let mut signers = HashSet::new();
        for vote in &self.votes {
            if !signers.insert(vote.validator_id.as_str()) {
                return Err(ConsensusError::InvalidCertificate(format!(
                    "duplicate signer {}",
                    vote.validator_id
                )));
            }
            if vote.phase != Phase::Commit
                || vote.proposal_id != self.proposal_id
                || vote.round != self.round
                || vote.decision != self.decision
                || vote.composite_hash != self.composite_hash
            {
                return Err(ConsensusError::InvalidCertificate(format!(
                    "vote from {} does not match certificate",
                    vote.validator_id
                )));
            }
            let key = public_key(&vote.validator_id)
                .ok_or_else(|| ConsensusError::UnknownValidator(vote.validator_id.clone()))?;
            vote.verify(&key)?;
        }

        Ok(())
    }
}
