//! Validator participants.
//!
//! Each [`ValidatorNode`] is an independent task holding its own signing key.
//! It recomputes the proposed fingerprint from the evidence, votes, and tallies
//! its peers' prepares locally before committing.

use crate::message::{leader_for, ConsensusMessage, Decision, Phase, ProposalRequest, Vote};
use crate::network::{Endpoint, Envelope, Inbox, MessageBus};
use crate::quorum::{TallyInsert, VoteTally};
use qlafs_core::{Digest, SigningKey};
use qlafs_fingerprint::FingerprintGenerator;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Fault injection for simulation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorBehavior {
    #[default]
    Honest,
    /// Never sends anything
    Silent,
    /// Honest, except it never starts a round as leader
    SilentLeader,
    /// Sends alternating conflicting prepare votes and never commits
    Equivocating,
    /// Always votes reject in prepare, commits with the quorum
    AlwaysReject,
}

/// Votes an equivocating validator sends per round
const EQUIVOCATION_BURST: usize = 4;

#[derive(Debug)]
struct LocalRound {
    round: u64,
    pre_prepared: bool,
    proposal: Option<Arc<ProposalRequest>>,
    committee: Arc<Vec<String>>,
    prepares: VoteTally,
    committed: bool,
}

impl LocalRound {
    fn new(round: u64) -> Self {
        Self {
            round,
            pre_prepared: false,
            proposal: None,
            committee: Arc::new(Vec::new()),
            prepares: VoteTally::new(),
            committed: false,
        }
    }
}

pub struct ValidatorNode {
    validator_id: String,
    signing_key: SigningKey,
    behavior: ValidatorBehavior,
    quorum: usize,
    generator: FingerprintGenerator,
    endpoint: Endpoint,
    inbox: Inbox,
    rounds: HashMap<String, LocalRound>,
}

impl ValidatorNode {
    /// Attach a validator to `bus` under its own id
    pub fn new(
        validator_id: &str,
        signing_key: SigningKey,
        behavior: ValidatorBehavior,
        quorum: usize,
        bus: &MessageBus,
    ) -> Self {
        let (endpoint, inbox) = bus.register(validator_id);
        Self {
            validator_id: validator_id.to_string(),
            signing_key,
            behavior,
            quorum,
            generator: FingerprintGenerator::new(),
            endpoint,
            inbox,
            rounds: HashMap::new(),
        }
    }

    pub fn with_generator(mut self, generator: FingerprintGenerator) -> Self {
        self.generator = generator;
        self
    }

    pub fn validator_id(&self) -> &str {
        &self.validator_id
    }

    /// Run until the bus drops this validator's queue
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!(
            validator_id = %self.validator_id,
            behavior = ?self.behavior,
            "Validator started"
        );
        while let Some(envelope) = self.inbox.recv().await {
            if self.behavior == ValidatorBehavior::Silent {
                continue;
            }
            self.handle(envelope);
        }
        debug!(validator_id = %self.validator_id, "Validator inbox closed");
    }

    fn handle(&mut self, envelope: Envelope) {
        let Envelope { from, message } = envelope;
        match message {
            ConsensusMessage::Propose {
                proposal,
                round,
                committee,
            } => self.on_propose(proposal, round, committee),
            ConsensusMessage::PrePrepare {
                proposal,
                round,
                leader,
                committee,
            } => {
                if from != leader {
                    warn!(
                        validator_id = %self.validator_id,
                        from = %from,
                        claimed_leader = %leader,
                        "Pre-prepare sender is not the claimed leader"
                    );
                    return;
                }
                self.on_pre_prepare(proposal, round, &leader, committee);
            }
            ConsensusMessage::Vote(vote) => {
                if from != vote.validator_id {
                    warn!(
                        validator_id = %self.validator_id,
                        from = %from,
                        voter = %vote.validator_id,
                        "Vote relayed under another identity"
                    );
                    return;
                }
                self.on_vote(vote);
            }
        }
    }

    fn on_propose(&mut self, proposal: Arc<ProposalRequest>, round: u64, committee: Arc<Vec<String>>) {
        if leader_for(&committee, round) != Some(&self.validator_id) {
            return;
        }
        if self.behavior == ValidatorBehavior::SilentLeader {
            debug!(
                validator_id = %self.validator_id,
                proposal_id = %proposal.proposal_id,
                round,
                "Withholding pre-prepare"
            );
            return;
        }

        info!(
            validator_id = %self.validator_id,
            proposal_id = %proposal.proposal_id,
            round,
            "Leader broadcasting pre-prepare"
        );
        self.endpoint.broadcast(ConsensusMessage::PrePrepare {
            proposal: proposal.clone(),
            round,
            leader: self.validator_id.clone(),
            committee: committee.clone(),
        });
        let leader = self.validator_id.clone();
        self.on_pre_prepare(proposal, round, &leader, committee);
    }

    /// Local state for `round`, replacing state from older rounds
    fn local_round(&mut self, proposal_id: &str, round: u64) -> Option<&mut LocalRound> {
        let entry = self
            .rounds
            .entry(proposal_id.to_string())
            .or_insert_with(|| LocalRound::new(round));
        if round > entry.round {
            *entry = LocalRound::new(round);
        }
        if round < entry.round {
            return None;
        }
        Some(entry)
    }

    fn on_pre_prepare(
        &mut self,
        proposal: Arc<ProposalRequest>,
        round: u64,
        leader: &str,
        committee: Arc<Vec<String>>,
    ) {
        if leader_for(&committee, round).map(String::as_str) != Some(leader) {
            warn!(
                validator_id = %self.validator_id,
                leader = %leader,
                round,
                "Pre-prepare from a validator that does not lead this round"
            );
            return;
        }
        if !committee.contains(&self.validator_id) {
            return;
        }

        let proposal_id = proposal.proposal_id.clone();
        let Some(local) = self.local_round(&proposal_id, round) else {
            return;
        };
        if local.pre_prepared {
            return;
        }
        local.pre_prepared = true;
        local.proposal = Some(proposal.clone());
        local.committee = committee;

        let (decision, justification) = self.evaluate(&proposal);
        let composite = proposal.fingerprint.composite_hash;

        if self.behavior == ValidatorBehavior::Equivocating {
            let mut current = decision;
            for _ in 0..EQUIVOCATION_BURST {
                let vote = self.sign(&proposal_id, round, Phase::Prepare, current, composite, None);
                self.endpoint.broadcast(ConsensusMessage::Vote(vote));
                current = current.flipped();
            }
            return;
        }

        let vote = self.sign(&proposal_id, round, Phase::Prepare, decision, composite, justification);
        self.endpoint.broadcast(ConsensusMessage::Vote(vote.clone()));
        self.on_vote(vote);
    }

    /// Recompute the fingerprint and compare with the proposed one
    fn evaluate(&self, proposal: &ProposalRequest) -> (Decision, Option<String>) {
        if self.behavior == ValidatorBehavior::AlwaysReject {
            return (Decision::Reject, Some("policy reject".to_string()));
        }
        match self.generator.generate(&proposal.subject_id, &proposal.evidence) {
            Ok(fp) if fp.composite_hash == proposal.fingerprint.composite_hash => {
                (Decision::Accept, None)
            }
            Ok(fp) => (
                Decision::Reject,
                Some(format!(
                    "composite mismatch: recomputed {}",
                    hex::encode(fp.composite_hash)
                )),
            ),
            Err(e) => (Decision::Reject, Some(e.to_string())),
        }
    }

    fn on_vote(&mut self, vote: Vote) {
        if vote.phase != Phase::Prepare {
            return;
        }
        let quorum = self.quorum;
        let proposal_id = vote.proposal_id.clone();
        let round = vote.round;
        let Some(local) = self.local_round(&proposal_id, round) else {
            return;
        };
        if !local.committee.is_empty() && !local.committee.contains(&vote.validator_id) {
            return;
        }
        if let TallyInsert::Equivocation { .. } = local.prepares.insert(vote) {
            debug!(proposal_id = %proposal_id, round, "Peer equivocation observed");
        }

        if local.committed || !local.pre_prepared {
            return;
        }
        let Some((decision, composite)) = local.prepares.quorum_reached(quorum) else {
            return;
        };
        local.committed = true;

        if self.behavior == ValidatorBehavior::Equivocating {
            return;
        }
        let vote = self.sign(&proposal_id, round, Phase::Commit, decision, composite, None);
        debug!(
            validator_id = %self.validator_id,
            proposal_id = %proposal_id,
            round,
            decision = %decision,
            "Commit"
        );
        self.endpoint.broadcast(ConsensusMessage::Vote(vote));
    }

    fn sign(
        &self,
        proposal_id: &str,
        round: u64,
        phase: Phase,
        decision: Decision,
        composite: Digest,
        justification: Option<String>,
    ) -> Vote {
        Vote::signed(
            &self.signing_key,
            &self.validator_id,
            proposal_id,
            round,
            phase,
            decision,
            composite,
            justification,
        )
    }
}
