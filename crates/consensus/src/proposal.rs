//! Per-proposal state machine.
//!
//! `idle -> pre-prepare -> prepare -> commit -> {finalized | aborted}`
//!
//! The record is purely synchronous; the engine feeds it messages and acts
//! on the returned [`VoteEffect`]. Once an outcome is set it never changes.

use crate::message::{Decision, Phase, ProposalRequest, Vote};
use crate::quorum::{QuorumCertificate, TallyInsert, VoteTally};
use qlafs_core::{now_ms, Digest};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The agreed result of a proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizedOutcome {
    pub decision: Decision,
    pub composite_hash: Digest,
    pub round: u64,
    pub certificate: QuorumCertificate,
    pub finalized_at: u64,
}

/// Why a proposal was aborted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortInfo {
    pub round: u64,
    pub phase: Phase,
    pub reason: String,
}

/// Effect of feeding a vote into the record
#[derive(Debug, Clone, PartialEq)]
pub enum VoteEffect {
    Ignored(&'static str),
    Counted,
    /// Both votes, in arrival order
    Equivocation { first: Vote, second: Vote },
    PhaseAdvanced(Phase),
    Finalized,
}

/// Current position of a proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalStatus {
    pub proposal_id: String,
    pub phase: Phase,
    pub round: u64,
    pub quorum_certificate: Option<QuorumCertificate>,
}

/// Compact record kept for history and for aborted proposals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalSummary {
    pub proposal_id: String,
    pub subject_id: String,
    pub composite_hash: Digest,
    pub phase: Phase,
    pub round: u64,
    pub view_changes: u32,
    pub decision: Option<Decision>,
    pub abort: Option<AbortInfo>,
    /// Log index of the recorded verdict
    pub log_index: Option<u64>,
    pub created_at: u64,
}

#[derive(Debug)]
pub struct ProposalRecord {
    request: Arc<ProposalRequest>,
    quorum: usize,
    round: u64,
    phase: Phase,
    leader: Option<String>,
    committee: Vec<String>,
    prepares: VoteTally,
    commits: VoteTally,
    outcome: Option<FinalizedOutcome>,
    abort: Option<AbortInfo>,
    view_changes: u32,
    log_index: Option<u64>,
    created_at: u64,
}

impl ProposalRecord {
    pub fn new(request: Arc<ProposalRequest>, quorum: usize) -> Self {
        Self {
            request,
            quorum,
            round: 0,
            phase: Phase::Idle,
            leader: None,
            committee: Vec::new(),
            prepares: VoteTally::new(),
            commits: VoteTally::new(),
            outcome: None,
            abort: None,
            view_changes: 0,
            log_index: None,
            created_at: now_ms(),
        }
    }

    pub fn request(&self) -> &Arc<ProposalRequest> {
        &self.request
    }

    pub fn proposal_id(&self) -> &str {
        &self.request.proposal_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn leader(&self) -> Option<&str> {
        self.leader.as_deref()
    }

    pub fn outcome(&self) -> Option<&FinalizedOutcome> {
        self.outcome.as_ref()
    }

    pub fn abort_info(&self) -> Option<&AbortInfo> {
        self.abort.as_ref()
    }

    /// Start `round` with a fresh committee snapshot.
    ///
    /// Returns false if the proposal is already terminal.
    pub fn begin_round(&mut self, round: u64, committee: Vec<String>, leader: String) -> bool {
        if self.phase.is_terminal() {
            return false;
        }
        if self.phase != Phase::Idle && round > self.round {
            self.view_changes += 1;
        }
        self.round = round;
        self.committee = committee;
        self.leader = Some(leader);
        self.prepares = VoteTally::new();
        self.commits = VoteTally::new();
        self.phase = Phase::PrePrepare;
        true
    }

    /// The round leader's pre-prepare was observed
    pub fn on_pre_prepare(&mut self, from: &str, round: u64) -> bool {
        if self.phase != Phase::PrePrepare
            || round != self.round
            || self.leader.as_deref() != Some(from)
        {
            return false;
        }
        self.phase = Phase::Prepare;
        true
    }

    pub fn on_vote(&mut self, vote: Vote) -> VoteEffect {
        if self.phase == Phase::Aborted || self.phase == Phase::Idle {
            return VoteEffect::Ignored("proposal not running");
        }
        if vote.round != self.round {
            return VoteEffect::Ignored("stale round");
        }
        if !self.committee.contains(&vote.validator_id) {
            return VoteEffect::Ignored("not in committee");
        }

        let voter = vote.validator_id.clone();
        let inserted = match vote.phase {
            Phase::Prepare => self.prepares.insert(vote.clone()),
            Phase::Commit => self.commits.insert(vote.clone()),
            _ => return VoteEffect::Ignored("not a vote phase"),
        };

        match inserted {
            TallyInsert::Equivocation { previous } => {
                // Excluded from every tally for the rest of the round
                self.prepares.exclude(&voter);
                self.commits.exclude(&voter);
                return VoteEffect::Equivocation {
                    first: previous,
                    second: vote,
                };
            }
            TallyInsert::Excluded => return VoteEffect::Ignored("equivocator excluded"),
            TallyInsert::Counted | TallyInsert::Duplicate => {}
        }

        if self.outcome.is_some() {
            return VoteEffect::Counted;
        }

        if let Some((decision, composite)) = self.commits.quorum_reached(self.quorum) {
            let votes = self.commits.matching(decision, &composite);
            self.outcome = Some(FinalizedOutcome {
                decision,
                composite_hash: composite,
                round: self.round,
                certificate: QuorumCertificate::from_votes(
                    self.proposal_id(),
                    self.round,
                    decision,
                    composite,
                    votes,
                ),
                finalized_at: now_ms(),
            });
            self.phase = Phase::Finalized;
            return VoteEffect::Finalized;
        }

        if self.phase < Phase::Commit && self.prepares.quorum_reached(self.quorum).is_some() {
            self.phase = Phase::Commit;
            return VoteEffect::PhaseAdvanced(Phase::Commit);
        }

        VoteEffect::Counted
    }

    /// Abort and release vote state. No partial certificate survives.
    pub fn abort(&mut self, reason: impl Into<String>) -> bool {
        if self.phase.is_terminal() {
            return false;
        }
        let phase = match self.phase {
            Phase::Idle => Phase::PrePrepare,
            p => p,
        };
        self.abort = Some(AbortInfo {
            round: self.round,
            phase,
            reason: reason.into(),
        });
        self.phase = Phase::Aborted;
        self.prepares = VoteTally::new();
        self.commits = VoteTally::new();
        true
    }

    pub fn set_log_index(&mut self, index: u64) {
        self.log_index = Some(index);
    }

    pub fn status(&self) -> ProposalStatus {
        ProposalStatus {
            proposal_id: self.proposal_id().to_string(),
            phase: self.phase,
            round: self.round,
            quorum_certificate: self.outcome.as_ref().map(|o| o.certificate.clone()),
        }
    }

    pub fn summary(&self) -> ProposalSummary {
        ProposalSummary {
            proposal_id: self.proposal_id().to_string(),
            subject_id: self.request.subject_id.clone(),
            composite_hash: self.request.fingerprint.composite_hash,
            phase: self.phase,
            round: self.round,
            view_changes: self.view_changes,
            decision: self.outcome.as_ref().map(|o| o.decision),
            abort: self.abort.clone(),
            log_index: self.log_index,
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qlafs_core::{generate_signing_key, SigningKey};
    use qlafs_fingerprint::test_support::complete_evidence;
    use qlafs_fingerprint::FingerprintGenerator;

    struct Fixture {
        keys: Vec<(String, SigningKey)>,
        record: ProposalRecord,
        composite: Digest,
    }

    fn fixture() -> Fixture {
        let evidence = complete_evidence();
        let fingerprint = FingerprintGenerator::new()
            .generate("agent-1", &evidence)
            .unwrap();
        let composite = fingerprint.composite_hash;
        let request = Arc::new(ProposalRequest {
            proposal_id: "p-1".to_string(),
            subject_id: "agent-1".to_string(),
            evidence,
            fingerprint,
        });
        let keys: Vec<_> = (1..=7)
            .map(|i| (format!("validator-{}", i), generate_signing_key()))
            .collect();
        let mut record = ProposalRecord::new(request, 5);
        let committee = keys.iter().map(|(id, _)| id.clone()).collect();
        assert!(record.begin_round(0, committee, "validator-1".to_string()));
        Fixture {
            keys,
            record,
            composite,
        }
    }

    fn vote(f: &Fixture, i: usize, phase: Phase, decision: Decision) -> Vote {
        let (id, key) = &f.keys[i];
        Vote::signed(key, id, "p-1", f.record.round(), phase, decision, f.composite, None)
    }

    #[test]
    fn test_happy_path_finalizes_with_five_votes() {
        let mut f = fixture();
        assert!(f.record.on_pre_prepare("validator-1", 0));
        assert_eq!(f.record.phase(), Phase::Prepare);

        for i in 0..4 {
            let v = vote(&f, i, Phase::Prepare, Decision::Accept);
            assert_eq!(f.record.on_vote(v), VoteEffect::Counted);
        }
        let v = vote(&f, 4, Phase::Prepare, Decision::Accept);
        assert_eq!(f.record.on_vote(v), VoteEffect::PhaseAdvanced(Phase::Commit));

        for i in 0..4 {
            let v = vote(&f, i, Phase::Commit, Decision::Accept);
            f.record.on_vote(v);
        }
        let v = vote(&f, 4, Phase::Commit, Decision::Accept);
        assert_eq!(f.record.on_vote(v), VoteEffect::Finalized);

        let outcome = f.record.outcome().unwrap();
        assert_eq!(outcome.decision, Decision::Accept);
        assert_eq!(outcome.certificate.votes.len(), 5);
        assert_eq!(f.record.status().phase, Phase::Finalized);
    }

    #[test]
    fn test_pre_prepare_from_wrong_leader_ignored() {
        let mut f = fixture();
        assert!(!f.record.on_pre_prepare("validator-2", 0));
        assert!(!f.record.on_pre_prepare("validator-1", 1));
        assert_eq!(f.record.phase(), Phase::PrePrepare);
    }

    #[test]
    fn test_outcome_is_write_once() {
        let mut f = fixture();
        for i in 0..5 {
            let v = vote(&f, i, Phase::Commit, Decision::Accept);
            f.record.on_vote(v);
        }
        let first = f.record.outcome().cloned().unwrap();

        for i in 5..7 {
            let v = vote(&f, i, Phase::Commit, Decision::Reject);
            f.record.on_vote(v);
        }
        assert_eq!(f.record.outcome(), Some(&first));
        assert!(!f.record.begin_round(1, vec![], "validator-2".to_string()));
        assert!(!f.record.abort("late"));
    }

    #[test]
    fn test_equivocation_reported_and_excluded() {
        let mut f = fixture();
        let first = vote(&f, 6, Phase::Prepare, Decision::Accept);
        let second = vote(&f, 6, Phase::Prepare, Decision::Reject);
        f.record.on_vote(first.clone());

        match f.record.on_vote(second.clone()) {
            VoteEffect::Equivocation { first: a, second: b } => {
                assert_eq!(a, first);
                assert_eq!(b, second);
            }
            other => panic!("expected equivocation, got {:?}", other),
        }

        // The equivocator's commit no longer counts
        let commit = vote(&f, 6, Phase::Commit, Decision::Accept);
        assert_eq!(
            f.record.on_vote(commit),
            VoteEffect::Ignored("equivocator excluded")
        );
    }

    #[test]
    fn test_stale_and_foreign_votes_ignored() {
        let mut f = fixture();
        let mut stale = vote(&f, 0, Phase::Prepare, Decision::Accept);
        stale.round = 3;
        assert_eq!(f.record.on_vote(stale), VoteEffect::Ignored("stale round"));

        let outsider = generate_signing_key();
        let foreign = Vote::signed(
            &outsider,
            "validator-99",
            "p-1",
            0,
            Phase::Prepare,
            Decision::Accept,
            f.composite,
            None,
        );
        assert_eq!(f.record.on_vote(foreign), VoteEffect::Ignored("not in committee"));
    }

    #[test]
    fn test_abort_releases_votes() {
        let mut f = fixture();
        f.record.on_pre_prepare("validator-1", 0);
        for i in 0..3 {
            let v = vote(&f, i, Phase::Prepare, Decision::Accept);
            f.record.on_vote(v);
        }
        assert!(f.record.abort("timeout"));
        assert_eq!(f.record.phase(), Phase::Aborted);
        assert_eq!(
            f.record.abort_info().map(|a| a.phase),
            Some(Phase::Prepare)
        );
        assert!(f.record.status().quorum_certificate.is_none());

        let v = vote(&f, 4, Phase::Prepare, Decision::Accept);
        assert_eq!(f.record.on_vote(v), VoteEffect::Ignored("proposal not running"));
    }

    #[test]
    fn test_view_change_counts() {
        let mut f = fixture();
        let committee: Vec<String> = f.keys.iter().skip(1).map(|(id, _)| id.clone()).collect();
        assert!(f.record.begin_round(1, committee, "validator-3".to_string()));
        assert_eq!(f.record.round(), 1);
        assert_eq!(f.record.summary().view_changes, 1);
    }
}
