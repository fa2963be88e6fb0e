//! Consensus Engine - bounded-round pBFT agreement over the active set
//!
//! # Architecture
//!
//! - A **router** task reads the engine's bus endpoint and feeds pre-prepares
//!   and verified votes into per-proposal [`ProposalRecord`]s. It reports
//!   equivocation to the registry and publishes phase progress on a `watch`
//!   channel per proposal.
//! - A **driver** task per proposal runs views: snapshot the active set, ask
//!   the round leader to propose, then wait on "quorum reached or deadline"
//!   for each phase. A missed deadline suspects the leader and restarts with
//!   round + 1.
//! - A **supervisor** task awaits the driver. A driver panic aborts only its
//!   own proposal.
//!
//! Finalized verdicts are handed to a [`VerdictSink`] with retry and
//! exponential backoff on transient failures.

use crate::error::{ConsensusError, Result};
use crate::message::{leader_for, ConsensusMessage, Decision, Phase, ProposalRequest, Vote};
use crate::network::{Endpoint, Envelope, Inbox, MessageBus, ENGINE_ENDPOINT};
use crate::proposal::{
    AbortInfo, FinalizedOutcome, ProposalRecord, ProposalStatus, ProposalSummary, VoteEffect,
};
use crate::quorum::QuorumCertificate;
use crate::registry::{FaultEvidence, SharedRegistry, ValidatorStatus};
use qlafs_core::{ConsensusConfig, Digest};
use qlafs_fingerprint::AgentFingerprint;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 1024;

/// A finalized verdict handed to the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizedVerdict {
    pub proposal_id: String,
    pub subject_id: String,
    pub fingerprint: AgentFingerprint,
    pub decision: Decision,
    pub round: u64,
    pub certificate: QuorumCertificate,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// Worth retrying, e.g. the log is sealing
    #[error("Transient sink failure: {0}")]
    Transient(String),
    #[error("Permanent sink failure: {0}")]
    Permanent(String),
}

/// Append contract the engine uses to record verdicts.
///
/// The transparency log is the only implementation outside tests.
pub trait VerdictSink: Send + Sync {
    /// Record a verdict and return its log index
    fn append(&self, verdict: &FinalizedVerdict) -> std::result::Result<u64, SinkError>;
}

/// Notifications for external collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsensusEvent {
    FaultReported {
        validator_id: String,
        proposal_id: String,
        round: u64,
        phase: Phase,
        status: ValidatorStatus,
    },
    ViewChanged {
        proposal_id: String,
        /// The round being started
        round: u64,
        suspected_leader: String,
    },
    Finalized {
        proposal_id: String,
        round: u64,
        decision: Decision,
        composite_hash: Digest,
    },
    Recorded {
        proposal_id: String,
        log_index: u64,
    },
    Aborted {
        proposal_id: String,
        round: u64,
        phase: Phase,
        reason: String,
    },
}

/// Caller-facing result of a proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProposalResult {
    Finalized {
        outcome: FinalizedOutcome,
        log_index: Option<u64>,
    },
    Pending,
    Aborted(AbortInfo),
    NotFound,
}

struct ProposalSlot {
    record: Mutex<ProposalRecord>,
    progress: watch::Sender<Phase>,
    /// Set once the supervisor has finished with the proposal
    done: watch::Sender<bool>,
    /// Finalization has been announced to the registry and subscribers
    announced: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct EngineInner {
    config: ConsensusConfig,
    registry: SharedRegistry,
    bus: MessageBus,
    endpoint: Endpoint,
    sink: Option<Arc<dyn VerdictSink>>,
    live: Mutex<HashMap<String, Arc<ProposalSlot>>>,
    tombstones: Mutex<HashMap<String, ProposalSummary>>,
    order: Mutex<Vec<String>>,
    events: broadcast::Sender<ConsensusEvent>,
}

/// Handle to the running consensus engine
#[derive(Clone)]
pub struct ConsensusEngine {
    inner: Arc<EngineInner>,
}

impl ConsensusEngine {
    /// Register on `bus` and start the router task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: ConsensusConfig,
        registry: SharedRegistry,
        bus: MessageBus,
        sink: Option<Arc<dyn VerdictSink>>,
    ) -> Self {
        let (endpoint, inbox) = bus.register(ENGINE_ENDPOINT);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(EngineInner {
            config,
            registry,
            bus,
            endpoint,
            sink,
            live: Mutex::new(HashMap::new()),
            tombstones: Mutex::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
            events,
        });

        tokio::spawn(inner.clone().route(inbox));
        info!(
            quorum = inner.config.quorum(),
            phase_timeout_ms = inner.config.phase_timeout_ms,
            max_view_changes = inner.config.max_view_changes,
            "Consensus engine started"
        );
        Self { inner }
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.inner.registry
    }

    /// Start agreement on a proposal and return its id
    pub async fn submit(&self, request: ProposalRequest) -> Result<String> {
        if !self.inner.bus.is_registered(ENGINE_ENDPOINT) {
            return Err(ConsensusError::EngineShutdown);
        }
        request.fingerprint.verify_integrity()?;

        let quorum = self.inner.config.quorum();
        let active = self.inner.registry.read().await.active_set().len();
        if active < quorum {
            return Err(ConsensusError::InsufficientValidators {
                active,
                required: quorum,
            });
        }

        let proposal_id = request.proposal_id.clone();
        let (progress, _) = watch::channel(Phase::Idle);
        let (done, _) = watch::channel(false);
        let slot = Arc::new(ProposalSlot {
            record: Mutex::new(ProposalRecord::new(Arc::new(request), quorum)),
            progress,
            done,
            announced: AtomicBool::new(false),
        });

        {
            let mut live = lock(&self.inner.live);
            if live.contains_key(&proposal_id)
                || lock(&self.inner.tombstones).contains_key(&proposal_id)
            {
                return Err(ConsensusError::DuplicateProposal(proposal_id));
            }
            live.insert(proposal_id.clone(), slot.clone());
            lock(&self.inner.order).push(proposal_id.clone());
        }

        info!(proposal_id = %proposal_id, active, "Proposal submitted");
        let driver = tokio::spawn(self.inner.clone().drive(slot.clone()));
        tokio::spawn(self.inner.clone().supervise(slot, driver));
        Ok(proposal_id)
    }

    pub fn status(&self, proposal_id: &str) -> Option<ProposalStatus> {
        if let Some(slot) = self.inner.slot(proposal_id) {
            return Some(lock(&slot.record).status());
        }
        lock(&self.inner.tombstones)
            .get(proposal_id)
            .map(|summary| ProposalStatus {
                proposal_id: summary.proposal_id.clone(),
                phase: summary.phase,
                round: summary.round,
                quorum_certificate: None,
            })
    }

    pub fn result(&self, proposal_id: &str) -> ProposalResult {
        self.inner.result(proposal_id)
    }

    /// Wait until the proposal is finalized and recorded, or aborted
    pub async fn await_result(&self, proposal_id: &str) -> ProposalResult {
        if let Some(slot) = self.inner.slot(proposal_id) {
            let mut done = slot.done.subscribe();
            // The sender lives in the slot we hold, so this only fails if the
            // value can never change
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.inner.result(proposal_id)
    }

    /// Summaries of every proposal in submission order
    pub fn history(&self) -> Vec<ProposalSummary> {
        let order = lock(&self.inner.order).clone();
        order
            .iter()
            .filter_map(|id| match self.inner.slot(id) {
                Some(slot) => Some(lock(&slot.record).summary()),
                None => lock(&self.inner.tombstones).get(id).cloned(),
            })
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsensusEvent> {
        self.inner.events.subscribe()
    }

    /// Detach from the bus; the router exits once its queue drains
    pub fn shutdown(&self) {
        self.inner.bus.unregister(ENGINE_ENDPOINT);
        info!("Consensus engine shut down");
    }
}

impl EngineInner {
    fn slot(&self, proposal_id: &str) -> Option<Arc<ProposalSlot>> {
        lock(&self.live).get(proposal_id).cloned()
    }

    fn emit(&self, event: ConsensusEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn result(&self, proposal_id: &str) -> ProposalResult {
        if let Some(slot) = self.slot(proposal_id) {
            let record = lock(&slot.record);
            return match record.outcome() {
                Some(outcome) if *slot.done.borrow() => ProposalResult::Finalized {
                    outcome: outcome.clone(),
                    log_index: record.summary().log_index,
                },
                _ => ProposalResult::Pending,
            };
        }
        match lock(&self.tombstones).get(proposal_id) {
            Some(summary) => match &summary.abort {
                Some(abort) => ProposalResult::Aborted(abort.clone()),
                None => ProposalResult::Pending,
            },
            None => ProposalResult::NotFound,
        }
    }

    async fn route(self: Arc<Self>, mut inbox: Inbox) {
        while let Some(envelope) = inbox.recv().await {
            self.handle(envelope).await;
        }
        debug!("Consensus router stopped");
    }

    async fn handle(&self, envelope: Envelope) {
        let Envelope { from, message } = envelope;
        match message {
            ConsensusMessage::PrePrepare {
                proposal,
                round,
                leader,
                ..
            } => {
                if from != leader {
                    return;
                }
                let Some(slot) = self.slot(&proposal.proposal_id) else {
                    return;
                };
                let advanced = lock(&slot.record).on_pre_prepare(&from, round);
                if advanced {
                    debug!(proposal_id = %proposal.proposal_id, round, leader = %from, "Pre-prepare observed");
                    slot.progress.send_replace(Phase::Prepare);
                }
            }
            ConsensusMessage::Vote(vote) => self.on_vote(&from, vote).await,
            ConsensusMessage::Propose { .. } => {}
        }
    }

    async fn on_vote(&self, from: &str, vote: Vote) {
        if from != vote.validator_id {
            warn!(from = %from, voter = %vote.validator_id, "Vote relayed under another identity");
            return;
        }
        let Some(slot) = self.slot(&vote.proposal_id) else {
            debug!(proposal_id = %vote.proposal_id, "Vote for unknown proposal");
            return;
        };

        let public_key = self.registry.read().await.public_key(&vote.validator_id);
        let Some(public_key) = public_key else {
            debug!(validator_id = %vote.validator_id, "Vote from unregistered validator");
            return;
        };
        if vote.verify(&public_key).is_err() {
            let evidence = FaultEvidence::InvalidSignature {
                proposal_id: vote.proposal_id.clone(),
                round: vote.round,
                phase: vote.phase,
            };
            self.report_fault(&vote.validator_id, &vote.proposal_id, vote.round, vote.phase, evidence)
                .await;
            return;
        }

        let effect = lock(&slot.record).on_vote(vote);
        match effect {
            VoteEffect::Equivocation { first, second } => {
                let (validator_id, proposal_id, round, phase) = (
                    second.validator_id.clone(),
                    second.proposal_id.clone(),
                    second.round,
                    second.phase,
                );
                warn!(
                    validator_id = %validator_id,
                    proposal_id = %proposal_id,
                    round,
                    phase = %phase,
                    "Equivocation detected"
                );
                self.report_fault(
                    &validator_id,
                    &proposal_id,
                    round,
                    phase,
                    FaultEvidence::Equivocation { first, second },
                )
                .await;
            }
            VoteEffect::PhaseAdvanced(phase) => {
                slot.progress.send_replace(phase);
            }
            VoteEffect::Finalized => {
                slot.progress.send_replace(Phase::Finalized);
            }
            VoteEffect::Counted | VoteEffect::Ignored(_) => {}
        }
    }

    async fn report_fault(
        &self,
        validator_id: &str,
        proposal_id: &str,
        round: u64,
        phase: Phase,
        evidence: FaultEvidence,
    ) {
        let status = self
            .registry
            .write()
            .await
            .report_fault(validator_id, evidence);
        match status {
            Ok(status) => self.emit(ConsensusEvent::FaultReported {
                validator_id: validator_id.to_string(),
                proposal_id: proposal_id.to_string(),
                round,
                phase,
                status,
            }),
            Err(e) => warn!(validator_id = %validator_id, error = %e, "Fault report failed"),
        }
    }

    async fn drive(self: Arc<Self>, slot: Arc<ProposalSlot>) -> Result<(FinalizedOutcome, Option<u64>)> {
        let outcome = match self.run_views(&slot).await {
            Ok(outcome) => outcome,
            // The last commit can land as a deadline fires; the outcome stands
            Err(err) => {
                let finalized = lock(&slot.record).outcome().cloned();
                match finalized {
                    Some(outcome) => {
                        debug!(error = %err, "Outcome reached at the phase deadline");
                        outcome
                    }
                    None => return Err(err),
                }
            }
        };
        let log_index = self.complete(&slot, &outcome).await;
        Ok((outcome, log_index))
    }

    /// Run views until a commit quorum forms or view changes run out
    async fn run_views(&self, slot: &ProposalSlot) -> Result<FinalizedOutcome> {
        let quorum = self.config.quorum();
        let deadline = Duration::from_millis(self.config.phase_timeout_ms);
        let request = lock(&slot.record).request().clone();
        let proposal_id = request.proposal_id.clone();
        let mut progress = slot.progress.subscribe();
        let mut round = 0u64;

        loop {
            let snapshot = self.registry.read().await.active_set();
            if snapshot.len() < quorum {
                return Err(ConsensusError::InsufficientValidators {
                    active: snapshot.len(),
                    required: quorum,
                });
            }
            let committee: Vec<String> = snapshot.into_iter().map(|m| m.validator_id).collect();
            let leader = leader_for(&committee, round)
                .cloned()
                .ok_or(ConsensusError::InsufficientValidators {
                    active: 0,
                    required: quorum,
                })?;

            let started = lock(&slot.record).begin_round(round, committee.clone(), leader.clone());
            if !started {
                return Err(ConsensusError::DriverFailed(format!(
                    "proposal {} already terminal",
                    proposal_id
                )));
            }
            slot.progress.send_replace(Phase::PrePrepare);
            info!(
                proposal_id = %proposal_id,
                round,
                leader = %leader,
                committee = committee.len(),
                "Round started"
            );
            self.endpoint.send(
                &leader,
                ConsensusMessage::Propose {
                    proposal: request.clone(),
                    round,
                    committee: Arc::new(committee),
                },
            );

            match await_phases(&mut progress, deadline).await {
                Ok(()) => {
                    let outcome = lock(&slot.record).outcome().cloned();
                    return outcome.ok_or_else(|| {
                        ConsensusError::DriverFailed("finalized without outcome".to_string())
                    });
                }
                Err(phase) => {
                    if round >= self.config.max_view_changes as u64 {
                        warn!(proposal_id = %proposal_id, round, phase = %phase, "View changes exhausted");
                        return Err(ConsensusError::ConsensusTimeout { round, phase });
                    }
                    warn!(
                        proposal_id = %proposal_id,
                        round,
                        phase = %phase,
                        leader = %leader,
                        "Phase deadline missed, changing view"
                    );
                    if let Err(e) = self.registry.write().await.suspect(&leader, round) {
                        warn!(leader = %leader, error = %e, "Could not suspect leader");
                    }
                    round += 1;
                    self.emit(ConsensusEvent::ViewChanged {
                        proposal_id: proposal_id.clone(),
                        round,
                        suspected_leader: leader,
                    });
                }
            }
        }
    }

    /// Announce a finalized outcome once, then hand the verdict to the sink
    async fn complete(&self, slot: &ProposalSlot, outcome: &FinalizedOutcome) -> Option<u64> {
        let request = lock(&slot.record).request().clone();
        if !slot.announced.swap(true, Ordering::SeqCst) {
            info!(
                proposal_id = %request.proposal_id,
                round = outcome.round,
                decision = %outcome.decision,
                signers = outcome.certificate.votes.len(),
                "Proposal finalized"
            );
            self.registry
                .write()
                .await
                .record_participation(&outcome.certificate.signers(), outcome.round);
            self.emit(ConsensusEvent::Finalized {
                proposal_id: request.proposal_id.clone(),
                round: outcome.round,
                decision: outcome.decision,
                composite_hash: outcome.composite_hash,
            });
        }

        let verdict = FinalizedVerdict {
            proposal_id: request.proposal_id.clone(),
            subject_id: request.subject_id.clone(),
            fingerprint: request.fingerprint.clone(),
            decision: outcome.decision,
            round: outcome.round,
            certificate: outcome.certificate.clone(),
        };
        self.deliver(&verdict).await
    }

    /// Hand a verdict to the sink, retrying transient failures
    async fn deliver(&self, verdict: &FinalizedVerdict) -> Option<u64> {
        let sink = self.sink.as_ref()?;
        let mut delay = Duration::from_millis(self.config.sink_retry_base_ms);

        for attempt in 1..=self.config.sink_retry_attempts {
            match sink.append(verdict) {
                Ok(index) => return Some(index),
                Err(SinkError::Transient(reason)) => {
                    warn!(
                        proposal_id = %verdict.proposal_id,
                        attempt,
                        reason = %reason,
                        "Verdict append deferred"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(SinkError::Permanent(reason)) => {
                    error!(proposal_id = %verdict.proposal_id, reason = %reason, "Verdict append failed");
                    return None;
                }
            }
        }
        error!(
            proposal_id = %verdict.proposal_id,
            attempts = self.config.sink_retry_attempts,
            "Verdict append retries exhausted"
        );
        None
    }

    async fn supervise(
        self: Arc<Self>,
        slot: Arc<ProposalSlot>,
        driver: JoinHandle<Result<(FinalizedOutcome, Option<u64>)>>,
    ) {
        let result = match driver.await {
            Ok(result) => result,
            Err(join_error) => {
                let reason = if join_error.is_panic() {
                    "proposal driver panicked"
                } else {
                    "proposal driver cancelled"
                };
                error!(reason, "Proposal driver failed");
                Err(ConsensusError::DriverFailed(reason.to_string()))
            }
        };

        match result {
            Ok((outcome, log_index)) => {
                self.mark_recorded(&slot, log_index);
                debug!(round = outcome.round, "Proposal complete");
            }
            Err(err) => {
                if let Some(outcome) = self.abort(&slot, err) {
                    let log_index = self.clone().redeliver(slot.clone(), outcome).await;
                    self.mark_recorded(&slot, log_index);
                }
            }
        }
        slot.done.send_replace(true);
    }

    fn mark_recorded(&self, slot: &ProposalSlot, log_index: Option<u64>) {
        let Some(log_index) = log_index else {
            return;
        };
        let proposal_id = {
            let mut record = lock(&slot.record);
            record.set_log_index(log_index);
            record.proposal_id().to_string()
        };
        self.emit(ConsensusEvent::Recorded {
            proposal_id,
            log_index,
        });
    }

    /// Second delivery attempt for an outcome whose driver failed, isolated
    /// in its own task so a panicking sink cannot take the supervisor down
    async fn redeliver(self: Arc<Self>, slot: Arc<ProposalSlot>, outcome: FinalizedOutcome) -> Option<u64> {
        let proposal_id = lock(&slot.record).proposal_id().to_string();
        warn!(proposal_id = %proposal_id, "Driver failed after finalization, redelivering verdict");
        let task = tokio::spawn(async move { self.complete(&slot, &outcome).await });
        match task.await {
            Ok(log_index) => log_index,
            Err(join_error) => {
                error!(proposal_id = %proposal_id, error = %join_error, "Verdict redelivery failed");
                None
            }
        }
    }

    /// Abort a proposal and replace its state with a tombstone.
    ///
    /// Returns the outcome instead when the proposal finalized first.
    fn abort(&self, slot: &ProposalSlot, err: ConsensusError) -> Option<FinalizedOutcome> {
        let summary = {
            let mut record = lock(&slot.record);
            if !record.abort(err.to_string()) {
                return record.outcome().cloned();
            }
            record.summary()
        };

        let proposal_id = summary.proposal_id.clone();
        let abort = summary.abort.clone();
        lock(&self.tombstones).insert(proposal_id.clone(), summary);
        lock(&self.live).remove(&proposal_id);
        slot.progress.send_replace(Phase::Aborted);

        if let Some(abort) = abort {
            warn!(
                proposal_id = %proposal_id,
                round = abort.round,
                phase = %abort.phase,
                reason = %abort.reason,
                "Proposal aborted"
            );
            self.emit(ConsensusEvent::Aborted {
                proposal_id,
                round: abort.round,
                phase: abort.phase,
                reason: abort.reason,
            });
        }
        None
    }
}

/// Wait for pre-prepare, prepare quorum and commit quorum in turn, each
/// under its own deadline. On timeout returns the phase that stalled.
async fn await_phases(
    progress: &mut watch::Receiver<Phase>,
    deadline: Duration,
) -> std::result::Result<(), Phase> {
    for target in [Phase::Prepare, Phase::Commit, Phase::Finalized] {
        let reached = tokio::time::timeout(deadline, progress.wait_for(|p| *p >= target))
            .await
            .map(|r| r.is_ok());
        match reached {
            Ok(true) => {}
            Ok(false) | Err(_) => return Err(*progress.borrow()),
        }
    }
    Ok(())
}
