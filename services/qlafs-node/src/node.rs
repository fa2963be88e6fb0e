//! The coordinating trust node.
//!
//! `TrustNode` owns one instance of every component and wires them
//! together: the fingerprint generator feeds proposals to the consensus
//! engine, the engine consults the shared registry and hands finalized
//! verdicts to the transparency log, and trust scores are computed from the
//! log and the registry on demand. Nothing is global; tests build as many
//! nodes as they like.

use crate::error::{NodeError, Result};
use qlafs_consensus::{
    ConsensusEngine, ConsensusEvent, FaultEvidence, MessageBus, ProposalRequest, ProposalResult,
    ProposalStatus, ProposalSummary, SharedRegistry, ValidatorBehavior, ValidatorNode,
    ValidatorRegistry, ValidatorStatus, VerdictSink,
};
use qlafs_core::{
    generate_signing_key, signing_key_from_hex, AnchorKind, Digest, PublicKeyBytes, QlafsConfig,
    SigningKey, StoreKind,
};
use qlafs_fingerprint::{AgentFingerprint, Evidence, FingerprintGenerator, FingerprintHistory};
use qlafs_transparency::{
    AnchoringJob, ConsistencyProof, EntryVerification, FileAnchor, LogEntry, MemoryAnchor,
    SignedTreeHead, SqliteStore, TransparencyLog,
};
use qlafs_trust::{TrustCalculator, TrustScore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct TrustNode {
    config: QlafsConfig,
    bus: MessageBus,
    registry: SharedRegistry,
    engine: ConsensusEngine,
    log: Arc<TransparencyLog>,
    generator: FingerprintGenerator,
    /// Held across `engine.submit` so versions are assigned in order
    fingerprints: tokio::sync::Mutex<FingerprintHistory>,
    trust: TrustCalculator,
    performance: Mutex<HashMap<String, f64>>,
    hosted: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TrustNode {
    /// Build every component from configuration and spawn the configured
    /// validators.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: QlafsConfig) -> Result<Self> {
        config.validate()?;
        let log = Arc::new(open_log(&config)?);
        Self::start_with_log(config, log)
    }

    /// Like [`TrustNode::start`] with an already opened log
    pub fn start_with_log(config: QlafsConfig, log: Arc<TransparencyLog>) -> Result<Self> {
        let trust = TrustCalculator::from_config(&config.trust)?;
        let quorum = config.consensus.quorum();

        let mut registry = ValidatorRegistry::new(config.registry.clone());
        let mut committee = Vec::new();
        for validator in &config.node.validators {
            let key = match &validator.seed {
                Some(seed) => signing_key_from_hex(seed)?,
                None => generate_signing_key(),
            };
            registry.register(&validator.validator_id, key.verifying_key().to_bytes());
            committee.push((validator.validator_id.clone(), key));
        }
        let registry: SharedRegistry = Arc::new(tokio::sync::RwLock::new(registry));

        let bus = MessageBus::new();
        let mut hosted = HashMap::new();
        for (validator_id, key) in committee {
            let handle =
                ValidatorNode::new(&validator_id, key, ValidatorBehavior::Honest, quorum, &bus)
                    .spawn();
            hosted.insert(validator_id, handle);
        }

        let sink: Arc<dyn VerdictSink> = log.clone();
        let engine = ConsensusEngine::start(
            config.consensus.clone(),
            registry.clone(),
            bus.clone(),
            Some(sink),
        );

        info!(
            node_id = %config.node.node_id,
            validators = hosted.len(),
            quorum,
            log_entries = log.size(),
            "Trust node started"
        );

        Ok(Self {
            config,
            bus,
            registry,
            engine,
            log,
            generator: FingerprintGenerator::new(),
            fingerprints: tokio::sync::Mutex::new(FingerprintHistory::new()),
            trust,
            performance: Mutex::new(HashMap::new()),
            hosted: Mutex::new(hosted),
        })
    }

    pub fn config(&self) -> &QlafsConfig {
        &self.config
    }

    pub fn engine(&self) -> &ConsensusEngine {
        &self.engine
    }

    pub fn log(&self) -> &Arc<TransparencyLog> {
        &self.log
    }

    /// Fingerprint the evidence and start consensus on it
    pub async fn submit(&self, subject_id: &str, evidence: Evidence) -> Result<String> {
        let mut history = self.fingerprints.lock().await;
        let fingerprint =
            self.generator
                .generate_next(subject_id, &evidence, history.latest(subject_id))?;

        let request = ProposalRequest::new(evidence, fingerprint.clone());
        let proposal_id = self.engine.submit(request).await?;
        history.record(fingerprint)?;

        info!(proposal_id = %proposal_id, subject_id = %subject_id, "Fingerprint submitted");
        Ok(proposal_id)
    }

    pub fn status(&self, proposal_id: &str) -> Option<ProposalStatus> {
        self.engine.status(proposal_id)
    }

    pub fn result(&self, proposal_id: &str) -> ProposalResult {
        self.engine.result(proposal_id)
    }

    /// Wait until the proposal is recorded or aborted
    pub async fn await_result(&self, proposal_id: &str) -> ProposalResult {
        self.engine.await_result(proposal_id).await
    }

    pub fn history(&self) -> Vec<ProposalSummary> {
        self.engine.history()
    }

    pub fn verify_entry(&self, entry_hash: &Digest) -> Result<EntryVerification> {
        Ok(self.log.verify_entry(entry_hash)?)
    }

    pub fn tree_head(&self) -> Option<SignedTreeHead> {
        self.log.tree_head()
    }

    pub fn seal_tree_head(&self) -> Result<SignedTreeHead> {
        Ok(self.log.seal_tree_head()?)
    }

    pub fn prove_consistency(&self, old_size: u64, new_size: u64) -> Result<ConsistencyProof> {
        Ok(self.log.prove_consistency(old_size, new_size)?)
    }

    pub fn log_entry_for(&self, proposal_id: &str) -> Option<LogEntry> {
        self.log.entry_for_proposal(proposal_id)
    }

    /// Register an externally hosted validator
    pub async fn register(&self, validator_id: &str, public_key: PublicKeyBytes) {
        self.registry.write().await.register(validator_id, public_key);
    }

    /// Remove a validator, stopping it if this node hosts it
    pub async fn deregister(&self, validator_id: &str) -> Result<()> {
        self.registry.write().await.deregister(validator_id)?;
        if let Some(handle) = lock(&self.hosted).remove(validator_id) {
            self.bus.unregister(validator_id);
            handle.abort();
        }
        Ok(())
    }

    pub async fn report_fault(&self, validator_id: &str, reason: &str) -> Result<ValidatorStatus> {
        let evidence = FaultEvidence::Reported {
            reason: reason.to_string(),
        };
        Ok(self
            .registry
            .write()
            .await
            .report_fault(validator_id, evidence)?)
    }

    pub async fn reputation(&self, validator_id: &str) -> Option<f64> {
        self.registry.read().await.reputation(validator_id)
    }

    pub async fn validator_status(&self, validator_id: &str) -> Option<ValidatorStatus> {
        self.registry.read().await.status(validator_id)
    }

    /// Host a validator on this node's bus and register it
    pub async fn spawn_validator(
        &self,
        validator_id: &str,
        signing_key: SigningKey,
        behavior: ValidatorBehavior,
    ) -> Result<()> {
        if lock(&self.hosted).contains_key(validator_id) {
            return Err(NodeError::ValidatorAlreadyHosted(validator_id.to_string()));
        }
        self.registry
            .write()
            .await
            .register(validator_id, signing_key.verifying_key().to_bytes());

        let quorum = self.config.consensus.quorum();
        let handle = ValidatorNode::new(validator_id, signing_key, behavior, quorum, &self.bus)
            .spawn();
        lock(&self.hosted).insert(validator_id.to_string(), handle);
        Ok(())
    }

    /// Performance signal from the metrics collaborator, in `[0, 1]`
    pub fn set_performance(&self, subject_id: &str, value: f64) {
        lock(&self.performance).insert(subject_id.to_string(), value);
    }

    pub async fn trust_score(&self, subject_id: &str) -> TrustScore {
        let entries = self.log.entries_for_subject(subject_id);
        let performance = lock(&self.performance).get(subject_id).copied();
        let registry = self.registry.read().await;
        self.trust
            .score_subject(subject_id, &entries, &registry, performance)
    }

    /// Every fingerprint submitted for the subject, oldest first
    pub async fn fingerprint_history(&self, subject_id: &str) -> Vec<AgentFingerprint> {
        self.fingerprints.lock().await.versions(subject_id).to_vec()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsensusEvent> {
        self.engine.subscribe()
    }

    /// Start the periodic seal-and-anchor job for the configured medium
    pub async fn spawn_anchoring(&self) -> Result<JoinHandle<()>> {
        let config = &self.config.transparency;
        let handle = match config.anchor {
            AnchorKind::Memory => {
                AnchoringJob::new(self.log.clone(), Arc::new(MemoryAnchor::new()), config).spawn()
            }
            AnchorKind::File => {
                let anchor = FileAnchor::open(&config.anchor_path).await?;
                AnchoringJob::new(self.log.clone(), Arc::new(anchor), config).spawn()
            }
        };
        Ok(handle)
    }

    /// Stop hosted validators and detach the engine from the bus
    pub fn shutdown(&self) {
        self.engine.shutdown();
        for (validator_id, handle) in lock(&self.hosted).drain() {
            self.bus.unregister(&validator_id);
            handle.abort();
        }
        info!(node_id = %self.config.node.node_id, "Trust node stopped");
    }
}

fn open_log(config: &QlafsConfig) -> Result<TransparencyLog> {
    let key = match &config.node.log_signing_seed {
        Some(seed) => signing_key_from_hex(seed)?,
        None => {
            warn!("No log signing seed configured; tree heads use an ephemeral key");
            generate_signing_key()
        }
    };

    let log = match config.transparency.store {
        StoreKind::Memory => TransparencyLog::in_memory(key),
        StoreKind::Sqlite => {
            let store = SqliteStore::open(&config.transparency.sqlite_path)?;
            TransparencyLog::open(Box::new(store), key)?
        }
    };
    Ok(log)
}
