//! Shared fixtures for the end-to-end scenarios

use qlafs_consensus::{
    ConsensusEvent, Decision, FinalizedVerdict, Phase, QuorumCertificate, ValidatorBehavior,
    ValidatorStatus, Vote,
};
use qlafs_core::{generate_signing_key, QlafsConfig};
use qlafs_fingerprint::test_support::complete_evidence;
use qlafs_fingerprint::FingerprintGenerator;
use qlafs_node::TrustNode;
use qlafs_transparency::TransparencyLog;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Node configuration with no hosted validators, tolerating `f` faults
pub fn node_config(f: usize, phase_timeout_ms: u64) -> QlafsConfig {
    let mut config = QlafsConfig::default();
    config.node.node_id = format!("test-node-{}", uuid::Uuid::new_v4());
    config.node.validators.clear();
    config.consensus.fault_tolerance = f;
    config.consensus.phase_timeout_ms = phase_timeout_ms;
    config.consensus.max_view_changes = 3;
    config.consensus.sink_retry_base_ms = 5;
    config
}

pub fn validator_id(i: usize) -> String {
    format!("validator-{}", i + 1)
}

/// Start a node hosting one validator per behavior, named `validator-1..`
///
/// Ids sort in committee order, so `behaviors[0]` leads round 0.
pub async fn start_node(
    f: usize,
    phase_timeout_ms: u64,
    behaviors: &[ValidatorBehavior],
) -> TrustNode {
    let config = node_config(f, phase_timeout_ms);
    let log = Arc::new(TransparencyLog::in_memory(generate_signing_key()));
    start_node_with(config, log, behaviors).await
}

pub async fn start_node_with(
    config: QlafsConfig,
    log: Arc<TransparencyLog>,
    behaviors: &[ValidatorBehavior],
) -> TrustNode {
    let node = TrustNode::start_with_log(config, log).expect("node starts");
    for (i, behavior) in behaviors.iter().enumerate() {
        node.spawn_validator(&validator_id(i), generate_signing_key(), *behavior)
            .await
            .expect("validator spawns");
    }
    node
}

/// Poll the registry until `validator_id` reaches `status`
pub async fn wait_for_status(
    node: &TrustNode,
    validator_id: &str,
    status: ValidatorStatus,
    within: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if node.validator_status(validator_id).await == Some(status) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Everything buffered on an event receiver
pub fn drain_events(events: &mut broadcast::Receiver<ConsensusEvent>) -> Vec<ConsensusEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

/// A verdict with one real signed commit vote, for driving the log directly
pub fn finalized_verdict(proposal_id: &str, subject_id: &str, decision: Decision) -> FinalizedVerdict {
    let fingerprint = FingerprintGenerator::new()
        .generate(subject_id, &complete_evidence())
        .expect("complete evidence fingerprints");
    let key = generate_signing_key();
    let vote = Vote::signed(
        &key,
        "validator-1",
        proposal_id,
        0,
        Phase::Commit,
        decision,
        fingerprint.composite_hash,
        None,
    );
    let certificate = QuorumCertificate::from_votes(
        proposal_id,
        0,
        decision,
        fingerprint.composite_hash,
        vec![vote],
    );
    FinalizedVerdict {
        proposal_id: proposal_id.to_string(),
        subject_id: subject_id.to_string(),
        fingerprint,
        decision,
        round: 0,
        certificate,
    }
}

/// In-memory log holding `count` accepted verdicts for `agent-1`
pub fn filled_log(count: u64) -> TransparencyLog {
    let log = TransparencyLog::in_memory(generate_signing_key());
    let base = finalized_verdict("p-0", "agent-1", Decision::Accept);
    for i in 0..count {
        let mut verdict = base.clone();
        verdict.proposal_id = format!("p-{}", i);
        log.append(&verdict).expect("append");
    }
    log
}
