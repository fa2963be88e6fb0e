//! End-to-end scenarios through a full trust node
//!
//! # Test Scenarios
//!
//! 1. **Honest committee**: 7 validators, f = 2, one round, 5-vote certificate
//! 2. **Equivocators**: two validators flip their prepare votes, collect
//!    three strikes each and are blacklisted while honest votes finalize
//! 3. **Silent leader**: the round-0 leader never proposes, a view change
//!    finalizes in round 1 and the leader ends up suspected
//! 4. **Large log**: 1000 entries, entry 500 proven against the signed head
//! 5. **Restart**: a SQLite-backed node reopens with its history intact
//! 6. **Anchoring**: sealed heads reach a file anchor
//!
//! # Expected Outcomes
//!
//! - Every finalized proposal has exactly one log entry and a verifiable
//!   certificate
//! - Faulty validators are penalized in the registry without blocking
//!   honest progress
//! - Tampering with a logged payload or an inclusion proof is detected

use crate::test_utils::*;
use qlafs_consensus::{
    ConsensusEvent, Decision, ProposalResult, ValidatorBehavior, ValidatorStatus,
};
use qlafs_core::{generate_signing_key, AnchorKind, StoreKind};
use qlafs_fingerprint::test_support::{complete_evidence, complete_evidence_for};
use qlafs_transparency::{
    check_chain, leaf_hash, verify_consistency, verify_inclusion, AnchorRecord, LogEntry, LogError,
    SqliteStore, TransparencyLog,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_honest_committee_finalizes_in_one_round() {
    init_tracing();
    let node = start_node(2, 2_000, &[ValidatorBehavior::Honest; 7]).await;

    let proposal_id = node.submit("agent-1", complete_evidence()).await.unwrap();
    let ProposalResult::Finalized { outcome, log_index } = node.await_result(&proposal_id).await
    else {
        panic!("honest committee did not finalize");
    };

    assert_eq!(outcome.decision, Decision::Accept);
    assert_eq!(outcome.round, 0);
    assert_eq!(outcome.certificate.votes.len(), 5);
    assert_eq!(log_index, Some(0));

    {
        let registry = node.engine().registry().read().await;
        assert!(outcome
            .certificate
            .verify(5, |id| registry.public_key(id))
            .is_ok());
        for signer in outcome.certificate.signers() {
            assert_eq!(registry.status(&signer), Some(ValidatorStatus::Active));
            assert!(registry.reputation(&signer).unwrap() > 0.5);
        }
    }

    // The logged entry carries the certificate's composite and signers
    let entry = node.log_entry_for(&proposal_id).unwrap();
    assert_eq!(entry.payload.composite_hash, outcome.composite_hash);
    assert_eq!(entry.payload.signers, outcome.certificate.signers());

    node.seal_tree_head().unwrap();
    let verification = node.verify_entry(&entry.entry_hash).unwrap();
    assert!(verification.included);
    assert_eq!(verification.entry_index, Some(0));

    node.shutdown();
}

#[tokio::test]
async fn test_equivocators_are_blacklisted_and_honest_votes_finalize() {
    init_tracing();
    let mut behaviors = [ValidatorBehavior::Honest; 7];
    behaviors[5] = ValidatorBehavior::Equivocating;
    behaviors[6] = ValidatorBehavior::Equivocating;
    let node = start_node(2, 2_000, &behaviors).await;
    let mut events = node.subscribe();

    let proposal_id = node.submit("agent-1", complete_evidence()).await.unwrap();
    let ProposalResult::Finalized { outcome, .. } = node.await_result(&proposal_id).await else {
        panic!("honest majority did not finalize");
    };
    assert_eq!(outcome.decision, Decision::Accept);
    assert_eq!(outcome.round, 0);

    let equivocators = [validator_id(5), validator_id(6)];
    for id in &equivocators {
        assert!(
            !outcome.certificate.signers().contains(id),
            "{} signed the certificate",
            id
        );
        assert!(
            wait_for_status(&node, id, ValidatorStatus::Blacklisted, Duration::from_secs(2)).await,
            "{} was not blacklisted",
            id
        );
    }

    let registry = node.engine().registry().read().await;
    for id in &equivocators {
        let validator = registry.get(id).unwrap();
        assert_eq!(validator.strikes.len(), 3);
    }
    assert_eq!(registry.blacklisted().len(), 2);
    assert!(registry.active_set().len() >= 5);
    drop(registry);

    // Three reports per equivocator, the last one carrying the blacklist
    let mut faults = Vec::new();
    while faults.len() < 6 {
        match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Ok(ConsensusEvent::FaultReported {
                validator_id,
                status,
                ..
            })) => faults.push((validator_id, status)),
            Ok(Ok(_)) => {}
            other => panic!("missing fault reports after {:?}: {:?}", faults, other),
        }
    }
    for id in &equivocators {
        let statuses: Vec<_> = faults
            .iter()
            .filter(|(v, _)| v == id)
            .map(|(_, s)| *s)
            .collect();
        assert_eq!(statuses.len(), 3);
        assert_eq!(statuses.last(), Some(&ValidatorStatus::Blacklisted));
    }

    // The remaining five still reach quorum without the blacklisted pair
    let next = node.submit("agent-2", complete_evidence_for("other-model")).await.unwrap();
    assert!(matches!(
        node.await_result(&next).await,
        ProposalResult::Finalized { .. }
    ));

    node.shutdown();
}

#[tokio::test]
async fn test_silent_leader_forces_view_change() {
    init_tracing();
    let mut behaviors = [ValidatorBehavior::Honest; 4];
    behaviors[0] = ValidatorBehavior::SilentLeader;
    let node = start_node(1, 200, &behaviors).await;
    let mut events = node.subscribe();

    let proposal_id = node.submit("agent-1", complete_evidence()).await.unwrap();
    let ProposalResult::Finalized { outcome, log_index } = node.await_result(&proposal_id).await
    else {
        panic!("view change did not finalize");
    };
    assert_eq!(outcome.round, 1);
    assert_eq!(log_index, Some(0));
    assert_eq!(
        node.validator_status(&validator_id(0)).await,
        Some(ValidatorStatus::Suspected)
    );

    let view_changes: Vec<_> = drain_events(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            ConsensusEvent::ViewChanged {
                round,
                suspected_leader,
                ..
            } => Some((round, suspected_leader)),
            _ => None,
        })
        .collect();
    assert_eq!(view_changes, vec![(1, validator_id(0))]);

    let summary = node
        .history()
        .into_iter()
        .find(|s| s.proposal_id == proposal_id)
        .unwrap();
    assert_eq!(summary.round, 1);

    node.shutdown();
}

#[test]
fn test_thousand_entry_log_proves_entry_500() {
    let log = filled_log(1000);
    let head = log.seal_tree_head().unwrap();
    assert_eq!(head.tree_size, 1000);
    assert!(head.verify_with(&log.public_key()).is_ok());

    let entry = log.entry(500).unwrap();
    let proof = log.prove_inclusion(500, head.tree_size).unwrap();
    let leaf = leaf_hash(&entry.entry_hash);
    assert!(verify_inclusion(&leaf, &proof, &head.root_hash).is_ok());

    // One bit of entry 500's payload flipped and its hash recomputed
    let mut payload = entry.payload.clone();
    payload.static_hash[0] ^= 0x01;
    let tampered =
        LogEntry::new(entry.entry_index, entry.previous_hash, payload, entry.appended_at).unwrap();
    assert_ne!(tampered.entry_hash, entry.entry_hash);
    assert!(verify_inclusion(&leaf_hash(&tampered.entry_hash), &proof, &head.root_hash).is_err());

    // and the hash chain no longer links entry 501 to it
    let mut entries: Vec<LogEntry> = (0..head.tree_size).map(|i| log.entry(i).unwrap()).collect();
    assert!(check_chain(&entries).is_ok());
    entries[500] = tampered;
    assert!(matches!(
        check_chain(&entries),
        Err(LogError::ChainBroken { index: 501, .. })
    ));

    let mut tampered_proof = proof.clone();
    tampered_proof.path[3][7] ^= 0x80;
    assert!(verify_inclusion(&leaf, &tampered_proof, &head.root_hash).is_err());

    let verification = log.verify_entry(&entry.entry_hash).unwrap();
    assert!(verification.included);
    assert_eq!(verification.proof, Some(proof));
}

#[tokio::test]
async fn test_repeated_submissions_build_trust_and_consistent_heads() {
    init_tracing();
    let node = start_node(1, 2_000, &[ValidatorBehavior::Honest; 4]).await;
    node.set_performance("agent-1", 0.9);

    let mut heads = Vec::new();
    for _ in 0..3 {
        let id = node.submit("agent-1", complete_evidence()).await.unwrap();
        assert!(matches!(
            node.await_result(&id).await,
            ProposalResult::Finalized { .. }
        ));
        heads.push(node.seal_tree_head().unwrap());
    }

    let versions: Vec<u64> = node
        .fingerprint_history("agent-1")
        .await
        .iter()
        .map(|fp| fp.version)
        .collect();
    assert_eq!(versions, vec![1, 2, 3]);

    for pair in heads.windows(2) {
        let proof = node
            .prove_consistency(pair[0].tree_size, pair[1].tree_size)
            .unwrap();
        assert!(verify_consistency(&proof, &pair[0].root_hash, &pair[1].root_hash).is_ok());
    }

    let score = node.trust_score("agent-1").await;
    assert_eq!(score.verdicts, 3);
    assert!((score.inputs.verification_history - 1.0).abs() < 1e-9);
    assert!((score.inputs.behavioral_consistency - 1.0).abs() < 1e-9);
    assert_eq!(score.inputs.security_incidents, 0.0);
    assert!(score.score > 0.9);

    assert_eq!(node.trust_score("agent-unknown").await.score, 0.0);
    node.shutdown();
}

#[tokio::test]
async fn test_rejecting_majority_records_incident() {
    init_tracing();
    let mut behaviors = [ValidatorBehavior::AlwaysReject; 4];
    behaviors[0] = ValidatorBehavior::Honest;
    let node = start_node(1, 2_000, &behaviors).await;

    let id = node.submit("agent-1", complete_evidence()).await.unwrap();
    let ProposalResult::Finalized { outcome, .. } = node.await_result(&id).await else {
        panic!("rejecting majority did not finalize");
    };
    assert_eq!(outcome.decision, Decision::Reject);

    let entry = node.log_entry_for(&id).unwrap();
    assert_eq!(entry.payload.decision, Decision::Reject);

    let score = node.trust_score("agent-1").await;
    assert_eq!(score.inputs.verification_history, 0.0);
    assert!(score.inputs.security_incidents > 0.0);
    node.shutdown();
}

#[tokio::test]
async fn test_sqlite_node_restarts_with_history() {
    init_tracing();
    let dir = std::env::temp_dir().join(format!("qlafs-it-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let db = dir.join("log.db");
    let seed = hex::encode([7u8; 32]);

    let mut config = node_config(1, 2_000);
    config.node.log_signing_seed = Some(seed.clone());
    config.transparency.store = StoreKind::Sqlite;
    config.transparency.sqlite_path = db.clone();

    let (entry_hash, head) = {
        let log = Arc::new(
            TransparencyLog::open(
                Box::new(SqliteStore::open(&db).unwrap()),
                qlafs_core::signing_key_from_hex(&seed).unwrap(),
            )
            .unwrap(),
        );
        let node = start_node_with(config.clone(), log, &[ValidatorBehavior::Honest; 4]).await;
        let id = node.submit("agent-1", complete_evidence()).await.unwrap();
        node.await_result(&id).await;
        let head = node.seal_tree_head().unwrap();
        let entry_hash = node.log_entry_for(&id).unwrap().entry_hash;
        node.shutdown();
        (entry_hash, head)
    };

    // Heads signed under the original key do not open under another one
    assert!(matches!(
        TransparencyLog::open(
            Box::new(SqliteStore::open(&db).unwrap()),
            qlafs_core::signing_key_from_hex(&hex::encode([8u8; 32])).unwrap(),
        ),
        Err(LogError::InvalidSignature(_))
    ));

    let reopened = Arc::new(
        TransparencyLog::open(
            Box::new(SqliteStore::open(&db).unwrap()),
            qlafs_core::signing_key_from_hex(&seed).unwrap(),
        )
        .unwrap(),
    );
    let report = reopened.audit().unwrap();
    assert_eq!(report.entries_checked, 1);
    assert_eq!(report.latest_root, head.root_hash);

    let node = start_node_with(config, reopened, &[ValidatorBehavior::Honest; 4]).await;
    assert_eq!(node.tree_head(), Some(head));
    assert!(node.verify_entry(&entry_hash).unwrap().included);

    // New verdicts continue the same chain
    let id = node.submit("agent-1", complete_evidence()).await.unwrap();
    let ProposalResult::Finalized { log_index, .. } = node.await_result(&id).await else {
        panic!("restarted node did not finalize");
    };
    assert_eq!(log_index, Some(1));
    assert_eq!(node.log_entry_for(&id).unwrap().previous_hash, entry_hash);

    node.shutdown();
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_anchoring_job_writes_file_anchor() {
    init_tracing();
    let dir = std::env::temp_dir().join(format!("qlafs-anchor-{}", uuid::Uuid::new_v4()));
    let anchor_path = dir.join("anchors.jsonl");

    let mut config = node_config(1, 2_000);
    config.transparency.anchor = AnchorKind::File;
    config.transparency.anchor_path = anchor_path.clone();
    config.transparency.anchor_interval_ms = 50;
    let log = Arc::new(TransparencyLog::in_memory(generate_signing_key()));
    let node = start_node_with(config, log, &[ValidatorBehavior::Honest; 4]).await;

    let id = node.submit("agent-1", complete_evidence()).await.unwrap();
    node.await_result(&id).await;
    let job = node.spawn_anchoring().await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let anchored = loop {
        if let Some(head) = node.tree_head().filter(|h| h.anchor_reference.is_some()) {
            break head;
        }
        assert!(tokio::time::Instant::now() < deadline, "head never anchored");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    job.abort();

    assert_eq!(anchored.tree_size, 1);
    let reference = anchored.anchor_reference.clone().unwrap();
    assert!(reference.ends_with("#0"));

    let content = tokio::fs::read_to_string(&anchor_path).await.unwrap();
    let record: AnchorRecord = serde_json::from_str(content.lines().next().unwrap()).unwrap();
    let expected = AnchorRecord::from_head(&anchored);
    assert_eq!(record.tree_size, expected.tree_size);
    assert_eq!(record.root_hash, expected.root_hash);
    assert_eq!(record.signature, expected.signature);

    node.shutdown();
    let _ = std::fs::remove_dir_all(&dir);
}
