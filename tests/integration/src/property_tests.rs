//! Property tests across the consensus and log boundary
//!
//! - **Safety**: a proposal finalizes at most once, with one outcome, and
//!   that outcome is what the log records
//! - **Liveness**: with at most f faulty validators out of 3f + 1, every
//!   proposal finalizes within the view-change budget
//! - **Consistency**: every sealed head is a prefix of every later head

use crate::test_utils::*;
use proptest::prelude::*;
use proptest::sample::Index;
use qlafs_consensus::{ConsensusEvent, Decision, ProposalResult, ValidatorBehavior};
use qlafs_fingerprint::test_support::complete_evidence_for;
use qlafs_transparency::{leaf_hash, verify_consistency, verify_inclusion};

fn faulty_behavior() -> impl Strategy<Value = ValidatorBehavior> {
    prop_oneof![
        Just(ValidatorBehavior::Silent),
        Just(ValidatorBehavior::SilentLeader),
        Just(ValidatorBehavior::Equivocating),
        Just(ValidatorBehavior::AlwaysReject),
    ]
}

/// `3f + 1` behaviors with up to `f` of them faulty
fn committee(f: usize, faults: &[(Index, ValidatorBehavior)]) -> Vec<ValidatorBehavior> {
    let n = 3 * f + 1;
    let mut behaviors = vec![ValidatorBehavior::Honest; n];
    for (slot, behavior) in faults.iter().take(f) {
        behaviors[slot.index(n)] = *behavior;
    }
    behaviors
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(6))]

    #[test]
    fn prop_bounded_faults_finalize_once(
        f in 1usize..=2,
        faults in prop::collection::vec((any::<Index>(), faulty_behavior()), 0..=2),
        proposals in 1usize..=3,
    ) {
        init_tracing();
        let behaviors = committee(f, &faults);

        runtime().block_on(async move {
            let node = start_node(f, 150, &behaviors).await;
            let mut events = node.subscribe();

            let mut ids = Vec::new();
            for i in 0..proposals {
                let evidence = complete_evidence_for(&format!("model-{}", i));
                ids.push(node.submit(&format!("agent-{}", i), evidence).await.unwrap());
            }

            for id in &ids {
                let ProposalResult::Finalized { outcome, log_index } = node.await_result(id).await
                else {
                    panic!("proposal {} did not finalize with {:?}", id, behaviors);
                };
                assert!(outcome.round <= node.config().consensus.max_view_changes as u64);
                assert_eq!(outcome.decision, Decision::Accept);
                assert!(outcome.certificate.votes.len() >= 2 * f + 1);

                let entry = node.log_entry_for(id).unwrap();
                assert_eq!(Some(entry.entry_index), log_index);
                assert_eq!(entry.payload.decision, outcome.decision);
                assert_eq!(entry.payload.composite_hash, outcome.composite_hash);
                assert_eq!(entry.payload.round, outcome.round);
            }

            // One log entry per proposal and one finalization event each
            assert_eq!(node.log().size(), ids.len() as u64);
            let events = drain_events(&mut events);
            for id in &ids {
                let finalized: Vec<_> = events
                    .iter()
                    .filter_map(|event| match event {
                        ConsensusEvent::Finalized { proposal_id, composite_hash, .. }
                            if proposal_id == id => Some(*composite_hash),
                        _ => None,
                    })
                    .collect();
                assert_eq!(finalized.len(), 1);
            }

            node.shutdown();
        });
    }

    #[test]
    fn prop_sealed_heads_stay_consistent(batches in prop::collection::vec(1u64..20, 1..6)) {
        let log = filled_log(0);
        let base = finalized_verdict("p-0", "agent-1", Decision::Accept);
        let mut heads = Vec::new();
        let mut next = 0u64;

        for batch in batches {
            for _ in 0..batch {
                let mut verdict = base.clone();
                verdict.proposal_id = format!("p-{}", next);
                if next % 3 == 0 {
                    verdict.decision = Decision::Reject;
                }
                log.append(&verdict).unwrap();
                next += 1;
            }
            let head = log.seal_tree_head().unwrap();
            prop_assert!(head.verify_with(&log.public_key()).is_ok());
            heads.push(head);
        }

        for (i, old) in heads.iter().enumerate() {
            for new in &heads[i..] {
                let proof = log.prove_consistency(old.tree_size, new.tree_size).unwrap();
                prop_assert!(verify_consistency(&proof, &old.root_hash, &new.root_hash).is_ok());
            }
        }

        // Every entry is provable against every head that covers it
        let latest = heads.last().unwrap();
        for index in 0..latest.tree_size {
            let entry = log.entry(index).unwrap();
            let proof = log.prove_inclusion(index, latest.tree_size).unwrap();
            prop_assert!(verify_inclusion(&leaf_hash(&entry.entry_hash), &proof, &latest.root_hash).is_ok());
        }

        let report = log.audit().unwrap();
        prop_assert_eq!(report.entries_checked, next);
        prop_assert_eq!(report.tree_heads_checked, heads.len() as u64);
        prop_assert_eq!(report.latest_root, latest.root_hash);
    }
}
