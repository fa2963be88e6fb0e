//! The append-only transparency log.
//!
//! # Concurrency
//!
//! A single writer mutex serialises appends, sealing and anchor updates, and
//! owns the [`LogStore`]. After each write the writer publishes a new
//! immutable [`Arc`] snapshot of the log state; readers clone the `Arc` and
//! compute proofs without holding any lock.
//!
//! While a tree head is being sealed, appends fail fast with
//! [`LogError::LogSealed`] instead of queueing behind the seal. The engine
//! treats that as a transient failure and retries.

use crate::entry::{LogEntry, VerdictPayload};
use crate::error::{LogError, Result};
use crate::merkle::{self, ConsistencyProof, InclusionProof};
use crate::store::{check_chain, LogStore, MemoryStore};
use crate::tree_head::SignedTreeHead;
use qlafs_consensus::{FinalizedVerdict, SinkError, VerdictSink};
use qlafs_core::{now_ms, Digest, PublicKeyBytes, SigningKey, ZERO_DIGEST};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Answer to "is this entry in the log?" against the latest sealed head
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryVerification {
    pub entry_hash: Digest,
    pub included: bool,
    pub entry_index: Option<u64>,
    /// Head the proof is against
    pub tree_head: Option<SignedTreeHead>,
    pub proof: Option<InclusionProof>,
}

/// Outcome of a full [`TransparencyLog::audit`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    pub entries_checked: u64,
    pub tree_heads_checked: u64,
    pub latest_root: Digest,
}

#[derive(Debug, Clone, Default)]
struct LogState {
    entries: Vec<LogEntry>,
    /// `leaf_hash(entry_hash)` per entry
    leaves: Vec<Digest>,
    heads: Vec<SignedTreeHead>,
    by_hash: HashMap<Digest, u64>,
    by_proposal: HashMap<String, u64>,
}

impl LogState {
    fn push_entry(&mut self, entry: LogEntry) {
        let index = entry.entry_index;
        self.leaves.push(merkle::leaf_hash(&entry.entry_hash));
        self.by_hash.insert(entry.entry_hash, index);
        self.by_proposal.insert(entry.payload.proposal_id.clone(), index);
        self.entries.push(entry);
    }

    fn size(&self) -> u64 {
        self.leaves.len() as u64
    }

    fn last_hash(&self) -> Digest {
        self.entries.last().map(|e| e.entry_hash).unwrap_or(ZERO_DIGEST)
    }

    fn root_at(&self, tree_size: u64) -> Result<Digest> {
        if tree_size > self.size() {
            return Err(LogError::InvalidTreeSize {
                old_size: tree_size,
                new_size: self.size(),
            });
        }
        Ok(merkle::root(&self.leaves[..tree_size as usize]))
    }
}

/// Clears the sealing flag when the seal finishes, even on error
struct SealingGuard<'a>(&'a AtomicBool);

impl Drop for SealingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct TransparencyLog {
    writer: Mutex<Box<dyn LogStore>>,
    state: RwLock<Arc<LogState>>,
    sealing: AtomicBool,
    signing_key: SigningKey,
}

impl std::fmt::Debug for TransparencyLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.snapshot();
        f.debug_struct("TransparencyLog")
            .field("size", &state.size())
            .field("tree_heads", &state.heads.len())
            .field("public_key", &hex::encode(self.public_key()))
            .finish()
    }
}

impl TransparencyLog {
    /// Volatile log
    pub fn in_memory(signing_key: SigningKey) -> Self {
        Self {
            writer: Mutex::new(Box::new(MemoryStore::new())),
            state: RwLock::new(Arc::new(LogState::default())),
            sealing: AtomicBool::new(false),
            signing_key,
        }
    }

    /// Open a log over a store, rebuilding the tree and checking every
    /// persisted tree head against it
    pub fn open(mut store: Box<dyn LogStore>, signing_key: SigningKey) -> Result<Self> {
        let stored = store.load()?;
        check_chain(&stored.entries)?;

        let mut state = LogState::default();
        for entry in stored.entries {
            state.push_entry(entry);
        }
        let public_key = signing_key.verifying_key().to_bytes();
        for head in &stored.heads {
            head.verify_with(&public_key)?;
            let root = state.root_at(head.tree_size)?;
            if root != head.root_hash {
                return Err(LogError::ProofVerificationFailed(format!(
                    "stored tree head at size {} does not match the entries",
                    head.tree_size
                )));
            }
        }
        state.heads = stored.heads;

        info!(
            entries = state.size(),
            tree_heads = state.heads.len(),
            "Transparency log opened"
        );

        Ok(Self {
            writer: Mutex::new(store),
            state: RwLock::new(Arc::new(state)),
            sealing: AtomicBool::new(false),
            signing_key,
        })
    }

    pub fn public_key(&self) -> PublicKeyBytes {
        self.signing_key.verifying_key().to_bytes()
    }

    fn snapshot(&self) -> Arc<LogState> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, update: impl FnOnce(&mut LogState)) {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        update(Arc::make_mut(&mut guard));
    }

    fn lock_writer(&self) -> MutexGuard<'_, Box<dyn LogStore>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_sealing(&self) -> Option<SealingGuard<'_>> {
        let already = self.sealing.swap(true, Ordering::AcqRel);
        (!already).then(|| SealingGuard(&self.sealing))
    }

    /// Append a finalized verdict.
    ///
    /// Appending the same proposal twice returns the existing entry, so a
    /// retried append never creates a second one.
    pub fn append(&self, verdict: &FinalizedVerdict) -> Result<LogEntry> {
        if self.sealing.load(Ordering::Acquire) {
            return Err(LogError::LogSealed);
        }

        let mut store = self.lock_writer();
        let state = self.snapshot();
        if let Some(&index) = state.by_proposal.get(&verdict.proposal_id) {
            debug!(proposal_id = %verdict.proposal_id, entry_index = index, "Verdict already logged");
            return Ok(state.entries[index as usize].clone());
        }

        let entry = LogEntry::new(
            state.size(),
            state.last_hash(),
            VerdictPayload::from_verdict(verdict),
            now_ms(),
        )?;
        store.append_entry(&entry)?;
        self.publish(|s| s.push_entry(entry.clone()));

        info!(
            proposal_id = %verdict.proposal_id,
            subject_id = %verdict.subject_id,
            entry_index = entry.entry_index,
            decision = %verdict.decision,
            "Verdict appended to transparency log"
        );
        Ok(entry)
    }

    /// Audit path for `entry_index` in the tree of the first `at_tree_size`
    /// entries
    pub fn prove_inclusion(&self, entry_index: u64, at_tree_size: u64) -> Result<InclusionProof> {
        let state = self.snapshot();
        if at_tree_size > state.size() {
            return Err(LogError::InvalidTreeSize {
                old_size: at_tree_size,
                new_size: state.size(),
            });
        }
        if entry_index >= at_tree_size {
            return Err(LogError::IndexOutOfRange {
                index: entry_index,
                tree_size: at_tree_size,
            });
        }
        let path =
            merkle::inclusion_path(entry_index as usize, &state.leaves[..at_tree_size as usize])?;
        Ok(InclusionProof {
            leaf_index: entry_index,
            tree_size: at_tree_size,
            path,
        })
    }

    pub fn prove_consistency(&self, old_size: u64, new_size: u64) -> Result<ConsistencyProof> {
        let state = self.snapshot();
        if old_size > new_size || new_size > state.size() {
            return Err(LogError::InvalidTreeSize { old_size, new_size });
        }
        let path = merkle::consistency_path(old_size as usize, &state.leaves[..new_size as usize])?;
        Ok(ConsistencyProof {
            old_size,
            new_size,
            path,
        })
    }

    /// Sign the current tree. Sealing twice at the same size returns the
    /// existing head.
    pub fn seal_tree_head(&self) -> Result<SignedTreeHead> {
        let _sealing = self.begin_sealing();
        let mut store = self.lock_writer();
        let state = self.snapshot();

        if let Some(latest) = state.heads.last() {
            if latest.tree_size == state.size() {
                return Ok(latest.clone());
            }
        }

        let head = SignedTreeHead::sign(
            &self.signing_key,
            state.size(),
            merkle::root(&state.leaves),
            now_ms(),
        );
        store.append_tree_head(&head)?;
        self.publish(|s| s.heads.push(head.clone()));

        info!(tree_size = head.tree_size, root = %head.root_hex(), "Tree head sealed");
        Ok(head)
    }

    /// Latest sealed head
    pub fn tree_head(&self) -> Option<SignedTreeHead> {
        self.snapshot().heads.last().cloned()
    }

    pub fn tree_heads(&self) -> Vec<SignedTreeHead> {
        self.snapshot().heads.clone()
    }

    /// Attach the anchoring medium's reference to the head at `tree_size`
    pub fn record_anchor(&self, tree_size: u64, reference: &str) -> Result<SignedTreeHead> {
        let mut store = self.lock_writer();
        let state = self.snapshot();
        let position = state
            .heads
            .iter()
            .rposition(|h| h.tree_size == tree_size)
            .ok_or_else(|| LogError::Anchor(format!("no tree head sealed at size {}", tree_size)))?;

        store.record_anchor(tree_size, reference)?;
        self.publish(|s| s.heads[position].anchor_reference = Some(reference.to_string()));

        let head = self.snapshot().heads[position].clone();
        info!(tree_size, anchor_reference = %reference, "Tree head anchored");
        Ok(head)
    }

    /// Prove an entry is covered by the latest sealed head.
    ///
    /// Entries appended after the last seal report `included: false` until
    /// the next seal.
    pub fn verify_entry(&self, entry_hash: &Digest) -> Result<EntryVerification> {
        let state = self.snapshot();
        let index = state.by_hash.get(entry_hash).copied();
        let head = state.heads.last().cloned();

        let mut verification = EntryVerification {
            entry_hash: *entry_hash,
            included: false,
            entry_index: index,
            tree_head: head.clone(),
            proof: None,
        };

        let (Some(index), Some(head)) = (index, head) else {
            return Ok(verification);
        };
        if index >= head.tree_size {
            return Ok(verification);
        }

        let path = merkle::inclusion_path(index as usize, &state.leaves[..head.tree_size as usize])?;
        let proof = InclusionProof {
            leaf_index: index,
            tree_size: head.tree_size,
            path,
        };
        merkle::verify_inclusion(&merkle::leaf_hash(entry_hash), &proof, &head.root_hash)?;

        verification.included = true;
        verification.proof = Some(proof);
        Ok(verification)
    }

    /// Re-walk the hash chain, recompute every sealed root and check each
    /// head extends the one before it
    pub fn audit(&self) -> Result<AuditReport> {
        let state = self.snapshot();
        check_chain(&state.entries)?;

        for (entry, leaf) in state.entries.iter().zip(&state.leaves) {
            if merkle::leaf_hash(&entry.entry_hash) != *leaf {
                return Err(LogError::ProofVerificationFailed(format!(
                    "leaf {} does not match its entry",
                    entry.entry_index
                )));
            }
        }

        let public_key = self.public_key();
        let mut previous: Option<&SignedTreeHead> = None;
        for head in &state.heads {
            head.verify_with(&public_key)?;
            if state.root_at(head.tree_size)? != head.root_hash {
                warn!(tree_size = head.tree_size, "Sealed root does not match log contents");
                return Err(LogError::ProofVerificationFailed(format!(
                    "root mismatch for tree head at size {}",
                    head.tree_size
                )));
            }
            if let Some(prev) = previous {
                let proof = ConsistencyProof {
                    old_size: prev.tree_size,
                    new_size: head.tree_size,
                    path: merkle::consistency_path(
                        prev.tree_size as usize,
                        &state.leaves[..head.tree_size as usize],
                    )?,
                };
                merkle::verify_consistency(&proof, &prev.root_hash, &head.root_hash)?;
            }
            previous = Some(head);
        }

        Ok(AuditReport {
            entries_checked: state.size(),
            tree_heads_checked: state.heads.len() as u64,
            latest_root: merkle::root(&state.leaves),
        })
    }

    pub fn size(&self) -> u64 {
        self.snapshot().size()
    }

    pub fn entry(&self, entry_index: u64) -> Option<LogEntry> {
        self.snapshot().entries.get(entry_index as usize).cloned()
    }

    pub fn entry_by_hash(&self, entry_hash: &Digest) -> Option<LogEntry> {
        let state = self.snapshot();
        let index = *state.by_hash.get(entry_hash)?;
        state.entries.get(index as usize).cloned()
    }

    pub fn entry_for_proposal(&self, proposal_id: &str) -> Option<LogEntry> {
        let state = self.snapshot();
        let index = *state.by_proposal.get(proposal_id)?;
        state.entries.get(index as usize).cloned()
    }

    /// Entries about one subject, oldest first
    pub fn entries_for_subject(&self, subject_id: &str) -> Vec<LogEntry> {
        self.snapshot()
            .entries
            .iter()
            .filter(|e| e.payload.subject_id == subject_id)
            .cloned()
            .collect()
    }

    #[cfg(test)]
    fn hold_sealing(&self) -> Option<SealingGuard<'_>> {
        self.begin_sealing()
    }
}

impl VerdictSink for TransparencyLog {
    fn append(&self, verdict: &FinalizedVerdict) -> std::result::Result<u64, SinkError> {
        match TransparencyLog::append(self, verdict) {
            Ok(entry) => Ok(entry.entry_index),
            Err(LogError::LogSealed) => Err(SinkError::Transient(LogError::LogSealed.to_string())),
            Err(e) => Err(SinkError::Permanent(e.to_string())),
        }
    }
}
