//! Tamper-evident transparency log for QLAFS verdicts.
//!
//! Every finalized consensus verdict becomes a [`LogEntry`] that is
//!
//! - hash-chained to its predecessor (`entry_hash = H(previous || payload)`),
//! - a leaf of an RFC 6962 Merkle tree, so any entry can be proven included
//!   in a [`SignedTreeHead`] and any two heads proven consistent,
//! - periodically sealed and anchored to an external medium by the
//!   [`AnchoringJob`].
//!
//! ```text
//!  ConsensusEngine ──VerdictSink::append──▶ TransparencyLog ──▶ LogStore
//!                                               │
//!                                   seal_tree_head (AnchoringJob)
//!                                               │
//!                                               ▼
//!                                          AnchorClient
//! ```

pub mod anchor;
pub mod entry;
pub mod error;
pub mod log;
pub mod merkle;
pub mod store;
pub mod tree_head;

pub use anchor::{AnchorClient, AnchorRecord, AnchoringJob, FileAnchor, MemoryAnchor};
pub use entry::{chain_hash, LogEntry, VerdictPayload};
pub use error::{LogError, Result};
pub use log::{AuditReport, EntryVerification, TransparencyLog};
pub use merkle::{
    consistency_path, empty_root, inclusion_path, leaf_hash, node_hash, root,
    verify_consistency, verify_inclusion, ConsistencyProof, InclusionProof,
};
pub use store::{check_chain, LogStore, MemoryStore, StoredLog};
pub use tree_head::{tree_head_digest, SignedTreeHead};

#[cfg(feature = "sqlite")]
pub use store::SqliteStore;
