//! RFC 6962 Merkle tree over entry hashes.
//!
//! Leaves are hashed as `H(0x00 || data)` and interior nodes as
//! `H(0x01 || left || right)`, so a leaf can never be passed off as a node.
//! A tree of `n` leaves splits at the largest power of two strictly below `n`.
//!
//! Functions here take *leaf hashes* (already `0x00`-prefixed), which is what
//! the log stores.

use crate::error::{LogError, Result};
use qlafs_core::Digest;
use serde::{Deserialize, Serialize};

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// Audit path proving one leaf is in a tree of `tree_size` leaves
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionProof {
    pub leaf_index: u64,
    pub tree_size: u64,
    pub path: Vec<Digest>,
}

/// Proof that a tree of `old_size` leaves is a prefix of one of `new_size`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyProof {
    pub old_size: u64,
    pub new_size: u64,
    pub path: Vec<Digest>,
}

pub fn leaf_hash(data: &[u8]) -> Digest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[LEAF_PREFIX]);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

pub fn node_hash(left: &Digest, right: &Digest) -> Digest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[NODE_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    *hasher.finalize().as_bytes()
}

/// Root of the empty tree: the hash of the empty string
pub fn empty_root() -> Digest {
    *blake3::hash(&[]).as_bytes()
}

/// Largest power of two strictly less than `n` (n >= 2)
fn split_point(n: usize) -> usize {
    debug_assert!(n >= 2);
    let mut k = 1;
    while k << 1 < n {
        k <<= 1;
    }
    k
}

/// Merkle tree hash of a list of leaf hashes
pub fn root(leaves: &[Digest]) -> Digest {
    match leaves.len() {
        0 => empty_root(),
        1 => leaves[0],
        n => {
            let k = split_point(n);
            node_hash(&root(&leaves[..k]), &root(&leaves[k..]))
        }
    }
}

/// Audit path for `index` in the tree formed by `leaves`
pub fn inclusion_path(index: usize, leaves: &[Digest]) -> Result<Vec<Digest>> {
    if index >= leaves.len() {
        return Err(LogError::IndexOutOfRange {
            index: index as u64,
            tree_size: leaves.len() as u64,
        });
    }
    let mut path = Vec::new();
    build_path(index, leaves, &mut path);
    Ok(path)
}

fn build_path(index: usize, leaves: &[Digest], path: &mut Vec<Digest>) {
    let n = leaves.len();
    if n <= 1 {
        return;
    }
    let k = split_point(n);
    if index < k {
        build_path(index, &leaves[..k], path);
        path.push(root(&leaves[k..]));
    } else {
        build_path(index - k, &leaves[k..], path);
        path.push(root(&leaves[..k]));
    }
}

/// Consistency proof between the first `old_size` leaves and all `leaves`
pub fn consistency_path(old_size: usize, leaves: &[Digest]) -> Result<Vec<Digest>> {
    let new_size = leaves.len();
    if old_size > new_size {
        return Err(LogError::InvalidTreeSize {
            old_size: old_size as u64,
            new_size: new_size as u64,
        });
    }
    let mut path = Vec::new();
    if old_size > 0 && old_size < new_size {
        build_subproof(old_size, leaves, true, &mut path);
    }
    Ok(path)
}

fn build_subproof(m: usize, leaves: &[Digest], complete: bool, path: &mut Vec<Digest>) {
    let n = leaves.len();
    if m == n {
        if !complete {
            path.push(root(leaves));
        }
        return;
    }
    let k = split_point(n);
    if m <= k {
        build_subproof(m, &leaves[..k], complete, path);
        path.push(root(&leaves[k..]));
    } else {
        build_subproof(m - k, &leaves[k..], false, path);
        path.push(root(&leaves[..k]));
    }
}

fn failed(reason: &str) -> LogError {
    LogError::ProofVerificationFailed(reason.to_string())
}

/// Verify an audit path for `leaf` against `root_hash`
pub fn verify_inclusion(leaf: &Digest, proof: &InclusionProof, root_hash: &Digest) -> Result<()> {
    if proof.leaf_index >= proof.tree_size {
        return Err(failed("leaf index beyond tree size"));
    }

    let mut fn_ = proof.leaf_index;
    let mut sn = proof.tree_size - 1;
    let mut r = *leaf;

    for p in &proof.path {
        if sn == 0 {
            return Err(failed("audit path too long"));
        }
        if fn_ & 1 == 1 || fn_ == sn {
            r = node_hash(p, &r);
            while fn_ & 1 == 0 && fn_ != 0 {
                fn_ >>= 1;
                sn >>= 1;
            }
        } else {
            r = node_hash(&r, p);
        }
        fn_ >>= 1;
        sn >>= 1;
    }

    if sn != 0 {
        return Err(failed("audit path too short"));
    }
    if &r != root_hash {
        return Err(failed("computed root does not match"));
    }
    Ok(())
}

/// Verify that `old_root` over `old_size` leaves is a prefix of `new_root`
pub fn verify_consistency(
    proof: &ConsistencyProof,
    old_root: &Digest,
    new_root: &Digest,
) -> Result<()> {
    let (old_size, new_size) = (proof.old_size, proof.new_size);
    if old_size > new_size {
        return Err(failed("old tree larger than new tree"));
    }
    if old_size == 0 {
        // Every tree extends the empty tree
        return if proof.path.is_empty() && old_root == &empty_root() {
            Ok(())
        } else {
            Err(failed("empty old tree takes an empty proof and the empty root"))
        };
    }
    if old_size == new_size {
        return if proof.path.is_empty() && old_root == new_root {
            Ok(())
        } else {
            Err(failed("equal sizes require equal roots and an empty proof"))
        };
    }
    if proof.path.is_empty() {
        return Err(failed("empty consistency proof"));
    }

    let mut path: Vec<Digest> = Vec::with_capacity(proof.path.len() + 1);
    if old_size.is_power_of_two() {
        path.push(*old_root);
    }
    path.extend_from_slice(&proof.path);

    let mut fn_ = old_size - 1;
    let mut sn = new_size - 1;
    while fn_ & 1 == 1 {
        fn_ >>= 1;
        sn >>= 1;
    }

    let mut fr = path[0];
    let mut sr = path[0];
    for c in &path[1..] {
        if sn == 0 {
            return Err(failed("consistency path too long"));
        }
        if fn_ & 1 == 1 || fn_ == sn {
            fr = node_hash(c, &fr);
            sr = node_hash(c, &sr);
            while fn_ & 1 == 0 && fn_ != 0 {
                fn_ >>= 1;
                sn >>= 1;
            }
        } else {
            sr = node_hash(&sr, c);
        }
        fn_ >>= 1;
        sn >>= 1;
    }

    if sn != 0 {
        return Err(failed("consistency path too short"));
    }
    if &fr != old_root {
        return Err(failed("old root mismatch"));
    }
    if &sr != new_root {
        return Err(failed("new root mismatch"));
    }
    Ok(())
}
