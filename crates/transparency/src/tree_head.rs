//! Signed tree heads.

use crate::error::{LogError, Result};
use qlafs_core::{hash_domain, sign_digest, verify_digest, Digest, PublicKeyBytes, SigningKey};
use serde::{Deserialize, Serialize};

const TREE_HEAD_DOMAIN: &[u8] = b"QLAFS-STH-V1";

/// Signed commitment to the log state at `tree_size`.
///
/// The signature covers `(tree_size, root_hash, timestamp)`. The anchor
/// reference is filled in later by the anchoring job and is not signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTreeHead {
    pub tree_size: u64,
    pub root_hash: Digest,
    /// Unix milliseconds
    pub timestamp: u64,
    pub anchor_reference: Option<String>,
    pub public_key: PublicKeyBytes,
    pub signature: Vec<u8>,
}

pub fn tree_head_digest(tree_size: u64, root_hash: &Digest, timestamp: u64) -> Digest {
    hash_domain(
        TREE_HEAD_DOMAIN,
        &[&tree_size.to_be_bytes()[..], &root_hash[..], &timestamp.to_be_bytes()[..]],
    )
}

impl SignedTreeHead {
    pub fn sign(key: &SigningKey, tree_size: u64, root_hash: Digest, timestamp: u64) -> Self {
        let signature = sign_digest(key, &tree_head_digest(tree_size, &root_hash, timestamp));
        Self {
            tree_size,
            root_hash,
            timestamp,
            anchor_reference: None,
            public_key: key.verifying_key().to_bytes(),
            signature,
        }
    }

    /// Verify against the log operator's key, obtained out of band.
    ///
    /// The embedded `public_key` only names the signer; a head signed by any
    /// other key is rejected.
    pub fn verify_with(&self, public_key: &PublicKeyBytes) -> Result<()> {
        if &self.public_key != public_key {
            return Err(LogError::InvalidSignature(
                "tree head signed by a foreign key".to_string(),
            ));
        }
        let digest = tree_head_digest(self.tree_size, &self.root_hash, self.timestamp);
        verify_digest(public_key, &digest, &self.signature)
            .map_err(|e| LogError::InvalidSignature(e.to_string()))
    }

    pub fn root_hex(&self) -> String {
        hex::encode(self.root_hash)
    }
}
