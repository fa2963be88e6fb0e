//! Ed25519 signing helpers.
//!
//! Signatures are always computed over a 32-byte domain-separated digest,
//! never over raw structures.

use crate::digest::Digest;
use crate::error::{CoreError, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::Rng;

/// Ed25519 public key bytes
pub type PublicKeyBytes = [u8; 32];

/// Generate a fresh signing key
pub fn generate_signing_key() -> SigningKey {
    let mut csprng = rand::thread_rng();
    let secret_bytes: [u8; 32] = csprng.gen();
    SigningKey::from_bytes(&secret_bytes)
}

/// Derive a signing key from a hex-encoded 32-byte seed
pub fn signing_key_from_hex(seed_hex: &str) -> Result<SigningKey> {
    let bytes = hex::decode(seed_hex.trim())?;
    let seed: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CoreError::InvalidKey("seed must be 32 bytes".to_string()))?;
    Ok(SigningKey::from_bytes(&seed))
}

/// Sign a digest and return the 64 signature bytes
pub fn sign_digest(key: &SigningKey, digest: &Digest) -> Vec<u8> {
    key.sign(digest).to_bytes().to_vec()
}

/// Verify a signature over a digest
pub fn verify_digest(public_key: &PublicKeyBytes, digest: &Digest, signature: &[u8]) -> Result<()> {
    let verifying_key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| CoreError::InvalidKey(e.to_string()))?;

    let sig_bytes: [u8; 64] = signature.try_into().map_err(|_| {
        CoreError::InvalidSignature(format!(
            "Signature length must be 64 bytes, got {}",
            signature.len()
        ))
    })?;

    verifying_key
        .verify(digest, &Signature::from_bytes(&sig_bytes))
        .map_err(|e| CoreError::InvalidSignature(format!("Verification failed: {}", e)))
}
