//! BLAKE3 digest helpers.
//!
//! Every hash in QLAFS is a 32-byte BLAKE3 digest. Inputs are always
//! domain-separated so that a digest computed for one structure can never be
//! replayed as the digest of another.

use blake3::Hasher;
use std::time::{SystemTime, UNIX_EPOCH};

/// A 32-byte BLAKE3 digest
pub type Digest = [u8; 32];

/// All-zero digest, used as the genesis predecessor of hash chains
pub const ZERO_DIGEST: Digest = [0u8; 32];

/// Incremental hasher that length-prefixes every field.
///
/// Length prefixes make the encoding injective: `("ab", "c")` and
/// `("a", "bc")` produce different digests.
pub struct DomainHasher {
    inner: Hasher,
}

impl DomainHasher {
    /// Start a hasher bound to `domain`
    pub fn new(domain: &[u8]) -> Self {
        let mut inner = Hasher::new();
        inner.update(&(domain.len() as u64).to_be_bytes());
        inner.update(domain);
        Self { inner }
    }

    /// Append a length-prefixed byte field
    pub fn field(&mut self, bytes: &[u8]) -> &mut Self {
        self.inner.update(&(bytes.len() as u64).to_be_bytes());
        self.inner.update(bytes);
        self
    }

    /// Append a length-prefixed UTF-8 field
    pub fn str_field(&mut self, value: &str) -> &mut Self {
        self.field(value.as_bytes())
    }

    /// Append a fixed-width integer
    pub fn u64_field(&mut self, value: u64) -> &mut Self {
        self.inner.update(&value.to_be_bytes());
        self
    }

    /// Append a float by its IEEE-754 bit pattern
    pub fn f64_field(&mut self, value: f64) -> &mut Self {
        self.u64_field(value.to_bits())
    }

    /// Finish and return the digest
    pub fn finalize(&self) -> Digest {
        *self.inner.finalize().as_bytes()
    }
}

/// Hash `parts` under `domain` with length prefixes
pub fn hash_domain(domain: &[u8], parts: &[&[u8]]) -> Digest {
    let mut hasher = DomainHasher::new(domain);
    for part in parts {
        hasher.field(part);
    }
    hasher.finalize()
}

/// Hex-encode a digest for logs and wire formats
pub fn to_hex(digest: &Digest) -> String {
    hex::encode(digest)
}

/// Parse a hex digest
pub fn from_hex(value: &str) -> crate::Result<Digest> {
    let bytes = hex::decode(value)?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        crate::CoreError::Config(format!("digest must be 32 bytes, got {}", bytes.len()))
    })
}

/// Current Unix time in milliseconds
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
