//! Content hashing, used to compute `payload_digest`/`full_digest` on
//! requests and the Merkle-like digest of a [`Checkpoint`](crate::checkpoint_service::Checkpoint).
//!
//! Grounded on the teacher's `crypto::hash::ring_sha2` module, which
//! wraps a fixed-length digest behind a newtype; this crate instead
//! uses `blake3`, matching the teacher's own default feature
//! (`crypto_hash_blake3_blake3`).

use std::fmt;

use crate::error::*;

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

/// A fixed-width hash over the canonical serialization of its subject.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct Digest([u8; Digest::LENGTH]);

impl Digest {
    pub const LENGTH: usize = 32;

    /// Hashes `bytes` with the configured content hash function.
    pub fn from_data(bytes: &[u8]) -> Self {
        let hash = blake3::hash(bytes);
        Self(*hash.as_bytes())
    }

    /// Builds a digest directly from a raw byte buffer, e.g. one
    /// received over the wire.
    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() < Self::LENGTH {
            return Err("Digest has an invalid length").wrapped(ErrorKind::CryptoHash);
        }
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(&raw_bytes[..Self::LENGTH]);
        Ok(Self(inner))
    }

    /// Combines two digests into one, used to fold a sequence of
    /// per-batch digests into a single checkpoint digest.
    pub fn combine(left: &Digest, right: &Digest) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&left.0);
        hasher.update(&right.0);
        Self(*hasher.finalize().as_bytes())
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "…")
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Folds a sequence of digests (e.g. the ordered batches within a
/// checkpoint range) into a single Merkle-like digest.
pub fn fold_digests<'a, I: IntoIterator<Item = &'a Digest>>(digests: I) -> Digest {
    let mut iter = digests.into_iter();
    let first = match iter.next() {
        Some(d) => *d,
        None => return Digest::from_data(&[]),
    };
    iter.fold(first, |acc, next| Digest::combine(&acc, next))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_deterministic() {
        let a = Digest::from_data(b"hello");
        let b = Digest::from_data(b"hello");
        assert_eq!(a, b);
    }

    #[test]
    fn different_input_different_digest() {
        let a = Digest::from_data(b"hello");
        let b = Digest::from_data(b"world");
        assert_ne!(a, b);
    }

    #[test]
    fn round_trip_through_bytes() {
        let a = Digest::from_data(b"round-trip");
        let b = Digest::from_bytes(a.as_ref()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fold_digests_is_order_sensitive() {
        let a = Digest::from_data(b"a");
        let b = Digest::from_data(b"b");
        let ab = fold_digests([&a, &b]);
        let ba = fold_digests([&b, &a]);
        assert_ne!(ab, ba);
    }
}
