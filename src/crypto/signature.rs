//! Signature and key types.
//!
//! Grounded on the teacher's `crypto::signature` module (feature
//! `crypto_signature_ring_ed25519`, backed by `ring`). Actual signing
//! and verification belong to the client-authentication/transport
//! stack, which §1 places out of scope; this module only defines the
//! wire-level shapes so `Request`/message types can carry them.

use std::fmt;

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::error::*;

/// A detached ed25519 signature.
#[derive(Clone, Eq, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct Signature(
    #[cfg_attr(feature = "serialize_serde", serde(with = "serde_bytes"))] Vec<u8>,
);

impl Signature {
    pub const LENGTH: usize = ring::signature::ED25519.signature_len();

    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() != Self::LENGTH {
            return Err("Signature has an invalid length").wrapped(ErrorKind::CryptoSignature);
        }
        Ok(Self(raw_bytes.to_vec()))
    }
}

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({} bytes)", self.0.len())
    }
}

/// An ed25519 public key, identifying a validator for the purposes of
/// signature verification done outside this crate.
#[derive(Clone, Eq, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct PublicKey(
    #[cfg_attr(feature = "serialize_serde", serde(with = "serde_bytes"))] Vec<u8>,
);

impl PublicKey {
    pub fn from_bytes(raw_bytes: &[u8]) -> Self {
        Self(raw_bytes.to_vec())
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({} bytes)", self.0.len())
    }
}

/// A BLS multi-signature, aggregated by the primary over a batch.
///
/// BLS aggregation itself is a collaborator out of scope here (§1,
/// "BLS key management"); this type is only the wire shape for the
/// optional `bls_multi_sig`/`bls_sig` fields.
#[derive(Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct BlsSignature(
    #[cfg_attr(feature = "serialize_serde", serde(with = "serde_bytes"))] Vec<u8>,
);

impl BlsSignature {
    pub fn from_bytes(raw_bytes: &[u8]) -> Self {
        Self(raw_bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_length_signature() {
        assert!(Signature::from_bytes(&[0; 3]).is_err());
    }

    #[test]
    fn accepts_correct_length_signature() {
        let buf = vec![0u8; Signature::LENGTH];
        assert!(Signature::from_bytes(&buf).is_ok());
    }
}
