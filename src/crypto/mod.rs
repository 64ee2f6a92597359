//! Cryptographic primitives used by the engine: content hashing
//! (`Digest`) and the validator signature type (`Signature`).
//!
//! Both modules mirror the teacher's `crypto::hash` / `crypto::signature`
//! split, but the signature type is a thin wrapper only — actual
//! verification lives in the client-authentication / transport stack,
//! which is explicitly out of scope (§1).

pub mod hash;
pub mod signature;
