//! Wire message types traded between validators (and, for `Ordered`,
//! between the ordering service and the executor).
//!
//! Grounded on the teacher's `communication::message` module: a
//! `Header` attributing a message to its sender, and a `SystemMessage`
//! enum enumerating every sub-protocol message kind, so dispatch can
//! use an exhaustive match instead of dynamic type lookups (Design
//! Note: "dynamic dispatch over message types").
//!
//! The actual envelope signing/verification and framing belong to the
//! transport collaborator (§1, out of scope) — `Header` here only
//! records the sender identity the transport has already authenticated.

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::crypto::hash::{fold_digests, Digest};
use crate::crypto::signature::{BlsSignature, Signature};
use crate::ids::{InstId, NodeName, PpSeqNo, ThreePcKey, ViewNo};

/// Attributes a message to the validator the transport received it
/// from.
#[derive(Debug, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct Header {
    pub from: NodeName,
}

impl Header {
    pub fn new(from: NodeName) -> Self {
        Self { from }
    }
}

/// A message with the identity of the validator it was received from
/// attached. Mirrors the teacher's `StoredMessage<M>`.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct StoredMessage<M> {
    header: Header,
    message: M,
}

impl<M> StoredMessage<M> {
    pub fn new(header: Header, message: M) -> Self {
        Self { header, message }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn message(&self) -> &M {
        &self.message
    }

    pub fn from(&self) -> &NodeName {
        &self.header.from
    }

    pub fn into_inner(self) -> (Header, M) {
        (self.header, self.message)
    }
}

/// Optional "transaction author agreement" acceptance envelope carried
/// by a client request; opaque beyond its presence/absence, since
/// interpreting it is a transaction-handler concern (out of scope).
#[derive(Debug, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct TaaAcceptance {
    pub mechanism: String,
    pub taa_digest: Digest,
    pub acceptance_time: u64,
}

/// A client request, ordered across the cluster.
///
/// `payload_digest` covers only the semantically binding fields
/// (identifier, req_id, operation) and is the deduplication key;
/// `full_digest` additionally covers the signature.
#[derive(Debug, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct Request {
    pub identifier: NodeName,
    pub req_id: u64,
    pub operation: Vec<u8>,
    pub signature: Option<Signature>,
    pub taa_acceptance: Option<TaaAcceptance>,
    payload_digest: Digest,
    full_digest: Digest,
}

impl Request {
    /// Builds a `Request`, computing its digests from the canonical
    /// byte encoding of its fields.
    pub fn new(
        identifier: NodeName,
        req_id: u64,
        operation: Vec<u8>,
        signature: Option<Signature>,
        taa_acceptance: Option<TaaAcceptance>,
    ) -> Self {
        let payload_digest = Self::compute_payload_digest(&identifier, req_id, &operation);
        let full_digest =
            Self::compute_full_digest(&payload_digest, signature.as_ref());
        Self {
            identifier,
            req_id,
            operation,
            signature,
            taa_acceptance,
            payload_digest,
            full_digest,
        }
    }

    fn compute_payload_digest(identifier: &NodeName, req_id: u64, operation: &[u8]) -> Digest {
        let mut buf = Vec::with_capacity(identifier.0.len() + 8 + operation.len());
        buf.extend_from_slice(identifier.0.as_bytes());
        buf.extend_from_slice(&req_id.to_le_bytes());
        buf.extend_from_slice(operation);
        Digest::from_data(&buf)
    }

    fn compute_full_digest(payload_digest: &Digest, signature: Option<&Signature>) -> Digest {
        match signature {
            None => *payload_digest,
            Some(sig) => {
                let mut buf = payload_digest.as_ref().to_vec();
                buf.extend_from_slice(sig.as_ref());
                Digest::from_data(&buf)
            }
        }
    }

    pub fn payload_digest(&self) -> Digest {
        self.payload_digest
    }

    pub fn full_digest(&self) -> Digest {
        self.full_digest
    }
}

/// A client request forwarded by the original recipient to its peers,
/// so that non-recipients can still finalise it (§3, "finalised").
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct Propagate {
    pub request: Request,
    pub sender_client: NodeName,
}

/// A batch proposal from the primary.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct PrePrepare {
    pub inst_id: InstId,
    pub view_no: ViewNo,
    pub pp_seq_no: PpSeqNo,
    /// Primary's wall-clock stamp, monotone non-decreasing within a view.
    pub pp_time: u64,
    pub ledger_id: u64,
    pub req_idr: Vec<Digest>,
    pub digest: Digest,
    pub state_root: Digest,
    pub txn_root: Digest,
    /// Always 0 in this design (see Open Question on sub-batching);
    /// preserved on the wire, non-zero values raise a suspicion.
    pub sub_seq_no: u32,
    pub final_batch: bool,
    pub pool_state_root: Digest,
    pub audit_txn_root: Digest,
    pub bls_multi_sig: Option<BlsSignature>,
}

impl PrePrepare {
    /// Computes the `digest` field from `req_idr`, so a received
    /// `PrePrepare` can be checked for self-consistency.
    pub fn compute_digest(req_idr: &[Digest]) -> Digest {
        fold_digests(req_idr)
    }

    pub fn three_pc_key(&self) -> ThreePcKey {
        ThreePcKey::new(self.view_no, self.pp_seq_no)
    }
}

/// A vote to prepare a batch, cast by a non-primary instance.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct Prepare {
    pub inst_id: InstId,
    pub view_no: ViewNo,
    pub pp_seq_no: PpSeqNo,
    pub digest: Digest,
    pub state_root: Digest,
    pub txn_root: Digest,
    pub bls_sig: Option<BlsSignature>,
}

impl Prepare {
    pub fn three_pc_key(&self) -> ThreePcKey {
        ThreePcKey::new(self.view_no, self.pp_seq_no)
    }
}

/// A vote to commit a batch.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct Commit {
    pub inst_id: InstId,
    pub view_no: ViewNo,
    pub pp_seq_no: PpSeqNo,
    pub bls_sig: Option<BlsSignature>,
}

impl Commit {
    pub fn three_pc_key(&self) -> ThreePcKey {
        ThreePcKey::new(self.view_no, self.pp_seq_no)
    }
}

/// A message pertaining to one of the three ordering phases.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub enum ConsensusMessage {
    PrePrepare(PrePrepare),
    Prepare(Prepare),
    Commit(Commit),
}

impl ConsensusMessage {
    pub fn inst_id(&self) -> InstId {
        match self {
            Self::PrePrepare(m) => m.inst_id,
            Self::Prepare(m) => m.inst_id,
            Self::Commit(m) => m.inst_id,
        }
    }

    pub fn view_no(&self) -> ViewNo {
        match self {
            Self::PrePrepare(m) => m.view_no,
            Self::Prepare(m) => m.view_no,
            Self::Commit(m) => m.view_no,
        }
    }

    pub fn three_pc_key(&self) -> ThreePcKey {
        match self {
            Self::PrePrepare(m) => m.three_pc_key(),
            Self::Prepare(m) => m.three_pc_key(),
            Self::Commit(m) => m.three_pc_key(),
        }
    }
}

/// An agreed snapshot point, proposed for stability.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct Checkpoint {
    pub inst_id: InstId,
    pub view_no: ViewNo,
    pub seq_no_start: PpSeqNo,
    pub seq_no_end: PpSeqNo,
    pub digest: Digest,
}

/// The reason a replica suspects the primary and is requesting a view
/// change.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub enum InstanceChangeReason {
    PrimaryDisconnected,
    PrimaryDegradedThroughput,
    PrimaryDegradedLatency,
    Suspicion(SuspicionCode),
    Timeout,
}

/// Byzantine evidence codes (§7, kind 1: Suspicion). All drop the
/// offending message; primary-attributable codes additionally route
/// to `ViewChangeService::on_suspicious_primary`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub enum SuspicionCode {
    PprDigestWrong,
    PprStateWrong,
    PprTxnWrong,
    PprPluginException,
    PprSubSeqNoWrong,
    PprNotFinal,
    PprWithOrderedRequest,
    PprAuditTxnRootHashWrong,
    PprPoolStateRootHashWrong,
    PprBlsMultisigWrong,
    PprTimeWrong,
}

impl SuspicionCode {
    /// All current suspicion codes are attributable to the primary of
    /// the batch they were raised against.
    pub fn is_primary_attributable(self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct InstanceChange {
    pub view_no: ViewNo,
    pub reason: InstanceChangeReason,
}

/// Per-ledger root info reported by a replica at the end of a view.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct LedgerInfo {
    pub ledger_id: u64,
    pub size: u64,
    pub root: Digest,
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct ViewChangeDone {
    pub view_no: ViewNo,
    pub name: NodeName,
    pub ledger_info: Vec<LedgerInfo>,
    pub last_prepared: Option<ThreePcKey>,
}

/// Internal envelope used to stash a `ViewChangeDone` that arrived for
/// a view further in the future than the one currently being
/// negotiated.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct FutureViewChangeDone {
    pub vcd_msg: ViewChangeDone,
}

/// The kind of missing-message the `MessageReq`/`MessageRep`
/// request-missed-messages protocol can ask for.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub enum MissingMsgKind {
    PrePrepares,
    Prepares,
    Commits,
    Checkpoints,
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct MessageReq {
    pub inst_id: InstId,
    pub kind: MissingMsgKind,
    pub range: (PpSeqNo, PpSeqNo),
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct MessageRep {
    pub inst_id: InstId,
    pub kind: MissingMsgKind,
    pub messages: Vec<ConsensusMessage>,
}

/// Internal-only event carrying a committed batch to the executor.
/// Never sent over the wire.
#[derive(Debug, Clone)]
pub struct Ordered {
    pub inst_id: InstId,
    pub view_no: ViewNo,
    pub pp_seq_no: PpSeqNo,
    pub ledger_id: u64,
    pub pp_time: u64,
    pub req_idr: Vec<Digest>,
}

/// Every message kind traded between validators (plus the
/// client-request and internal-only `Ordered` kinds), dispatched with
/// an exhaustive match rather than a router table (Design Note).
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub enum SystemMessage {
    Request(Request),
    Propagate(Propagate),
    Consensus(ConsensusMessage),
    Checkpoint(Checkpoint),
    InstanceChange(InstanceChange),
    ViewChangeDone(ViewChangeDone),
    FutureViewChangeDone(FutureViewChangeDone),
    MessageReq(MessageReq),
    MessageRep(MessageRep),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> Request {
        Request::new(NodeName::from("client-1"), 42, b"op-bytes".to_vec(), None, None)
    }

    #[test]
    fn request_digests_are_stable() {
        let r1 = sample_request();
        let r2 = sample_request();
        assert_eq!(r1.payload_digest(), r2.payload_digest());
        assert_eq!(r1.full_digest(), r2.full_digest());
    }

    #[test]
    fn signature_changes_full_digest_not_payload_digest() {
        let unsigned = sample_request();
        let signed = Request::new(
            NodeName::from("client-1"),
            42,
            b"op-bytes".to_vec(),
            Some(Signature::from_bytes(&[1; Signature::LENGTH]).unwrap()),
            None,
        );
        assert_eq!(unsigned.payload_digest(), signed.payload_digest());
        assert_ne!(unsigned.full_digest(), signed.full_digest());
    }

    #[test]
    fn pre_prepare_digest_matches_request_digests() {
        let digests = vec![Digest::from_data(b"a"), Digest::from_data(b"b")];
        let digest = PrePrepare::compute_digest(&digests);
        assert_eq!(digest, fold_digests(&digests));
    }

    #[cfg(feature = "serialize_serde")]
    #[test]
    fn commit_round_trips_through_serde_json() {
        let commit = Commit {
            inst_id: InstId::from(0),
            view_no: ViewNo::from(1),
            pp_seq_no: PpSeqNo::from(2),
            bls_sig: None,
        };
        let msg = SystemMessage::Consensus(ConsensusMessage::Commit(commit));
        let encoded = serde_json::to_vec(&msg).unwrap();
        let decoded: SystemMessage = serde_json::from_slice(&encoded).unwrap();
        match decoded {
            SystemMessage::Consensus(ConsensusMessage::Commit(c)) => {
                assert_eq!(c.pp_seq_no, PpSeqNo::from(2));
            }
            _ => panic!("wrong variant"),
        }
    }
}
