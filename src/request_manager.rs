//! Client-request admission, deduplication and finalisation.
//!
//! Grounded on `write_request_manager.py` (§3.1): static validation
//! and the payload-digest dedup table live here, once, ahead of every
//! instance; dynamic validation is deferred to the pluggable
//! `RequestHandler` seam, since interpreting an operation is a
//! transaction-handler concern out of scope for this crate (§1).

use crate::collections::{hash_map, hash_set, ordered_map, HashMap, HashSet, OrderedMap};
use crate::crypto::hash::Digest;
use crate::ids::{InstId, NodeName};
use crate::message::{Propagate, Request};

/// Dynamic-validation outcome: the operation itself is well-formed
/// and deduplicated, but the transaction handler rejects it (e.g. a
/// state conflict). Client-visible per §7.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Reject {
    pub reason: String,
}

/// Static-validation or dedup failure: malformed request, a resend of
/// an already-ordered payload, or a replica-local rejection before
/// consensus starts. Client-visible per §7.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RequestNack {
    pub reason: String,
}

/// Confirms admission into the pending queue; does not imply ordering.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RequestAck;

/// The pluggable transaction-handler seam (§3.1). A production
/// deployment supplies a concrete implementation interpreting
/// `operation` against application state; this crate never does so
/// itself.
pub trait RequestHandler {
    fn dynamic_validation(&self, request: &Request) -> Result<(), Reject>;
}

/// A `RequestHandler` that accepts everything, for tests and demos
/// that don't exercise application-level rejection.
#[derive(Debug, Default)]
pub struct PermissiveHandler;

impl RequestHandler for PermissiveHandler {
    fn dynamic_validation(&self, _request: &Request) -> Result<(), Reject> {
        Ok(())
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
enum FinalisationState {
    /// Seen from `f+1` distinct PROPAGATEs, or trusted at admission
    /// time because it arrived from a local client.
    Finalised,
    /// Seen from fewer than `f+1` distinct senders so far.
    Pending(HashSet<NodeName>),
}

/// Cross-instance reference-counted, deduplicated request pool.
///
/// Ownership (§3, "Lifecycle"): a request is removable only when every
/// instance that referenced it has ordered or discarded it, tracked
/// here as a per-digest reference count incremented by
/// `reference`/decremented by `release`.
#[derive(Debug)]
pub struct RequestManager {
    f: usize,
    finalisation: HashMap<Digest, FinalisationState>,
    requests: HashMap<Digest, Request>,
    /// FIFO of finalised, not-yet-referenced-by-any-instance requests,
    /// consumed by the primary's OrderingService when assembling a
    /// batch.
    pending: OrderedMap<Digest, ()>,
    /// When each currently pending request first became finalised,
    /// used to decide whether the primary should cut an undersized
    /// batch rather than wait further (§4.2, "batch cutover").
    pending_since: HashMap<Digest, u64>,
    /// Requests already ordered by at least one instance; resubmission
    /// in a later PRE-PREPARE is a suspicion (`PPR_WITH_ORDERED_REQUEST`).
    ordered: HashSet<Digest>,
    ref_counts: HashMap<Digest, usize>,
}

impl RequestManager {
    pub fn new(f: usize) -> Self {
        Self {
            f,
            finalisation: hash_map(),
            requests: hash_map(),
            pending: ordered_map(),
            pending_since: hash_map(),
            ordered: hash_set(),
            ref_counts: hash_map(),
        }
    }

    /// Admits a request from a directly-connected client. Performs
    /// static validation (well-formedness, dedup against the ordered
    /// table) and dynamic validation through `handler`; a request
    /// admitted this way is trusted as finalised immediately, since it
    /// did not need a PROPAGATE quorum to be believed genuine.
    pub fn on_client_request<H: RequestHandler>(
        &mut self,
        request: Request,
        handler: &H,
        now_ms: u64,
    ) -> Result<RequestAck, RequestNack> {
        self.static_validate(&request)?;
        if let Err(reject) = handler.dynamic_validation(&request) {
            return Err(RequestNack { reason: reject.reason });
        }
        let digest = request.payload_digest();
        self.finalisation.insert(digest, FinalisationState::Finalised);
        self.requests.insert(digest, request);
        self.pending.insert(digest, ());
        self.pending_since.insert(digest, now_ms);
        Ok(RequestAck)
    }

    /// A PROPAGATE forwarded by a peer that itself received the
    /// request directly. Once `f+1` distinct senders have propagated
    /// the same payload, it becomes finalised and enters the pending
    /// queue (§3, "Request").
    pub fn on_propagate(&mut self, propagate: Propagate, from: NodeName, now_ms: u64) {
        let digest = propagate.request.payload_digest();
        if self.ordered.contains(&digest) {
            return;
        }
        let already_finalised =
            matches!(self.finalisation.get(&digest), Some(FinalisationState::Finalised));
        if already_finalised {
            self.requests.entry(digest).or_insert(propagate.request);
            return;
        }
        let senders = match self.finalisation.entry(digest).or_insert_with(|| {
            FinalisationState::Pending(hash_set())
        }) {
            FinalisationState::Pending(senders) => senders,
            FinalisationState::Finalised => unreachable!(),
        };
        senders.insert(from);
        let became_finalised = senders.len() >= self.f + 1;
        self.requests.entry(digest).or_insert(propagate.request);
        if became_finalised {
            self.finalisation.insert(digest, FinalisationState::Finalised);
            self.pending.insert(digest, ());
            self.pending_since.insert(digest, now_ms);
        }
    }

    pub fn is_finalised(&self, digest: Digest) -> bool {
        matches!(self.finalisation.get(&digest), Some(FinalisationState::Finalised))
    }

    /// Missing digests out of `wanted` that aren't yet finalised here,
    /// used to drive `RequestPropagates` on the internal bus.
    pub fn missing_of<'a, I: IntoIterator<Item = &'a Digest>>(&self, wanted: I) -> Vec<Digest> {
        wanted
            .into_iter()
            .filter(|d| !self.is_finalised(**d))
            .copied()
            .collect()
    }

    pub fn request(&self, digest: Digest) -> Option<&Request> {
        self.requests.get(&digest)
    }

    /// Takes up to `limit` finalised, pending requests for the primary
    /// to batch into a PRE-PREPARE, removing them from the pending
    /// queue but keeping them referenced until an instance calls
    /// `reference`.
    pub fn drain_pending(&mut self, limit: usize) -> Vec<Digest> {
        let mut drained = Vec::with_capacity(limit.min(self.pending.len()));
        while drained.len() < limit {
            match self.pending.pop_front() {
                Some((digest, ())) => {
                    self.pending_since.remove(&digest);
                    drained.push(digest);
                }
                None => break,
            }
        }
        drained
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// How long the oldest still-pending request has waited, used to
    /// decide whether the primary should cut an undersized batch
    /// rather than wait for `max_batch_size` (§4.2, "batch cutover").
    pub fn oldest_pending_age_ms(&self, now_ms: u64) -> Option<u64> {
        self.pending
            .keys()
            .next()
            .and_then(|digest| self.pending_since.get(digest))
            .map(|since| now_ms.saturating_sub(*since))
    }

    /// Called by an instance when it includes `digest` in a batch
    /// under consideration (preprepared but not yet ordered).
    pub fn reference(&mut self, digest: Digest, _inst_id: InstId) {
        *self.ref_counts.entry(digest).or_insert(0) += 1;
    }

    /// Called by an instance when it has ordered or discarded a batch
    /// containing `digest`. Frees the request payload once every
    /// referencing instance has released it.
    pub fn release(&mut self, digest: Digest, _inst_id: InstId, ordered: bool) {
        if ordered {
            self.ordered.insert(digest);
        }
        if let Some(count) = self.ref_counts.get_mut(&digest) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.ref_counts.remove(&digest);
                if self.ordered.contains(&digest) {
                    self.requests.remove(&digest);
                }
            }
        }
    }

    pub fn is_already_ordered(&self, digest: Digest) -> bool {
        self.ordered.contains(&digest)
    }

    fn static_validate(&self, request: &Request) -> Result<(), RequestNack> {
        if request.identifier.0.is_empty() {
            return Err(RequestNack { reason: "empty client identifier".into() });
        }
        if self.is_already_ordered(request.payload_digest()) {
            return Err(RequestNack { reason: "duplicate of an already-ordered request".into() });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Request;

    fn req(client: &str, id: u64) -> Request {
        Request::new(NodeName::from(client), id, b"op".to_vec(), None, None)
    }

    #[test]
    fn client_request_is_finalised_immediately() {
        let mut rm = RequestManager::new(1);
        let r = req("alice", 1);
        let digest = r.payload_digest();
        rm.on_client_request(r, &PermissiveHandler, 0).unwrap();
        assert!(rm.is_finalised(digest));
        assert_eq!(rm.pending_len(), 1);
    }

    #[test]
    fn propagate_needs_f_plus_one_distinct_senders() {
        let mut rm = RequestManager::new(1);
        let r = req("bob", 2);
        let digest = r.payload_digest();
        let propagate = Propagate { request: r, sender_client: NodeName::from("bob") };
        rm.on_propagate(propagate.clone(), NodeName::from("n1"), 0);
        assert!(!rm.is_finalised(digest));
        rm.on_propagate(propagate, NodeName::from("n2"), 0);
        assert!(rm.is_finalised(digest));
    }

    #[test]
    fn duplicate_sender_does_not_double_count() {
        let mut rm = RequestManager::new(1);
        let r = req("carol", 3);
        let digest = r.payload_digest();
        let propagate = Propagate { request: r, sender_client: NodeName::from("carol") };
        rm.on_propagate(propagate.clone(), NodeName::from("n1"), 0);
        rm.on_propagate(propagate, NodeName::from("n1"), 0);
        assert!(!rm.is_finalised(digest));
    }

    #[test]
    fn ordered_request_is_rejected_on_resubmission() {
        let mut rm = RequestManager::new(1);
        let r = req("dan", 4);
        let digest = r.payload_digest();
        rm.on_client_request(r.clone(), &PermissiveHandler, 0).unwrap();
        rm.reference(digest, InstId::from(0));
        rm.release(digest, InstId::from(0), true);
        let err = rm.on_client_request(r, &PermissiveHandler, 0).unwrap_err();
        assert!(err.reason.contains("duplicate"));
    }

    #[test]
    fn drain_pending_respects_limit() {
        let mut rm = RequestManager::new(1);
        rm.on_client_request(req("eve", 1), &PermissiveHandler, 0).unwrap();
        rm.on_client_request(req("eve", 2), &PermissiveHandler, 0).unwrap();
        let drained = rm.drain_pending(1);
        assert_eq!(drained.len(), 1);
        assert_eq!(rm.pending_len(), 1);
    }

    #[test]
    fn oldest_pending_age_tracks_the_fifo_head() {
        let mut rm = RequestManager::new(1);
        rm.on_client_request(req("frank", 1), &PermissiveHandler, 1_000).unwrap();
        assert_eq!(rm.oldest_pending_age_ms(1_500), Some(500));
        rm.drain_pending(1);
        assert_eq!(rm.oldest_pending_age_ms(1_500), None);
    }
}
