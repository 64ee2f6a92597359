//! The three-phase (PRE-PREPARE / PREPARE / COMMIT) ordering engine.
//!
//! Grounded on the teacher's `consensus::mod` (`Consensus<S>`,
//! `ProtoPhase`, `TboQueue`): per-instance 3PC bookkeeping driven by a
//! `poll`-style entry point per message kind, never blocking (§5.1).
//! The suspicion/time-integrity rules and the `pre_prepare_tss`
//! bookkeeping are pinned by §4.2/§4.2.1 against
//! `test_pp_obsolescence.py`.

use crate::collections::{hash_map, hash_set, ordered_map, HashMap, HashSet, OrderedMap};
use crate::crypto::hash::Digest;
use crate::ids::{NodeName, PpSeqNo, ThreePcKey, ViewNo};
use crate::message::{Commit, Ordered, Prepare, PrePrepare, SuspicionCode};
use crate::shared_data::SharedData;
use crate::stasher::StashKind;
use crate::validator::{self, Decision, DiscardReason, MessageHeader};

/// Every distinct thing that can happen after feeding a message
/// through the ordering service. Callers (`instance.rs`) match on this
/// to decide what to broadcast, stash, or hand to the executor.
#[derive(Debug, Clone)]
pub enum OrderingOutcome {
    Discarded(DiscardReason),
    Stashed(StashKind),
    /// The listed digests aren't finalised yet; the caller should ask
    /// the request manager to request propagation and stash the
    /// PrePrepare under `NotYetFinalised`.
    AwaitingFinalisation(Vec<Digest>),
    /// A PRE-PREPARE was accepted; broadcast this PREPARE.
    PreparedLocally(Prepare),
    /// `2f` matching PREPAREs gathered; broadcast this COMMIT.
    ReachedPrepared(Commit),
    /// `2f+1` matching COMMITs gathered and it's this batch's turn;
    /// hand this to the executor.
    ReachedOrdered(Ordered),
    /// Byzantine evidence against the primary or a peer; drop the
    /// message and, if primary-attributable, request a view change.
    Suspicion(SuspicionCode),
    /// Nothing observable changed (e.g. a vote that didn't reach
    /// quorum yet).
    NothingYet,
}

/// The roots a staged application of a batch's requests produced,
/// supplied by the caller after driving the `Application`/`ExecutorHandle`
/// collaborator (§5.1) — this service never calls it directly, so it
/// can't be stalled by slow or buggy application code.
#[derive(Debug, Clone, Copy)]
pub struct StagedRoots {
    pub state_root: Digest,
    pub txn_root: Digest,
    pub pool_state_root: Digest,
    pub audit_txn_root: Digest,
}

struct VoteTally {
    votes: HashMap<ThreePcKey, HashMap<Digest, HashSet<NodeName>>>,
}

impl VoteTally {
    fn new() -> Self {
        Self { votes: hash_map() }
    }

    fn record(&mut self, key: ThreePcKey, digest: Digest, from: NodeName) -> usize {
        let by_digest = self.votes.entry(key).or_insert_with(hash_map);
        let senders = by_digest.entry(digest).or_insert_with(hash_set);
        senders.insert(from);
        senders.len()
    }

    fn forget(&mut self, key: ThreePcKey) {
        self.votes.remove(&key);
    }

    fn gc_up_to(&mut self, end: PpSeqNo) {
        self.votes.retain(|key, _| key.pp_seq_no() > end);
    }
}

/// Per-instance 3PC state machine.
pub struct OrderingService {
    quorum_prepares: usize,
    quorum_commits: usize,
    acceptable_deviation_ms: u64,
    next_pp_seq_no: PpSeqNo,
    pre_prepare_tss: HashMap<ThreePcKey, HashMap<(Digest, NodeName), u64>>,
    last_accepted_pp_time: HashMap<(ViewNo, NodeName), u64>,
    preprepared: HashMap<ThreePcKey, PrePrepare>,
    prepares: VoteTally,
    commits: VoteTally,
    prepared: HashSet<ThreePcKey>,
    ordered: HashSet<ThreePcKey>,
    stashed_out_of_order_commits: HashMap<ViewNo, OrderedMap<PpSeqNo, Commit>>,
}

impl OrderingService {
    pub fn new(
        quorum_prepares: usize,
        quorum_commits: usize,
        acceptable_deviation_ms: u64,
        next_pp_seq_no: PpSeqNo,
    ) -> Self {
        Self {
            quorum_prepares,
            quorum_commits,
            acceptable_deviation_ms,
            next_pp_seq_no,
            pre_prepare_tss: hash_map(),
            last_accepted_pp_time: hash_map(),
            preprepared: hash_map(),
            prepares: VoteTally::new(),
            commits: VoteTally::new(),
            prepared: hash_set(),
            ordered: hash_set(),
            stashed_out_of_order_commits: hash_map(),
        }
    }

    /// Whether the primary should emit a batch now: either the queue
    /// is full or the oldest entry has waited past `batch_timeout`.
    pub fn should_propose(&self, pending_len: usize, max_batch_size: usize, oldest_age_ms: Option<u64>, batch_timeout_ms: u64) -> bool {
        pending_len >= max_batch_size
            || oldest_age_ms.map(|age| age >= batch_timeout_ms).unwrap_or(false)
    }

    /// Assembles and records a new PRE-PREPARE as this instance's
    /// primary. The caller broadcasts the returned message.
    pub fn propose(
        &mut self,
        shared: &SharedData,
        req_idr: Vec<Digest>,
        pp_time: u64,
        ledger_id: u64,
        roots: StagedRoots,
    ) -> PrePrepare {
        let pp_seq_no = self.next_pp_seq_no;
        self.next_pp_seq_no = pp_seq_no.next();
        let digest = PrePrepare::compute_digest(&req_idr);
        let pp = PrePrepare {
            inst_id: shared.inst_id(),
            view_no: shared.view_no(),
            pp_seq_no,
            pp_time,
            ledger_id,
            req_idr,
            digest,
            state_root: roots.state_root,
            txn_root: roots.txn_root,
            sub_seq_no: 0,
            final_batch: true,
            pool_state_root: roots.pool_state_root,
            audit_txn_root: roots.audit_txn_root,
            bls_multi_sig: None,
        };
        self.preprepared.insert(pp.three_pc_key(), pp.clone());
        pp
    }

    /// The next `PpSeqNo` this instance will propose as primary; used
    /// to restore `last_sent_pp_seq_no` across a restart (§6.1).
    pub fn next_pp_seq_no(&self) -> PpSeqNo {
        self.next_pp_seq_no
    }

    pub fn restore_next_pp_seq_no(&mut self, value: PpSeqNo) {
        self.next_pp_seq_no = value;
    }

    /// Handles an inbound PRE-PREPARE. Records the arrival timestamp
    /// for `(key, digest, from)` unconditionally, before any
    /// classification — matching `test_ts_is_set_for_discarded_pp` /
    /// `test_ts_is_set_for_stashed_pp` (§4.2.1): the bookkeeping table
    /// must reflect every call, not only successful ones. The entry
    /// already present *before* this call's write (if any) is the one
    /// the deviation check below consults, so a later re-delivery of
    /// the same `(key, digest, from)` can still be judged against the
    /// original arrival time rather than the timestamp this very call
    /// is about to stamp.
    #[allow(clippy::too_many_arguments)]
    pub fn on_pre_prepare(
        &mut self,
        pp: PrePrepare,
        from: NodeName,
        shared: &SharedData,
        now_ms: u64,
        missing: Vec<Digest>,
        already_ordered: bool,
        roots: Option<StagedRoots>,
    ) -> OrderingOutcome {
        let key = pp.three_pc_key();
        let previously_recorded_ts = self
            .pre_prepare_tss
            .get(&key)
            .and_then(|m| m.get(&(pp.digest, from.clone())))
            .copied();
        self.pre_prepare_tss
            .entry(key)
            .or_insert_with(hash_map)
            .insert((pp.digest, from.clone()), now_ms);

        let header = MessageHeader {
            inst_id: pp.inst_id,
            view_no: pp.view_no,
            pp_seq_no: Some(pp.pp_seq_no),
            checkpoint_seq_no_end: None,
        };
        match validator::classify(shared, &header) {
            Decision::Discard(reason) => return OrderingOutcome::Discarded(reason),
            Decision::Stash(kind) => return OrderingOutcome::Stashed(kind),
            Decision::Process => {}
        }

        if pp.sub_seq_no != 0 {
            return OrderingOutcome::Suspicion(SuspicionCode::PprSubSeqNoWrong);
        }
        if !pp.final_batch {
            return OrderingOutcome::Suspicion(SuspicionCode::PprNotFinal);
        }
        if already_ordered {
            return OrderingOutcome::Suspicion(SuspicionCode::PprWithOrderedRequest);
        }
        if PrePrepare::compute_digest(&pp.req_idr) != pp.digest {
            return OrderingOutcome::Suspicion(SuspicionCode::PprDigestWrong);
        }
        if !missing.is_empty() {
            return OrderingOutcome::AwaitingFinalisation(missing);
        }
        if !self.is_pre_prepare_time_correct(key, &from, pp.pp_time, now_ms, previously_recorded_ts) {
            return OrderingOutcome::Suspicion(SuspicionCode::PprTimeWrong);
        }

        let roots = match roots {
            Some(r) => r,
            None => return OrderingOutcome::NothingYet,
        };
        if roots.state_root != pp.state_root {
            return OrderingOutcome::Suspicion(SuspicionCode::PprStateWrong);
        }
        if roots.txn_root != pp.txn_root {
            return OrderingOutcome::Suspicion(SuspicionCode::PprTxnWrong);
        }
        if roots.pool_state_root != pp.pool_state_root {
            return OrderingOutcome::Suspicion(SuspicionCode::PprPoolStateRootHashWrong);
        }
        if roots.audit_txn_root != pp.audit_txn_root {
            return OrderingOutcome::Suspicion(SuspicionCode::PprAuditTxnRootHashWrong);
        }

        self.last_accepted_pp_time.insert((pp.view_no, from), pp.pp_time);
        let inst_id = pp.inst_id;
        let digest = pp.digest;
        let state_root = pp.state_root;
        let txn_root = pp.txn_root;
        self.preprepared.insert(key, pp);
        let prepare = Prepare {
            inst_id,
            view_no: key.view_no(),
            pp_seq_no: key.pp_seq_no(),
            digest,
            state_root,
            txn_root,
            bls_sig: None,
        };
        OrderingOutcome::PreparedLocally(prepare)
    }

    /// (a) a replay older than the last accepted `pp_time` from this
    /// sender in this view; (b) the claimed `pp_time` deviates from
    /// the reference reception time by more than
    /// `acceptable_deviation_ms`. The reference is the timestamp this
    /// exact `(key, digest, from)` was *previously* recorded at
    /// (`previously_recorded_ts`), not the one `on_pre_prepare` just
    /// stamped for this call — that lets a message re-examined later
    /// (e.g. after being stashed and replayed) still be judged against
    /// its original arrival time rather than however long it's been
    /// sitting since. On a message's first-ever sighting there is no
    /// such prior entry, so `now_ms` — this call's own reception time —
    /// is the only sensible reference.
    fn is_pre_prepare_time_correct(
        &self,
        key: ThreePcKey,
        sender: &NodeName,
        pp_time: u64,
        now_ms: u64,
        previously_recorded_ts: Option<u64>,
    ) -> bool {
        if let Some(last) = self.last_accepted_pp_time.get(&(key.view_no(), sender.clone())) {
            if pp_time < *last {
                return false;
            }
        }
        let reference = previously_recorded_ts.unwrap_or(now_ms);
        let drift = reference.abs_diff(pp_time);
        drift <= self.acceptable_deviation_ms
    }

    pub fn on_prepare(&mut self, prepare: Prepare, from: NodeName) -> OrderingOutcome {
        let key = prepare.three_pc_key();
        if self.prepared.contains(&key) {
            return OrderingOutcome::NothingYet;
        }
        let preprepared_digest = match self.preprepared.get(&key) {
            Some(pp) => pp.digest,
            None => return OrderingOutcome::Stashed(StashKind::MissingPrePrepare),
        };
        if prepare.digest != preprepared_digest {
            return OrderingOutcome::Suspicion(SuspicionCode::PprDigestWrong);
        }
        let count = self.prepares.record(key, prepare.digest, from);
        if count >= self.quorum_prepares {
            self.prepared.insert(key);
            OrderingOutcome::ReachedPrepared(Commit {
                inst_id: prepare.inst_id,
                view_no: key.view_no(),
                pp_seq_no: key.pp_seq_no(),
                bls_sig: None,
            })
        } else {
            OrderingOutcome::NothingYet
        }
    }

    /// Commits accumulate regardless of `prepared` status (a correct
    /// replica may see `2f+1` commits before its own `2f` prepares
    /// complete); emission of `Ordered` is still gated on `prepared`
    /// for *this* replica's own safety, per §4.2 Tie-breaks.
    pub fn on_commit(&mut self, commit: Commit, from: NodeName, last_ordered: ThreePcKey) -> OrderingOutcome {
        let key = commit.three_pc_key();
        if self.ordered.contains(&key) {
            return OrderingOutcome::NothingYet;
        }
        let digest = match self.preprepared.get(&key) {
            Some(pp) => pp.digest,
            None => return OrderingOutcome::Stashed(StashKind::MissingPrePrepare),
        };
        let count = self.commits.record(key, digest, from);
        if count < self.quorum_commits {
            return OrderingOutcome::NothingYet;
        }

        let expected_next = ThreePcKey::new(key.view_no(), last_ordered.pp_seq_no().next());
        if key != expected_next {
            self.stashed_out_of_order_commits
                .entry(key.view_no())
                .or_insert_with(ordered_map)
                .insert(key.pp_seq_no(), commit);
            return OrderingOutcome::NothingYet;
        }

        self.ordered.insert(key);
        let pp = self.preprepared.get(&key).expect("preprepared entry must exist to reach ordered");
        OrderingOutcome::ReachedOrdered(Ordered {
            inst_id: pp.inst_id,
            view_no: pp.view_no,
            pp_seq_no: pp.pp_seq_no,
            ledger_id: pp.ledger_id,
            pp_time: pp.pp_time,
            req_idr: pp.req_idr.clone(),
        })
    }

    /// After ordering `(v, s)`, replays any COMMIT for `(v, s+1)` that
    /// had arrived early and was stashed waiting its turn.
    pub fn take_next_stashed_commit(&mut self, view_no: ViewNo, next: PpSeqNo) -> Option<Commit> {
        let queue = self.stashed_out_of_order_commits.get_mut(&view_no)?;
        let front_is_next = queue.front().map(|(seq, _)| *seq == next).unwrap_or(false);
        if front_is_next {
            queue.pop_front().map(|(_, commit)| commit)
        } else {
            None
        }
    }

    /// Undoes every batch that reached `prepared` but was never
    /// `ordered`, in reverse application order, so staged state
    /// matches the last stable point before a view change (§4.2).
    pub fn revert_unordered_batches(&mut self) -> Vec<ThreePcKey> {
        let mut unordered: Vec<ThreePcKey> = self
            .prepared
            .iter()
            .filter(|key| !self.ordered.contains(key))
            .copied()
            .collect();
        unordered.sort_by(|a, b| b.cmp(a));
        for key in &unordered {
            self.prepared.remove(key);
            self.preprepared.remove(key);
            self.prepares.forget(*key);
            self.commits.forget(*key);
        }
        unordered
    }

    /// Drops every 3PC table entry at or below `end`, the newly stable
    /// checkpoint boundary (§4.3). Strictly less-or-equal, matching
    /// `test_pre_prepare_tss_is_cleaned_in_gc`.
    pub fn gc(&mut self, end: PpSeqNo) {
        self.pre_prepare_tss.retain(|key, _| key.pp_seq_no() > end);
        self.preprepared.retain(|key, _| key.pp_seq_no() > end);
        self.prepared.retain(|key| key.pp_seq_no() > end);
        self.ordered.retain(|key| key.pp_seq_no() > end);
        self.prepares.gc_up_to(end);
        self.commits.gc_up_to(end);
        self.last_accepted_pp_time.clear();
    }

    /// The highest 3PC key currently `prepared` (whether or not it has
    /// gone on to `ordered`), used as `last_prepared_before_view_change`
    /// when this replica builds its `ViewChangeDone` (§4.4 step 2).
    pub fn highest_prepared(&self) -> Option<ThreePcKey> {
        self.prepared.iter().max().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::InstId;

    fn ready_instance(view_no: ViewNo) -> SharedData {
        let mut sd = SharedData::new(InstId::MASTER, 10, 4);
        sd.install_view(view_no, NodeName::from("n0"));
        sd.set_mode(crate::shared_data::Mode::Participating);
        sd
    }

    fn roots(tag: u8) -> StagedRoots {
        let d = Digest::from_data(&[tag]);
        StagedRoots { state_root: d, txn_root: d, pool_state_root: d, audit_txn_root: d }
    }

    fn full_flow(os: &mut OrderingService, shared: &SharedData, pp: PrePrepare) -> Ordered {
        let key = pp.three_pc_key();
        let r = roots(7);
        let outcome = os.on_pre_prepare(pp, NodeName::from("primary"), shared, 1_000, vec![], false, Some(r));
        let prepare = match outcome {
            OrderingOutcome::PreparedLocally(p) => p,
            other => panic!("expected PreparedLocally, got {:?}", other),
        };
        // self-prepare plus two peers reaches the 2f quorum (f=1).
        os.on_prepare(prepare.clone(), NodeName::from("n1"));
        let commit = match os.on_prepare(prepare, NodeName::from("n2")) {
            OrderingOutcome::ReachedPrepared(c) => c,
            other => panic!("expected ReachedPrepared, got {:?}", other),
        };
        os.on_commit(commit.clone(), NodeName::from("n0"), ThreePcKey::new(key.view_no(), PpSeqNo::ZERO));
        os.on_commit(commit.clone(), NodeName::from("n1"), ThreePcKey::new(key.view_no(), PpSeqNo::ZERO));
        match os.on_commit(commit, NodeName::from("n2"), ThreePcKey::new(key.view_no(), PpSeqNo::ZERO)) {
            OrderingOutcome::ReachedOrdered(ordered) => ordered,
            other => panic!("expected ReachedOrdered, got {:?}", other),
        }
    }

    #[test]
    fn full_three_phase_flow_reaches_ordered() {
        let shared = ready_instance(ViewNo::from(0));
        let mut os = OrderingService::new(2, 3, 120_000, PpSeqNo::FIRST);
        let req = Digest::from_data(b"req-1");
        let pp = os.propose(&shared, vec![req], 1_000, 1, roots(7));
        let ordered = full_flow(&mut os, &shared, pp);
        assert_eq!(ordered.req_idr, vec![req]);
    }

    #[test]
    fn pre_prepare_timestamp_is_recorded_even_when_discarded() {
        let shared = ready_instance(ViewNo::from(1));
        let mut os = OrderingService::new(2, 3, 120_000, PpSeqNo::FIRST);
        let mut pp = os.propose(&shared, vec![Digest::from_data(b"x")], 1_000, 1, roots(1));
        pp.view_no = ViewNo::from(0); // an old-view replay
        let key = pp.three_pc_key();
        let outcome = os.on_pre_prepare(pp, NodeName::from("primary"), &shared, 2_000, vec![], false, None);
        assert!(matches!(outcome, OrderingOutcome::Discarded(DiscardReason::OldView)));
        assert!(os.pre_prepare_tss.contains_key(&key));
    }

    #[test]
    fn pre_prepare_far_from_receiver_clock_raises_time_suspicion() {
        let shared = ready_instance(ViewNo::from(0));
        let mut os = OrderingService::new(2, 3, 1_000, PpSeqNo::FIRST);
        let pp = os.propose(&shared, vec![Digest::from_data(b"a")], 1_000, 1, roots(1));
        // first sighting of this (key, digest, sender): the reference
        // is this call's own now_ms, which is far past acceptable_deviation_ms
        // away from the claimed pp_time.
        let outcome = os.on_pre_prepare(pp, NodeName::from("primary"), &shared, 50_000, vec![], false, Some(roots(1)));
        assert!(matches!(outcome, OrderingOutcome::Suspicion(SuspicionCode::PprTimeWrong)));
    }

    #[test]
    fn replayed_pre_prepare_is_judged_against_its_original_arrival_time() {
        let shared = ready_instance(ViewNo::from(0));
        let mut os = OrderingService::new(2, 3, 1_000, PpSeqNo::FIRST);
        let pp = os.propose(&shared, vec![Digest::from_data(b"a")], 1_000, 1, roots(1));
        // original arrival close to the claimed pp_time: accepted.
        let first = os.on_pre_prepare(pp.clone(), NodeName::from("primary"), &shared, 1_200, vec![], false, Some(roots(1)));
        assert!(matches!(first, OrderingOutcome::PreparedLocally(_)));
        // a much later re-delivery of the exact same message must still
        // be judged against the original 1_200 arrival, not "now" —
        // otherwise mere passage of time while stashed would condemn it.
        let second = os.on_pre_prepare(pp, NodeName::from("primary"), &shared, 999_999, vec![], false, Some(roots(1)));
        assert!(matches!(second, OrderingOutcome::PreparedLocally(_)));
    }

    #[test]
    fn out_of_order_commit_is_stashed_until_its_turn() {
        let shared = ready_instance(ViewNo::from(0));
        let mut os = OrderingService::new(2, 3, 120_000, PpSeqNo::FIRST);
        let pp = os.propose(&shared, vec![Digest::from_data(b"a")], 1_000, 1, roots(1));
        let key = pp.three_pc_key();
        let commit = Commit { inst_id: InstId::MASTER, view_no: key.view_no(), pp_seq_no: key.pp_seq_no(), bls_sig: None };
        // preprepared exists, but last_ordered hasn't caught up to s-1 yet
        // since nothing has been ordered at (v,0) in this isolated test;
        // simulate a batch two ahead of the last ordered key.
        let future_key = ThreePcKey::new(key.view_no(), key.pp_seq_no().next());
        os.preprepared.insert(future_key, PrePrepare { pp_seq_no: future_key.pp_seq_no(), ..pp.clone() });
        let future_commit = Commit { inst_id: InstId::MASTER, view_no: future_key.view_no(), pp_seq_no: future_key.pp_seq_no(), bls_sig: None };
        let outcome = os.on_commit(future_commit, NodeName::from("n0"), ThreePcKey::new(key.view_no(), PpSeqNo::ZERO));
        assert!(matches!(outcome, OrderingOutcome::NothingYet));
        let _ = commit;
    }

    #[test]
    fn revert_unordered_batches_undoes_prepared_not_ordered() {
        let shared = ready_instance(ViewNo::from(0));
        let mut os = OrderingService::new(2, 3, 120_000, PpSeqNo::FIRST);
        let pp = os.propose(&shared, vec![Digest::from_data(b"a")], 1_000, 1, roots(1));
        let key = pp.three_pc_key();
        let outcome = os.on_pre_prepare(pp, NodeName::from("primary"), &shared, 1_000, vec![], false, Some(roots(7)));
        let prepare = match outcome {
            OrderingOutcome::PreparedLocally(p) => p,
            _ => panic!("expected PreparedLocally"),
        };
        os.on_prepare(prepare.clone(), NodeName::from("n1"));
        os.on_prepare(prepare, NodeName::from("n2"));
        assert!(os.prepared.contains(&key));
        let reverted = os.revert_unordered_batches();
        assert_eq!(reverted, vec![key]);
        assert!(!os.prepared.contains(&key));
    }

    #[test]
    fn gc_drops_entries_at_or_below_the_boundary() {
        let shared = ready_instance(ViewNo::from(0));
        let mut os = OrderingService::new(2, 3, 120_000, PpSeqNo::FIRST);
        let pp = os.propose(&shared, vec![Digest::from_data(b"a")], 1_000, 1, roots(1));
        let key = pp.three_pc_key();
        os.on_pre_prepare(pp, NodeName::from("primary"), &shared, 1_000, vec![], false, Some(roots(7)));
        assert!(os.preprepared.contains_key(&key));
        os.gc(key.pp_seq_no());
        assert!(!os.preprepared.contains_key(&key));
    }
}
