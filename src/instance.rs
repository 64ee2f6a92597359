//! Per-instance wiring: one protocol replica's `SharedData`, `Stasher`,
//! `OrderingService`, `CheckpointService` and `ViewChangeService`,
//! dispatched through the `Validator`'s decision table.
//!
//! Grounded on `replica_service.py`'s `ReplicaService.__init__`, which
//! threads one `ConsensusSharedData`/`StashingRouter` pair through the
//! three sub-services constructed alongside it. This crate's `Node`
//! (§2.1) owns an array of these, arena-style, with no back-pointers
//! (Design Note, "cyclic references").

use crate::checkpoint_service::{CheckpointOutcome, CheckpointService};
use crate::config::CoreConfig;
use crate::crypto::hash::Digest;
use crate::ids::{InstId, NodeName, PpSeqNo, ThreePcKey, ViewNo};
use crate::message::{
    Checkpoint, Commit, ConsensusMessage, InstanceChange, Ordered, Prepare, PrePrepare,
    SystemMessage, ViewChangeDone,
};
use crate::ordering_service::{OrderingOutcome, OrderingService, StagedRoots};
use crate::shared_data::{Mode, SharedData};
use crate::stasher::{StashKind, Stasher};
use crate::validator::DiscardReason;
use crate::view_change_service::{ViewChangeOutcome, ViewChangeService};

/// A message parked by the stasher, tagged with the sender so it can
/// be replayed through the same handler once whatever blocked it
/// clears.
#[derive(Debug, Clone)]
pub enum StashedMessage {
    Consensus(ConsensusMessage, NodeName),
    Checkpoint(Checkpoint, NodeName),
    InstanceChange(InstanceChange, NodeName),
    ViewChangeDone(ViewChangeDone, NodeName),
}

/// Everything an `Instance::on_*` call can ask its caller (`Node`) to
/// do: broadcast or unicast a wire message, publish an internal event,
/// or hand a freshly ordered batch to the executor. Kept as a flat
/// vector rather than invoking bus traits directly, so `Instance`
/// never needs generic parameters over the transport/executor
/// collaborators (§9, "global mutable state" / injected context).
#[derive(Debug, Clone)]
pub enum Effect {
    Broadcast(SystemMessage),
    Unicast(NodeName, SystemMessage),
    Internal(crate::bus::InternalEvent),
    Ordered(Ordered),
    /// The checkpoint ending at `end` just became stable: the caller
    /// must garbage-collect request-manager references for every
    /// digest in the freed batches and persist the new
    /// `last_sent_pp_seq_no` (§4.3, §6.1).
    CheckpointStable { end: PpSeqNo },
    /// A new view was installed with `primary` elected; the caller
    /// should reconcile catchup state and persist the primary history
    /// (§4.4 step 4, §6.1).
    ViewInstalled { view_no: ViewNo, primary: NodeName },
    /// A previously stashed PRE-PREPARE is unblocked and must be fed
    /// back through `on_pre_prepare` with freshly computed
    /// `missing`/`already_ordered`/`roots` inputs — only the caller has
    /// the request-manager and application collaborators needed to
    /// recompute them (§5.1).
    ReplayPrePrepare(PrePrepare, NodeName),
    /// `2f+1` matching `ViewChangeDone` gathered for `view_no`; the
    /// caller must run catchup rounds (`Instance::is_catchup_needed`)
    /// against `ledger_info` before calling `install_view` (§4.4 step
    /// 3, §4.5).
    ViewChangeDoneQuorum { view_no: ViewNo, ledger_info: Vec<crate::message::LedgerInfo> },
}

/// One protocol instance: master (inst 0) or a monitoring backup.
pub struct Instance {
    shared: SharedData,
    stasher: Stasher<StashedMessage>,
    ordering: OrderingService,
    checkpoint: CheckpointService,
    view_change: ViewChangeService,
    self_name: NodeName,
    log_size: u64,
    chk_freq: u64,
    /// The highest 3PC key reached `prepared` at the moment the
    /// current view change began, captured before
    /// `revert_unordered_batches` clears it, so this replica's own
    /// `ViewChangeDone` (built later, once the caller reacts to
    /// `InternalEvent::ViewChanged`) can still report it (§4.4 step 2).
    last_prepared_before_view_change: Option<ThreePcKey>,
}

impl Instance {
    pub fn new(
        inst_id: InstId,
        self_name: NodeName,
        validators: Vec<NodeName>,
        config: &CoreConfig,
        next_pp_seq_no: PpSeqNo,
    ) -> Self {
        Self {
            shared: SharedData::new(inst_id, config.log_size, config.primary_history_cap),
            stasher: Stasher::new(config.stasher_limit_per_kind),
            ordering: OrderingService::new(
                config.prepare_certificate_size(),
                config.quorum(),
                config.acceptable_deviation_pre_prepare.as_millis() as u64,
                next_pp_seq_no,
            ),
            checkpoint: CheckpointService::new(config.chk_freq, config.quorum()),
            view_change: ViewChangeService::new(
                config.f,
                config.quorum(),
                config.view_change_timeout,
                config.max_view_change_timeout,
                validators,
                config.catchup_retry_budget,
            ),
            self_name,
            log_size: config.log_size,
            chk_freq: config.chk_freq,
            last_prepared_before_view_change: None,
        }
    }

    pub fn inst_id(&self) -> InstId {
        self.shared.inst_id()
    }

    pub fn shared(&self) -> &SharedData {
        &self.shared
    }

    pub fn view_change_service(&self) -> &ViewChangeService {
        &self.view_change
    }

    pub fn mode(&self) -> Mode {
        self.shared.mode()
    }

    pub fn set_mode(&mut self, mode: Mode) -> Vec<Effect> {
        self.shared.set_mode(mode);
        self.replay_unblocked(StashKind::CatchingUp)
    }

    /// Whether this instance is the primary for its current view.
    pub fn is_primary(&self) -> bool {
        self.shared.primary_name() == Some(&self.self_name)
    }

    /// The next `PpSeqNo` this instance would propose next, restored
    /// across a restart (§6.1).
    pub fn next_pp_seq_no(&self) -> PpSeqNo {
        self.ordering.next_pp_seq_no()
    }

    pub fn restore_next_pp_seq_no(&mut self, value: PpSeqNo) {
        self.ordering.restore_next_pp_seq_no(value);
    }

    /// The highest 3PC key this instance had reached `prepared` for
    /// when the view change currently in progress began, if any
    /// (§4.4 step 2/3, §4.5 condition ii).
    pub fn last_prepared_before_view_change(&self) -> Option<ThreePcKey> {
        self.last_prepared_before_view_change
    }

    /// Whether the primary should emit a batch now (§4.2, "batch
    /// cutover"); delegates to the ordering service's own queue/timeout
    /// check.
    pub fn should_propose(&self, pending_len: usize, max_batch_size: usize, oldest_age_ms: Option<u64>, batch_timeout_ms: u64) -> bool {
        self.ordering.should_propose(pending_len, max_batch_size, oldest_age_ms, batch_timeout_ms)
    }

    pub fn view_no(&self) -> ViewNo {
        self.shared.view_no()
    }

    pub fn primary_for_view(&self, view_no: ViewNo) -> NodeName {
        self.view_change.primary_for_view(view_no)
    }

    /// The current timeout for the view-change round targeting
    /// `new_view`, doubled each time `escalate_view_change_timeout` is
    /// called without installing it (§4.4 Timeouts).
    pub fn current_view_change_timeout(&self, new_view: ViewNo) -> std::time::Duration {
        self.view_change.current_timeout(new_view)
    }

    pub fn escalate_view_change_timeout(&mut self, new_view: ViewNo) -> std::time::Duration {
        self.view_change.escalate_timeout(new_view)
    }

    /// Builds this replica's own `ViewChangeDone` vote for `new_view`,
    /// carrying its locally known ledger sizes/roots and the highest
    /// 3PC key it had reached `prepared` for before the view change
    /// began (§4.4 step 2).
    pub fn build_own_view_change_done(&self, new_view: ViewNo, ledger_info: Vec<crate::message::LedgerInfo>) -> ViewChangeDone {
        crate::view_change_service::build_view_change_done(
            new_view,
            self.self_name.clone(),
            ledger_info,
            self.last_prepared_before_view_change,
        )
    }

    /// §4.5: whether the caller must still run another catchup round
    /// before installing `new_view`.
    pub fn is_catchup_needed(
        &mut self,
        local_roots_match_quorum: bool,
        last_round_made_progress: bool,
        reached_last_prepared: bool,
    ) -> bool {
        self.view_change.is_catchup_needed(local_roots_match_quorum, last_round_made_progress, reached_last_prepared)
    }

    /// Assembles and records a PRE-PREPARE as this instance's primary.
    pub fn propose(
        &mut self,
        req_idr: Vec<Digest>,
        pp_time: u64,
        ledger_id: u64,
        roots: StagedRoots,
    ) -> PrePrepare {
        self.ordering.propose(&self.shared, req_idr, pp_time, ledger_id, roots)
    }

    /// Feeds an inbound PRE-PREPARE through classification and the
    /// ordering service. `missing`/`already_ordered`/`roots` are
    /// supplied by the caller (`Node`), which alone has access to the
    /// request manager and application collaborators (§5.1).
    #[allow(clippy::too_many_arguments)]
    pub fn on_pre_prepare(
        &mut self,
        pp: PrePrepare,
        from: NodeName,
        now_ms: u64,
        missing: Vec<Digest>,
        already_ordered: bool,
        roots: Option<StagedRoots>,
    ) -> Vec<Effect> {
        let outcome = self.ordering.on_pre_prepare(pp.clone(), from.clone(), &self.shared, now_ms, missing, already_ordered, roots);
        self.handle_ordering_outcome(outcome, ConsensusMessage::PrePrepare(pp), from)
    }

    pub fn on_prepare(&mut self, prepare: Prepare, from: NodeName) -> Vec<Effect> {
        let header = self.consensus_header(&ConsensusMessage::Prepare(prepare.clone()));
        match crate::validator::classify(&self.shared, &header) {
            crate::validator::Decision::Discard(reason) => return self.discard_effects(reason),
            crate::validator::Decision::Stash(kind) => {
                self.stasher.stash(kind, StashedMessage::Consensus(ConsensusMessage::Prepare(prepare), from));
                return Vec::new();
            }
            crate::validator::Decision::Process => {}
        }
        let outcome = self.ordering.on_prepare(prepare.clone(), from.clone());
        self.handle_ordering_outcome(outcome, ConsensusMessage::Prepare(prepare), from)
    }

    pub fn on_commit(&mut self, commit: Commit, from: NodeName) -> Vec<Effect> {
        let header = self.consensus_header(&ConsensusMessage::Commit(commit.clone()));
        match crate::validator::classify(&self.shared, &header) {
            crate::validator::Decision::Discard(reason) => return self.discard_effects(reason),
            crate::validator::Decision::Stash(kind) => {
                self.stasher.stash(kind, StashedMessage::Consensus(ConsensusMessage::Commit(commit), from));
                return Vec::new();
            }
            crate::validator::Decision::Process => {}
        }
        let last_ordered = self.shared.last_ordered_3pc();
        let outcome = self.ordering.on_commit(commit.clone(), from.clone(), last_ordered);
        let mut effects = self.handle_ordering_outcome(outcome, ConsensusMessage::Commit(commit), from);
        effects.extend(self.drain_in_order_commits());
        effects
    }

    /// After an `Ordered` emission, replays any COMMIT that had arrived
    /// for the immediately following sequence number and was held
    /// waiting its turn (§4.2, "Ordering of Ordered emissions").
    fn drain_in_order_commits(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        loop {
            let last_ordered = self.shared.last_ordered_3pc();
            let next = last_ordered.pp_seq_no().next();
            match self.ordering.take_next_stashed_commit(last_ordered.view_no(), next) {
                Some(commit) => {
                    let outcome = self.ordering.on_commit(commit.clone(), self.self_name.clone(), last_ordered);
                    effects.extend(self.handle_ordering_outcome(outcome, ConsensusMessage::Commit(commit), self.self_name.clone()));
                }
                None => break,
            }
        }
        effects
    }

    fn handle_ordering_outcome(&mut self, outcome: OrderingOutcome, original: ConsensusMessage, from: NodeName) -> Vec<Effect> {
        match outcome {
            OrderingOutcome::Discarded(reason) => self.discard_effects(reason),
            OrderingOutcome::Stashed(kind) => {
                self.stasher.stash(kind, StashedMessage::Consensus(original, from));
                Vec::new()
            }
            OrderingOutcome::AwaitingFinalisation(missing) => {
                self.stasher.stash(StashKind::NotYetFinalised, StashedMessage::Consensus(original, from));
                vec![Effect::Internal(crate::bus::InternalEvent::RequestPropagates(missing))]
            }
            OrderingOutcome::PreparedLocally(prepare) => {
                vec![Effect::Broadcast(SystemMessage::Consensus(ConsensusMessage::Prepare(prepare)))]
            }
            OrderingOutcome::ReachedPrepared(commit) => {
                vec![Effect::Broadcast(SystemMessage::Consensus(ConsensusMessage::Commit(commit)))]
            }
            OrderingOutcome::ReachedOrdered(ordered) => {
                self.shared.record_ordered(ThreePcKey::new(ordered.view_no, ordered.pp_seq_no));
                let digest = PrePrepare::compute_digest(&ordered.req_idr);
                let mut effects = vec![Effect::Ordered(ordered.clone())];
                if let Some(checkpoint) = self.checkpoint.on_batch_ordered(self.shared.inst_id(), ordered.view_no, digest, self.self_name.clone()) {
                    effects.push(Effect::Broadcast(SystemMessage::Checkpoint(checkpoint)));
                }
                effects
            }
            OrderingOutcome::Suspicion(code) => {
                let mut effects = vec![];
                if code.is_primary_attributable() {
                    let ic = self.view_change.on_suspicious_primary(self.shared.view_no(), code);
                    effects.push(Effect::Broadcast(SystemMessage::InstanceChange(ic)));
                }
                effects
            }
            OrderingOutcome::NothingYet => Vec::new(),
        }
    }

    pub fn on_checkpoint(&mut self, checkpoint: Checkpoint, from: NodeName) -> Vec<Effect> {
        let outcome = self.checkpoint.on_checkpoint(&self.shared, checkpoint.clone(), from.clone());
        match outcome {
            CheckpointOutcome::Discarded(reason) => self.discard_effects(reason),
            CheckpointOutcome::Stashed(kind) => {
                self.stasher.stash(kind, StashedMessage::Checkpoint(checkpoint, from));
                Vec::new()
            }
            CheckpointOutcome::NothingYet => Vec::new(),
            CheckpointOutcome::BecameStable { end, .. } => self.make_stable(end),
        }
    }

    /// Advances watermarks, garbage-collects 3PC state, and replays
    /// everything the stasher was holding only because it fell outside
    /// the old watermark window (§4.3).
    fn make_stable(&mut self, end: PpSeqNo) -> Vec<Effect> {
        self.shared.advance_watermarks(end, self.log_size);
        self.checkpoint.advance_stable(end);
        self.ordering.gc(end);
        let mut effects = vec![Effect::CheckpointStable { end }];
        effects.extend(self.replay_unblocked(StashKind::Watermarks));
        effects
    }

    pub fn on_instance_change(&mut self, instance_change: InstanceChange, from: NodeName) -> Vec<Effect> {
        match self.view_change.on_instance_change(&self.shared, instance_change, from) {
            ViewChangeOutcome::Discarded(reason) => self.discard_effects(reason),
            ViewChangeOutcome::Stashed(_) | ViewChangeOutcome::NothingYet => Vec::new(),
            ViewChangeOutcome::CommittedToViewChange { new_view } => {
                self.begin_view_change(new_view)
            }
            ViewChangeOutcome::GatheredQuorum { .. } => unreachable!("InstanceChange never gathers a VCD quorum"),
        }
    }

    /// §4.4 step 1: enters view-change mode, drops the primary,
    /// reverts prepared-but-unordered batches so staged state matches
    /// the last stable point, and asks the caller to begin catchup.
    fn begin_view_change(&mut self, new_view: ViewNo) -> Vec<Effect> {
        self.last_prepared_before_view_change = self.ordering.highest_prepared();
        self.shared.begin_view_change();
        self.ordering.revert_unordered_batches();
        vec![Effect::Internal(crate::bus::InternalEvent::NeedMasterCatchup), Effect::Internal(crate::bus::InternalEvent::ViewChanged { view_no: new_view })]
    }

    pub fn on_view_change_done(&mut self, vcd: ViewChangeDone, from: NodeName) -> Vec<Effect> {
        match self.view_change.on_view_change_done(vcd.clone(), from.clone()) {
            ViewChangeOutcome::Discarded(reason) => self.discard_effects(reason),
            ViewChangeOutcome::Stashed(kind) => {
                self.stasher.stash(kind, StashedMessage::ViewChangeDone(vcd, from));
                Vec::new()
            }
            ViewChangeOutcome::NothingYet => Vec::new(),
            ViewChangeOutcome::GatheredQuorum { new_view, ledger_info } => {
                vec![Effect::ViewChangeDoneQuorum { view_no: new_view, ledger_info }]
            }
            ViewChangeOutcome::CommittedToViewChange { .. } => unreachable!("ViewChangeDone never commits to a view change"),
        }
    }

    /// §4.4 step 4: installs the view once the caller's catchup loop
    /// has decided `is_catchup_needed()` no longer holds.
    pub fn install_view(&mut self, new_view: ViewNo) -> Vec<Effect> {
        let primary = self.view_change.install_view(&mut self.shared, new_view);
        self.shared.set_mode(Mode::Participating);
        self.last_prepared_before_view_change = None;
        let mut effects = vec![Effect::ViewInstalled { view_no: new_view, primary }];
        effects.extend(self.replay_unblocked(StashKind::FutureView));
        effects
    }

    fn consensus_header(&self, msg: &ConsensusMessage) -> crate::validator::MessageHeader {
        crate::validator::MessageHeader {
            inst_id: msg.inst_id(),
            view_no: msg.view_no(),
            pp_seq_no: Some(msg.three_pc_key().pp_seq_no()),
            checkpoint_seq_no_end: None,
        }
    }

    fn discard_effects(&self, _reason: DiscardReason) -> Vec<Effect> {
        Vec::new()
    }

    /// Drains and re-dispatches everything the stasher was holding
    /// under `kind`, now that whatever blocked it has cleared (§4.1).
    fn replay_unblocked(&mut self, kind: StashKind) -> Vec<Effect> {
        let entries = self.stasher.replay(kind);
        let mut effects = Vec::new();
        for entry in entries {
            effects.extend(self.redispatch(entry));
        }
        effects
    }

    fn redispatch(&mut self, entry: StashedMessage) -> Vec<Effect> {
        match entry {
            StashedMessage::Consensus(ConsensusMessage::Prepare(p), from) => self.on_prepare(p, from),
            StashedMessage::Consensus(ConsensusMessage::Commit(c), from) => self.on_commit(c, from),
            StashedMessage::Consensus(ConsensusMessage::PrePrepare(pp), from) => {
                vec![Effect::ReplayPrePrepare(pp, from)]
            }
            StashedMessage::Checkpoint(c, from) => self.on_checkpoint(c, from),
            StashedMessage::InstanceChange(ic, from) => self.on_instance_change(ic, from),
            StashedMessage::ViewChangeDone(vcd, from) => self.on_view_change_done(vcd, from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CoreConfig {
        CoreConfig { n: 4, f: 1, log_size: 10, chk_freq: 10, ..Default::default() }
    }

    fn validators() -> Vec<NodeName> {
        vec![NodeName::from("n0"), NodeName::from("n1"), NodeName::from("n2"), NodeName::from("n3")]
    }

    fn make_instance(name: &str) -> Instance {
        let mut inst = Instance::new(InstId::MASTER, NodeName::from(name), validators(), &cfg(), PpSeqNo::FIRST);
        inst.view_change.install_view(&mut inst.shared, ViewNo::from(0));
        inst.set_mode(Mode::Participating);
        inst
    }

    fn roots(tag: u8) -> StagedRoots {
        let d = Digest::from_data(&[tag]);
        StagedRoots { state_root: d, txn_root: d, pool_state_root: d, audit_txn_root: d }
    }

    #[test]
    fn pre_prepare_then_two_prepares_reaches_commit() {
        let mut primary = make_instance("n0");
        assert!(primary.is_primary());
        let pp = primary.propose(vec![Digest::from_data(b"r1")], 1_000, 1, roots(1));

        let mut backup = make_instance("n1");
        let effects = backup.on_pre_prepare(pp.clone(), NodeName::from("n0"), 1_000, vec![], false, Some(roots(1)));
        assert!(matches!(effects.as_slice(), [Effect::Broadcast(SystemMessage::Consensus(ConsensusMessage::Prepare(_)))]));

        let prepare = match &effects[0] {
            Effect::Broadcast(SystemMessage::Consensus(ConsensusMessage::Prepare(p))) => p.clone(),
            _ => unreachable!(),
        };
        backup.on_prepare(prepare.clone(), NodeName::from("n2"));
        let effects = backup.on_prepare(prepare, NodeName::from("n3"));
        assert!(matches!(effects.as_slice(), [Effect::Broadcast(SystemMessage::Consensus(ConsensusMessage::Commit(_)))]));
    }

    #[test]
    fn prepare_is_stashed_while_view_change_in_progress() {
        let mut backup = Instance::new(InstId::MASTER, NodeName::from("n1"), validators(), &cfg(), PpSeqNo::FIRST);
        backup.set_mode(Mode::Participating);
        // still view_change_in_progress (no install_view called): any
        // 3PC message must stash under FutureView.
        let prepare = Prepare {
            inst_id: InstId::MASTER,
            view_no: ViewNo::from(0),
            pp_seq_no: PpSeqNo::FIRST,
            digest: Digest::from_data(b"x"),
            state_root: Digest::from_data(b"x"),
            txn_root: Digest::from_data(b"x"),
            bls_sig: None,
        };
        let effects = backup.on_prepare(prepare, NodeName::from("n0"));
        assert!(effects.is_empty());
        assert_eq!(backup.stasher.len(StashKind::FutureView), 1);
    }
}
