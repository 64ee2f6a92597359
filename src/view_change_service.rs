//! Primary-loss detection, view-change voting, and new-view
//! installation (§4.4), plus the catchup-gating predicate the core
//! drives during a view change (§4.5).
//!
//! The teacher (`bafomet`) has no view-change module of its own — its
//! `cst` module only covers state transfer (catchup) for a replica
//! that already knows its view. This service is grounded on the
//! original's `ViewChangeService` (named alongside `OrderingService`/
//! `CheckpointService` in `replica_service.py`'s constructor) and
//! follows the classic-PBFT protocol the design body spells out
//! directly, shaped with the teacher's `poll`/outcome-enum idiom
//! (`consensus::mod`'s `ConsensusPollStatus`) rather than the
//! original's callback style.

use std::time::Duration;

use crate::collections::{hash_map, hash_set, HashMap, HashSet};
use crate::ids::{NodeName, ThreePcKey, ViewNo};
use crate::message::{InstanceChange, InstanceChangeReason, LedgerInfo, SuspicionCode, ViewChangeDone};
use crate::shared_data::SharedData;
use crate::stasher::StashKind;
use crate::validator::DiscardReason;

/// Result of feeding a view-change protocol message through the
/// service.
#[derive(Debug, Clone)]
pub enum ViewChangeOutcome {
    Discarded(DiscardReason),
    Stashed(StashKind),
    NothingYet,
    /// `f+1` matching `InstanceChange(new_view)` gathered: commit to
    /// the view change (§4.4 step 1). The caller must mark
    /// `view_change_in_progress`, drop primaries, revert unordered
    /// batches in every instance, and begin catchup.
    CommittedToViewChange { new_view: ViewNo },
    /// `2f+1` matching `ViewChangeDone` gathered for `new_view` (§4.4
    /// step 3). The caller now runs catchup rounds (via
    /// `is_catchup_needed`) before installing the view.
    GatheredQuorum { new_view: ViewNo, ledger_info: Vec<LedgerInfo> },
}

struct ViewChangeRound {
    instance_change_votes: HashSet<NodeName>,
    done_votes: HashMap<NodeName, ViewChangeDone>,
    committed: bool,
    quorum_reported: bool,
    timeout: Duration,
}

impl ViewChangeRound {
    fn new(initial_timeout: Duration) -> Self {
        Self {
            instance_change_votes: hash_set(),
            done_votes: hash_map(),
            committed: false,
            quorum_reported: false,
            timeout: initial_timeout,
        }
    }
}

/// Per-instance view-change bookkeeping.
pub struct ViewChangeService {
    f: usize,
    quorum: usize,
    view_change_timeout: Duration,
    max_view_change_timeout: Duration,
    /// The pool-ordered validator list, used to select the primary of
    /// a newly installed view deterministically (§4.4 step 4).
    validators: Vec<NodeName>,
    rounds: HashMap<ViewNo, ViewChangeRound>,
    catchup_retries_left: usize,
    catchup_retry_budget: usize,
}

impl ViewChangeService {
    pub fn new(
        f: usize,
        quorum: usize,
        view_change_timeout: Duration,
        max_view_change_timeout: Duration,
        validators: Vec<NodeName>,
        catchup_retry_budget: usize,
    ) -> Self {
        Self {
            f,
            quorum,
            view_change_timeout,
            max_view_change_timeout,
            validators,
            rounds: hash_map(),
            catchup_retries_left: catchup_retry_budget,
            catchup_retry_budget,
        }
    }

    /// Deterministically selects the primary for `view_no`:
    /// `validators[view_no mod n]` (§4.4 step 4).
    pub fn primary_for_view(&self, view_no: ViewNo) -> NodeName {
        let n = self.validators.len();
        let index = (u64::from(view_no) as usize) % n;
        self.validators[index].clone()
    }

    /// A structured accusation against the primary (§7 Suspicion). The
    /// caller broadcasts the `InstanceChange` this returns and feeds
    /// it back through `on_instance_change` for its own vote, matching
    /// how every other InstanceChange sender is counted.
    pub fn on_suspicious_primary(&self, current_view: ViewNo, code: SuspicionCode) -> InstanceChange {
        debug_assert!(code.is_primary_attributable());
        InstanceChange { view_no: current_view.next(), reason: InstanceChangeReason::Suspicion(code) }
    }

    /// Handles an inbound `InstanceChange`. `f+1` distinct senders
    /// naming the same `new_view` (the reason need not match — any
    /// node can have its own trigger) commits this replica to the
    /// view change.
    pub fn on_instance_change(
        &mut self,
        shared: &SharedData,
        instance_change: InstanceChange,
        from: NodeName,
    ) -> ViewChangeOutcome {
        // InstanceChange targets the *prospective* next view, which is
        // always ahead of the currently installed one while no change
        // is underway; only reject it as stale if we've already moved
        // past it.
        if instance_change.view_no <= shared.view_no() && !shared.view_change_in_progress() {
            return ViewChangeOutcome::Discarded(DiscardReason::OldView);
        }

        let new_view = instance_change.view_no;
        let round = self
            .rounds
            .entry(new_view)
            .or_insert_with(|| ViewChangeRound::new(self.view_change_timeout));
        round.instance_change_votes.insert(from);

        if !round.committed && round.instance_change_votes.len() >= self.f + 1 {
            round.committed = true;
            return ViewChangeOutcome::CommittedToViewChange { new_view };
        }
        ViewChangeOutcome::NothingYet
    }

    /// Handles an inbound `ViewChangeDone` for a view change already
    /// committed to locally.
    pub fn on_view_change_done(&mut self, vcd: ViewChangeDone, from: NodeName) -> ViewChangeOutcome {
        let new_view = vcd.view_no;
        let round = match self.rounds.get_mut(&new_view) {
            Some(r) if r.committed => r,
            _ => return ViewChangeOutcome::Stashed(StashKind::FutureView),
        };
        round.done_votes.insert(from, vcd);
        if round.quorum_reported || round.done_votes.len() < self.quorum {
            return ViewChangeOutcome::NothingYet;
        }
        round.quorum_reported = true;
        let ledger_info = Self::merge_ledger_info(round.done_votes.values());
        ViewChangeOutcome::GatheredQuorum { new_view, ledger_info }
    }

    /// Picks, per ledger, the highest `(size, root)` reported across
    /// the quorum's `ViewChangeDone` messages — the furthest-ahead
    /// state the core must catch up to before installing the view
    /// (§4.4 step 3, §4.5 condition i).
    fn merge_ledger_info<'a, I: Iterator<Item = &'a ViewChangeDone>>(votes: I) -> Vec<LedgerInfo> {
        let mut by_ledger: HashMap<u64, LedgerInfo> = hash_map();
        for vcd in votes {
            for info in &vcd.ledger_info {
                by_ledger
                    .entry(info.ledger_id)
                    .and_modify(|best| {
                        if info.size > best.size {
                            *best = info.clone();
                        }
                    })
                    .or_insert_with(|| info.clone());
            }
        }
        let mut merged: Vec<LedgerInfo> = by_ledger.into_values().collect();
        merged.sort_by_key(|info| info.ledger_id);
        merged
    }

    /// Whether the core must still demand catchup rounds before
    /// installing `new_view` (§4.5). Checked as a chain, the quorum's
    /// ledger roots being reproduced locally ends it outright; failing
    /// that, having made no further progress while already reaching
    /// `last_prepared_before_view_change` also ends it; only once both
    /// of those are ruled out does the retry budget get to act as the
    /// final backstop, so a replica whose roots never converge cannot
    /// loop forever.
    pub fn is_catchup_needed(
        &mut self,
        local_roots_match_quorum: bool,
        last_round_made_progress: bool,
        reached_last_prepared: bool,
    ) -> bool {
        if local_roots_match_quorum {
            return false;
        }
        if !last_round_made_progress && reached_last_prepared {
            return false;
        }
        if self.catchup_retries_left == 0 {
            return false;
        }
        self.catchup_retries_left -= 1;
        true
    }

    /// Resets the retry budget, done once catchup for a view change
    /// concludes (whether by success or by exhausting the budget).
    pub fn reset_catchup_budget(&mut self) {
        self.catchup_retries_left = self.catchup_retry_budget;
    }

    /// Installs `new_view`, returning the elected primary. Clears the
    /// round's bookkeeping; stale rounds for earlier prospective views
    /// are dropped too, since they can never commit now.
    pub fn install_view(&mut self, shared: &mut SharedData, new_view: ViewNo) -> NodeName {
        let primary = self.primary_for_view(new_view);
        shared.install_view(new_view, primary.clone());
        self.rounds.retain(|view, _| *view > new_view);
        self.reset_catchup_budget();
        primary
    }

    /// The next, doubled timeout for a view change that failed to
    /// install within its current one (§4.4 Timeouts), saturating at
    /// `max_view_change_timeout`.
    pub fn escalate_timeout(&mut self, new_view: ViewNo) -> Duration {
        let round = self
            .rounds
            .entry(new_view)
            .or_insert_with(|| ViewChangeRound::new(self.view_change_timeout));
        let doubled = round.timeout.saturating_mul(2);
        round.timeout = doubled.min(self.max_view_change_timeout);
        round.timeout
    }

    pub fn current_timeout(&self, new_view: ViewNo) -> Duration {
        self.rounds
            .get(&new_view)
            .map(|r| r.timeout)
            .unwrap_or(self.view_change_timeout)
    }
}

/// `last_prepared_before_view_change`: the highest 3PC key this
/// replica had reached *prepared* status for (but not necessarily
/// ordered) at the moment the view change began (§4.4 step 2).
/// Computed by the caller from `OrderingService`'s own bookkeeping and
/// passed through here only for the `ViewChangeDone` it builds.
pub fn build_view_change_done(
    new_view: ViewNo,
    name: NodeName,
    ledger_info: Vec<LedgerInfo>,
    last_prepared: Option<ThreePcKey>,
) -> ViewChangeDone {
    ViewChangeDone { view_no: new_view, name, ledger_info, last_prepared }
}
