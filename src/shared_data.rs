//! Per-instance shared state.
//!
//! Grounded on the teacher's `log::mod` (which keeps watermarks and
//! checkpoint state alongside the decision log) and on
//! `replica_service.py`'s `ConsensusSharedData`, the single struct
//! every sub-service reads and exactly one of them mutates per event
//! (§5, "Shared resource policy"). All the invariants of §3
//! ("SharedData invariants") are enforced by the methods here rather
//! than left to callers to maintain by convention.

use crate::ids::{InstId, NodeName, PpSeqNo, ThreePcKey, ViewNo};

/// Where a replica is in the startup/catchup lifecycle. Only
/// `Participating` may order new requests (§3).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Mode {
    Starting,
    Discovering,
    Discovered,
    Syncing,
    Synced,
    Participating,
}

impl Mode {
    /// Whether a 3PC message may be processed rather than stashed for
    /// "catching up" (§4.1 decision table: `mode ∉ {Synced, Participating}`).
    pub fn is_caught_up(self) -> bool {
        matches!(self, Mode::Synced | Mode::Participating)
    }
}

/// The state one protocol instance threads through its Validator,
/// Stasher, OrderingService, CheckpointService and ViewChangeService.
#[derive(Debug, Clone)]
pub struct SharedData {
    inst_id: InstId,
    view_no: ViewNo,
    /// `None` only while `view_change_in_progress` (§3 invariant).
    primary_name: Option<NodeName>,
    view_change_in_progress: bool,
    mode: Mode,
    low_watermark: PpSeqNo,
    high_watermark: PpSeqNo,
    last_ordered_3pc: ThreePcKey,
    /// Bounded ring buffer of `(view_no, primary_name)`, one entry per
    /// successful new-view install (§4.4.1).
    primary_history: Vec<(ViewNo, NodeName)>,
    primary_history_cap: usize,
}

impl SharedData {
    pub fn new(inst_id: InstId, log_size: u64, primary_history_cap: usize) -> Self {
        Self {
            inst_id,
            view_no: ViewNo::ZERO,
            primary_name: None,
            view_change_in_progress: true,
            mode: Mode::Starting,
            low_watermark: PpSeqNo::ZERO,
            high_watermark: PpSeqNo::from(log_size),
            last_ordered_3pc: ThreePcKey::new(ViewNo::ZERO, PpSeqNo::ZERO),
            primary_history: Vec::new(),
            primary_history_cap,
        }
    }

    pub fn inst_id(&self) -> InstId {
        self.inst_id
    }

    pub fn view_no(&self) -> ViewNo {
        self.view_no
    }

    pub fn primary_name(&self) -> Option<&NodeName> {
        self.primary_name.as_ref()
    }

    pub fn view_change_in_progress(&self) -> bool {
        self.view_change_in_progress
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    pub fn watermarks(&self) -> (PpSeqNo, PpSeqNo) {
        (self.low_watermark, self.high_watermark)
    }

    pub fn last_ordered_3pc(&self) -> ThreePcKey {
        self.last_ordered_3pc
    }

    /// Per the Design Note on view mutation: the view number changes
    /// only through this state machine, never through a bare setter.
    /// Call sites are the view-change protocol exclusively.
    pub fn begin_view_change(&mut self) {
        self.view_change_in_progress = true;
        self.primary_name = None;
    }

    /// Installs `new_view` with `primary` elected for it, advancing
    /// the primary-name history and resetting `last_ordered_3pc` to
    /// `(new_view, 0)` (§3 invariant).
    pub fn install_view(&mut self, new_view: ViewNo, primary: NodeName) {
        self.view_no = new_view;
        self.view_change_in_progress = false;
        self.record_primary(new_view, primary.clone());
        self.primary_name = Some(primary);
        self.last_ordered_3pc = ThreePcKey::new(new_view, PpSeqNo::ZERO);
    }

    fn record_primary(&mut self, view_no: ViewNo, name: NodeName) {
        if self.primary_history.iter().any(|(v, _)| *v == view_no) {
            return;
        }
        self.primary_history.push((view_no, name));
        if self.primary_history.len() > self.primary_history_cap {
            self.primary_history.remove(0);
        }
    }

    pub fn primary_history(&self) -> &[(ViewNo, NodeName)] {
        &self.primary_history
    }

    /// Whether `pp_seq_no` falls in the legal `(low, high]` window
    /// (§3 "Watermarks").
    pub fn within_watermarks(&self, pp_seq_no: PpSeqNo) -> bool {
        pp_seq_no > self.low_watermark && pp_seq_no <= self.high_watermark
    }

    /// Advances watermarks on checkpoint stability: `low ← end`,
    /// `high ← end + LOG_SIZE` (§4.3).
    pub fn advance_watermarks(&mut self, end: PpSeqNo, log_size: u64) {
        self.low_watermark = end;
        self.high_watermark = PpSeqNo::from(u64::from(end) + log_size);
    }

    /// Records a freshly ordered 3PC key; must be monotonically
    /// non-decreasing (§3 invariant), enforced with a debug assertion
    /// since a violation here is a fatal bug, not Byzantine input.
    pub fn record_ordered(&mut self, key: ThreePcKey) {
        debug_assert!(key >= self.last_ordered_3pc, "last_ordered_3pc must be non-decreasing");
        self.last_ordered_3pc = key;
    }
}
