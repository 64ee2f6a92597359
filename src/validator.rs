//! Pure message classification.
//!
//! Grounded on §4.1/§4.1.1 and pinned against the precedence exercised
//! by `test_checkpoint_validation.py`: a sequence of early returns,
//! not a lookup table, so the exact order (instance, then view, then
//! mode, then message-kind-specific checks) is visible at the call
//! site rather than encoded in data (Design Note, "dynamic dispatch
//! over message types").

use crate::ids::{InstId, PpSeqNo, ViewNo};
use crate::shared_data::SharedData;
use crate::stasher::StashKind;

/// What to do with an inbound, instance-scoped message.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Decision {
    Process,
    Discard(DiscardReason),
    Stash(StashKind),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DiscardReason {
    IncorrectInstance,
    OldView,
    AlreadyStable,
}

/// The subset of a message's fields the classifier needs. Every
/// inbound message kind reduces to this before classification, so the
/// table is written once rather than once per message type.
#[derive(Debug, Copy, Clone)]
pub struct MessageHeader {
    pub inst_id: InstId,
    pub view_no: ViewNo,
    /// `Some` only for 3PC messages (PrePrepare/Prepare/Commit), whose
    /// watermark window applies.
    pub pp_seq_no: Option<PpSeqNo>,
    /// `Some` only for Checkpoint messages, whose `seq_no_end` is
    /// compared against the stable watermark.
    pub checkpoint_seq_no_end: Option<PpSeqNo>,
}

/// Classifies `header` against `shared` using the exact precedence
/// pinned by §4.1.1: instance mismatch, then view (old beats future;
/// an in-progress view change collapses to the future-view outcome),
/// then catching-up mode, then message-kind-specific checks.
pub fn classify(shared: &SharedData, header: &MessageHeader) -> Decision {
    if header.inst_id != shared.inst_id() {
        return Decision::Discard(DiscardReason::IncorrectInstance);
    }

    if header.view_no < shared.view_no() {
        return Decision::Discard(DiscardReason::OldView);
    }
    if header.view_no > shared.view_no() || shared.view_change_in_progress() {
        return Decision::Stash(StashKind::FutureView);
    }

    if !shared.mode().is_caught_up() {
        return Decision::Stash(StashKind::CatchingUp);
    }

    if let Some(seq_no_end) = header.checkpoint_seq_no_end {
        let (low, _high) = shared.watermarks();
        if seq_no_end <= low {
            return Decision::Discard(DiscardReason::AlreadyStable);
        }
    }

    if let Some(pp_seq_no) = header.pp_seq_no {
        if !shared.within_watermarks(pp_seq_no) {
            return Decision::Stash(StashKind::Watermarks);
        }
    }

    Decision::Process
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::NodeName;

    fn header(inst_id: InstId, view_no: ViewNo) -> MessageHeader {
        MessageHeader { inst_id, view_no, pp_seq_no: None, checkpoint_seq_no_end: None }
    }

    fn participating(view_no: ViewNo) -> SharedData {
        let mut sd = SharedData::new(InstId::MASTER, 10, 4);
        sd.install_view(view_no, NodeName::from("n0"));
        sd.set_mode(crate::shared_data::Mode::Participating);
        sd
    }

    #[test]
    fn wrong_instance_is_discarded_first() {
        let sd = participating(ViewNo::from(1));
        let h = header(InstId::from(1), ViewNo::from(0));
        assert_eq!(
            classify(&sd, &h),
            Decision::Discard(DiscardReason::IncorrectInstance)
        );
    }

    #[test]
    fn old_view_beats_future_view() {
        let sd = participating(ViewNo::from(2));
        let h = header(InstId::MASTER, ViewNo::from(1));
        assert_eq!(classify(&sd, &h), Decision::Discard(DiscardReason::OldView));
    }

    #[test]
    fn future_view_is_stashed() {
        let sd = participating(ViewNo::from(1));
        let h = header(InstId::MASTER, ViewNo::from(2));
        assert_eq!(classify(&sd, &h), Decision::Stash(StashKind::FutureView));
    }

    #[test]
    fn in_progress_view_change_collapses_to_future_view_outcome() {
        let mut sd = participating(ViewNo::from(1));
        sd.begin_view_change();
        let h = header(InstId::MASTER, ViewNo::from(1));
        assert_eq!(classify(&sd, &h), Decision::Stash(StashKind::FutureView));
    }

    #[test]
    fn catching_up_mode_stashes_with_dedicated_kind() {
        let mut sd = participating(ViewNo::from(1));
        sd.set_mode(crate::shared_data::Mode::Syncing);
        let h = header(InstId::MASTER, ViewNo::from(1));
        assert_eq!(classify(&sd, &h), Decision::Stash(StashKind::CatchingUp));
    }

    #[test]
    fn checkpoint_at_or_below_stable_watermark_is_already_stable() {
        let mut sd = participating(ViewNo::from(1));
        sd.advance_watermarks(PpSeqNo::from(10), 10);
        let mut h = header(InstId::MASTER, ViewNo::from(1));
        h.checkpoint_seq_no_end = Some(PpSeqNo::from(10));
        assert_eq!(classify(&sd, &h), Decision::Discard(DiscardReason::AlreadyStable));
    }

    #[test]
    fn three_pc_outside_watermarks_is_stashed() {
        let sd = participating(ViewNo::from(1));
        let mut h = header(InstId::MASTER, ViewNo::from(1));
        h.pp_seq_no = Some(PpSeqNo::from(11));
        assert_eq!(classify(&sd, &h), Decision::Stash(StashKind::Watermarks));
    }

    #[test]
    fn otherwise_process() {
        let sd = participating(ViewNo::from(1));
        let mut h = header(InstId::MASTER, ViewNo::from(1));
        h.pp_seq_no = Some(PpSeqNo::from(5));
        assert_eq!(classify(&sd, &h), Decision::Process);
    }
}
