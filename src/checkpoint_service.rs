//! Stable-checkpoint agreement, watermark advance, and 3PC garbage
//! collection.
//!
//! Grounded on the teacher's `log::mod` (`Checkpoint<S>`,
//! `CheckpointState`, `begin_checkpoint`/`finalize_checkpoint`) for the
//! shape of a checkpoint's lifecycle, and on the original's
//! `CheckpointService` (named in `replica_service.py`'s constructor,
//! sibling to `OrderingService`/`ViewChangeService`) plus
//! `test_checkpoint_validation.py` for the exact stability and
//! discard rules (§4.3).

use crate::collections::{hash_map, hash_set, HashMap, HashSet};
use crate::crypto::hash::{fold_digests, Digest};
use crate::ids::{NodeName, PpSeqNo, ViewNo};
use crate::message::Checkpoint;
use crate::stasher::StashKind;
use crate::validator::{self, Decision, DiscardReason, MessageHeader};
use crate::shared_data::SharedData;

/// Result of feeding a `Checkpoint` message through the service.
#[derive(Debug, Clone)]
pub enum CheckpointOutcome {
    Discarded(DiscardReason),
    Stashed(StashKind),
    /// A vote was recorded but `2f+1` matching votes haven't gathered yet.
    NothingYet,
    /// `2f+1` votes for `(start, end, digest)` gathered from distinct
    /// nodes: the checkpoint is now stable. The caller must advance
    /// watermarks, garbage-collect 3PC state at or below `end`, and
    /// notify the stasher to replay watermark-stashed messages (§4.3).
    BecameStable { start: PpSeqNo, end: PpSeqNo, digest: Digest },
}

/// The key identifying one candidate checkpoint: the range it covers
/// plus its claimed digest, since two nodes may disagree on the
/// digest for the same range (scenario S5).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
struct CheckpointKey {
    start: PpSeqNo,
    end: PpSeqNo,
    digest: Digest,
}

/// Per-instance checkpoint bookkeeping: emission cadence, the stable
/// point, and vote tallies for checkpoints not yet decided.
pub struct CheckpointService {
    chk_freq: u64,
    quorum: usize,
    /// `seq_no_end` of the last stable checkpoint; `0` if none yet.
    stable_end: PpSeqNo,
    votes: HashMap<CheckpointKey, HashSet<NodeName>>,
    /// Digests of every batch ordered since the last stable checkpoint,
    /// in order, folded into the next checkpoint's digest (§3,
    /// "Checkpoint... digest is a Merkle-like hash over the batches
    /// within the range").
    pending_batch_digests: Vec<Digest>,
}

impl CheckpointService {
    pub fn new(chk_freq: u64, quorum: usize) -> Self {
        Self {
            chk_freq,
            quorum,
            stable_end: PpSeqNo::ZERO,
            votes: hash_map(),
            pending_batch_digests: Vec::new(),
        }
    }

    pub fn stable_end(&self) -> PpSeqNo {
        self.stable_end
    }

    /// Records a freshly ordered batch's digest; once `chk_freq`
    /// batches have accumulated since the last stable point, returns
    /// the `Checkpoint` this instance should broadcast and vote for
    /// itself.
    pub fn on_batch_ordered(&mut self, inst_id: crate::ids::InstId, view_no: ViewNo, digest: Digest, self_name: NodeName) -> Option<Checkpoint> {
        self.pending_batch_digests.push(digest);
        if (self.pending_batch_digests.len() as u64) < self.chk_freq {
            return None;
        }
        let start = self.stable_end;
        let end = PpSeqNo::from(u64::from(start) + self.chk_freq);
        let chk_digest = fold_digests(&self.pending_batch_digests);
        self.pending_batch_digests.clear();
        let checkpoint = Checkpoint { inst_id, view_no, seq_no_start: start, seq_no_end: end, digest: chk_digest };
        self.vote(&checkpoint, self_name);
        Some(checkpoint)
    }

    /// Classifies and, if eligible, tallies an inbound CHECKPOINT.
    pub fn on_checkpoint(&mut self, shared: &SharedData, checkpoint: Checkpoint, from: NodeName) -> CheckpointOutcome {
        let header = MessageHeader {
            inst_id: checkpoint.inst_id,
            view_no: checkpoint.view_no,
            pp_seq_no: None,
            checkpoint_seq_no_end: Some(checkpoint.seq_no_end),
        };
        match validator::classify(shared, &header) {
            Decision::Discard(reason) => return CheckpointOutcome::Discarded(reason),
            Decision::Stash(kind) => return CheckpointOutcome::Stashed(kind),
            Decision::Process => {}
        }

        let start = checkpoint.seq_no_start;
        let end = checkpoint.seq_no_end;
        let digest = checkpoint.digest;
        let count = self.vote(&checkpoint, from);
        if count >= self.quorum {
            CheckpointOutcome::BecameStable { start, end, digest }
        } else {
            CheckpointOutcome::NothingYet
        }
    }

    fn vote(&mut self, checkpoint: &Checkpoint, from: NodeName) -> usize {
        let key = CheckpointKey {
            start: checkpoint.seq_no_start,
            end: checkpoint.seq_no_end,
            digest: checkpoint.digest,
        };
        let senders = self.votes.entry(key).or_insert_with(hash_set);
        senders.insert(from);
        senders.len()
    }

    /// Marks `end` as the new stable boundary and forgets every vote
    /// tally at or below it, including competing (and thus now moot)
    /// digests for the same range (scenario S5).
    pub fn advance_stable(&mut self, end: PpSeqNo) {
        self.stable_end = end;
        self.votes.retain(|key, _| key.end > end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::InstId;

    fn participating(view_no: ViewNo) -> SharedData {
        let mut sd = SharedData::new(InstId::MASTER, 10, 4);
        sd.install_view(view_no, NodeName::from("n0"));
        sd.set_mode(crate::shared_data::Mode::Participating);
        sd
    }

    fn sample(start: u64, end: u64, tag: u8) -> Checkpoint {
        Checkpoint {
            inst_id: InstId::MASTER,
            view_no: ViewNo::from(0),
            seq_no_start: PpSeqNo::from(start),
            seq_no_end: PpSeqNo::from(end),
            digest: Digest::from_data(&[tag]),
        }
    }

    #[test]
    fn emits_a_checkpoint_every_chk_freq_batches() {
        let mut cs = CheckpointService::new(2, 3);
        assert!(cs.on_batch_ordered(InstId::MASTER, ViewNo::from(0), Digest::from_data(b"a"), NodeName::from("n0")).is_none());
        let chk = cs.on_batch_ordered(InstId::MASTER, ViewNo::from(0), Digest::from_data(b"b"), NodeName::from("n0"));
        assert!(chk.is_some());
        assert_eq!(chk.unwrap().seq_no_end, PpSeqNo::from(10));
    }

    #[test]
    fn becomes_stable_at_quorum_matching_votes() {
        let shared = participating(ViewNo::from(0));
        let mut cs = CheckpointService::new(10, 3);
        let chk = sample(0, 10, 1);
        assert!(matches!(cs.on_checkpoint(&shared, chk.clone(), NodeName::from("n0")), CheckpointOutcome::NothingYet));
        assert!(matches!(cs.on_checkpoint(&shared, chk.clone(), NodeName::from("n1")), CheckpointOutcome::NothingYet));
        let outcome = cs.on_checkpoint(&shared, chk, NodeName::from("n2"));
        assert!(matches!(outcome, CheckpointOutcome::BecameStable { end, .. } if end == PpSeqNo::from(10)));
    }

    #[test]
    fn competing_digests_do_not_contribute_to_each_others_quorum() {
        let shared = participating(ViewNo::from(0));
        let mut cs = CheckpointService::new(10, 3);
        let honest = sample(0, 10, 1);
        let byzantine = sample(0, 10, 2);
        cs.on_checkpoint(&shared, honest.clone(), NodeName::from("n0"));
        cs.on_checkpoint(&shared, honest, NodeName::from("n1"));
        let outcome = cs.on_checkpoint(&shared, byzantine, NodeName::from("n2"));
        assert!(matches!(outcome, CheckpointOutcome::NothingYet));
    }

    #[test]
    fn checkpoint_at_or_below_stable_is_discarded() {
        let shared = participating(ViewNo::from(0));
        let mut cs = CheckpointService::new(10, 3);
        cs.advance_stable(PpSeqNo::from(10));
        // SharedData's own watermark tracking is advanced separately by
        // the instance wiring; here we simulate its effect directly.
        let mut shared = shared;
        shared.advance_watermarks(PpSeqNo::from(10), 10);
        let chk = sample(0, 10, 1);
        let outcome = cs.on_checkpoint(&shared, chk, NodeName::from("n0"));
        assert!(matches!(outcome, CheckpointOutcome::Discarded(DiscardReason::AlreadyStable)));
    }

    #[test]
    fn advancing_stable_drops_competing_vote_tallies() {
        let mut cs = CheckpointService::new(10, 3);
        let shared = participating(ViewNo::from(0));
        let honest = sample(0, 10, 1);
        cs.on_checkpoint(&shared, honest.clone(), NodeName::from("n0"));
        cs.advance_stable(PpSeqNo::from(10));
        assert!(cs.votes.is_empty());
    }
}
