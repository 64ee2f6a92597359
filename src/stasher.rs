//! Bounded parking lot for transient/stash-worthy messages (§7, kind 2).
//!
//! Grounded on the teacher's `TboQueue` (time/sequence-ordered message
//! stashing per consensus instance, `consensus::mod`): messages that
//! can't be processed *yet* — not Byzantine, just early — are kept in
//! FIFO order per reason and replayed once whatever blocked them
//! clears, rather than being dropped or retried by the sender.

use crate::collections::{hash_map, ordered_map, HashMap, OrderedMap};

/// The reason a message was stashed rather than processed or
/// discarded, matching the Validator decision table (§4.1/§4.1.1).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum StashKind {
    FutureView,
    CatchingUp,
    Watermarks,
    /// A PREPARE/COMMIT that arrived before its PRE-PREPARE (§4.2,
    /// scenario S4).
    MissingPrePrepare,
    /// A 3PC message whose listed requests aren't finalised yet.
    NotYetFinalised,
}

const ALL_KINDS: [StashKind; 5] = [
    StashKind::FutureView,
    StashKind::CatchingUp,
    StashKind::Watermarks,
    StashKind::MissingPrePrepare,
    StashKind::NotYetFinalised,
];

/// A bounded, per-kind FIFO of stashed messages of type `M`.
///
/// Every kind is independently bounded by `limit_per_kind`: exceeding
/// it drops the oldest entry of that kind (not the newest), so a
/// burst of one kind of stash-worthy traffic can't starve the bound
/// other kinds get.
#[derive(Debug)]
pub struct Stasher<M> {
    limit_per_kind: usize,
    entries: HashMap<StashKind, OrderedMap<u64, M>>,
    next_seq: u64,
    dropped: HashMap<StashKind, u64>,
}

impl<M> Stasher<M> {
    pub fn new(limit_per_kind: usize) -> Self {
        let mut entries = hash_map();
        let mut dropped = hash_map();
        for kind in ALL_KINDS {
            entries.insert(kind, ordered_map());
            dropped.insert(kind, 0);
        }
        Self { limit_per_kind, entries, next_seq: 0, dropped }
    }

    /// Stashes `message` under `kind`, evicting the oldest entry of
    /// that same kind if the bound would otherwise be exceeded.
    pub fn stash(&mut self, kind: StashKind, message: M) {
        let queue = self.entries.entry(kind).or_insert_with(ordered_map);
        if queue.len() >= self.limit_per_kind {
            queue.pop_front();
            *self.dropped.entry(kind).or_insert(0) += 1;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        queue.insert(seq, message);
    }

    /// Drains every entry stashed under `kind`, oldest first, for the
    /// caller to replay now that whatever blocked them has cleared
    /// (e.g. a view install, mode change, watermark advance, or
    /// primary election).
    pub fn replay(&mut self, kind: StashKind) -> Vec<M> {
        let queue = self.entries.entry(kind).or_insert_with(ordered_map);
        let mut drained = Vec::with_capacity(queue.len());
        while let Some((_, message)) = queue.pop_front() {
            drained.push(message);
        }
        drained
    }

    pub fn len(&self, kind: StashKind) -> usize {
        self.entries.get(&kind).map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, kind: StashKind) -> bool {
        self.len(kind) == 0
    }

    pub fn dropped(&self, kind: StashKind) -> u64 {
        *self.dropped.get(&kind).unwrap_or(&0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_returns_fifo_order() {
        let mut stasher: Stasher<i32> = Stasher::new(10);
        stasher.stash(StashKind::FutureView, 1);
        stasher.stash(StashKind::FutureView, 2);
        stasher.stash(StashKind::FutureView, 3);
        assert_eq!(stasher.replay(StashKind::FutureView), vec![1, 2, 3]);
        assert!(stasher.is_empty(StashKind::FutureView));
    }

    #[test]
    fn exceeding_the_bound_drops_the_oldest_entry() {
        let mut stasher: Stasher<i32> = Stasher::new(2);
        stasher.stash(StashKind::Watermarks, 1);
        stasher.stash(StashKind::Watermarks, 2);
        stasher.stash(StashKind::Watermarks, 3);
        assert_eq!(stasher.dropped(StashKind::Watermarks), 1);
        assert_eq!(stasher.replay(StashKind::Watermarks), vec![2, 3]);
    }

    #[test]
    fn kinds_are_independently_bounded() {
        let mut stasher: Stasher<i32> = Stasher::new(1);
        stasher.stash(StashKind::FutureView, 1);
        stasher.stash(StashKind::CatchingUp, 2);
        assert_eq!(stasher.len(StashKind::FutureView), 1);
        assert_eq!(stasher.len(StashKind::CatchingUp), 1);
        assert_eq!(stasher.dropped(StashKind::FutureView), 0);
    }
}
