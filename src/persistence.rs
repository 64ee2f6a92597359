//! Durable-state seam.
//!
//! §6.1 places on-disk storage out of scope as a collaborator with a
//! narrow interface; this module defines that interface and an
//! in-memory double satisfying it, used by tests and by `node.rs`'s
//! default wiring. Grounded on the teacher's `persistentdb` usage
//! pattern of a small key/value `load`/`store` seam sitting behind the
//! log and consensus modules, rather than those modules touching disk
//! directly.

use crate::collections::{hash_map, HashMap};
use crate::error::*;
use crate::ids::{InstId, PpSeqNo, ViewNo};

/// The durable facts a restarting validator needs back before it can
/// safely resume ordering: the last `PpSeqNo` it sent a PRE-PREPARE
/// for (per instance, so it never double-proposes across a crash) and
/// the primary-name history audit trail (§4.4.1).
#[derive(Debug, Clone, Default)]
pub struct DurableState {
    pub last_sent_pp_seq_no: HashMap<InstId, PpSeqNo>,
    pub primary_history: Vec<(ViewNo, crate::ids::NodeName)>,
}

/// Loads and stores a validator's [`DurableState`].
///
/// Implementations must make `store` durable before returning `Ok`;
/// callers rely on that to avoid re-proposing an already-sent batch
/// after a crash.
pub trait PersistedState {
    fn load(&self) -> Result<DurableState>;
    fn store(&mut self, state: &DurableState) -> Result<()>;
}

/// An in-memory `PersistedState`, for tests and for single-process
/// demos that don't need to survive a restart.
#[derive(Debug, Default)]
pub struct MemoryPersistedState {
    state: DurableState,
}

impl MemoryPersistedState {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistedState for MemoryPersistedState {
    fn load(&self) -> Result<DurableState> {
        Ok(self.state.clone())
    }

    fn store(&mut self, state: &DurableState) -> Result<()> {
        self.state = state.clone();
        Ok(())
    }
}

impl DurableState {
    pub fn new() -> Self {
        Self { last_sent_pp_seq_no: hash_map(), primary_history: Vec::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_memory_backend() {
        let mut backend = MemoryPersistedState::new();
        let mut state = DurableState::new();
        state.last_sent_pp_seq_no.insert(InstId::from(0), PpSeqNo::from(7));
        backend.store(&state).unwrap();
        let loaded = backend.load().unwrap();
        assert_eq!(loaded.last_sent_pp_seq_no.get(&InstId::from(0)), Some(&PpSeqNo::from(7)));
    }
}
