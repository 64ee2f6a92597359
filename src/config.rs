//! Crate-wide configuration.
//!
//! Per the Design Note on "global mutable state", every tunable named
//! in the spec body lives in one `CoreConfig` value, constructed once
//! and threaded through every service's constructor — there is no
//! process-global config singleton, mirroring how `alpenlabs-alpen`'s
//! crates take an explicit `Params`/config value rather than reading
//! ambient global state.

use std::time::Duration;

use crate::ids::PpSeqNo;

/// Tunables for the ordering, checkpoint and view-change subsystems.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Number of protocol instances run per validator, `R = f + 1`.
    pub n: usize,
    /// Maximum number of Byzantine faults tolerated, `f = (n-1)/3`.
    pub f: usize,
    /// Width of the watermark window: `high = low + LOG_SIZE`.
    pub log_size: u64,
    /// Number of ordered batches between CHECKPOINT emissions.
    pub chk_freq: u64,
    /// Maximum number of requests batched into a single PRE-PREPARE.
    pub max_batch_size: usize,
    /// Maximum time a request may sit in the primary's queue before a
    /// (possibly undersized) batch is proposed anyway.
    pub batch_timeout: Duration,
    /// Acceptable clock drift for a PRE-PREPARE's `pp_time`.
    pub acceptable_deviation_pre_prepare: Duration,
    /// How long a master-primary connection may be down before a
    /// replica raises `InstanceChange(PRIMARY_DISCONNECTED)`.
    pub tolerate_primary_disconnection: Duration,
    /// Initial timeout for a view-change round to complete before it
    /// escalates to the next view.
    pub view_change_timeout: Duration,
    /// Upper bound the (doubling) view-change timeout saturates at.
    pub max_view_change_timeout: Duration,
    /// Per-kind bound on the number of entries the stasher may retain.
    pub stasher_limit_per_kind: usize,
    /// Number of `(view_no, primary_name)` pairs retained in
    /// `SharedData`'s in-memory primary history (§4.4.1).
    pub primary_history_cap: usize,
    /// Bounded retry budget for catchup rounds during a view change
    /// (§4.5, condition iii).
    pub catchup_retry_budget: usize,
}

impl CoreConfig {
    /// `R = f + 1`, the number of protocol instances run per validator.
    pub fn num_instances(&self) -> usize {
        self.f + 1
    }

    /// The quorum size for PREPARE/COMMIT/CHECKPOINT/ViewChangeDone:
    /// `2f + 1`.
    pub fn quorum(&self) -> usize {
        2 * self.f + 1
    }

    /// The number of matching PREPAREs (excluding the primary) needed
    /// to transition to COMMIT: `2f`.
    pub fn prepare_certificate_size(&self) -> usize {
        2 * self.f
    }

    /// The initial, open-low watermark for a fresh instance: `(0, LOG_SIZE]`.
    pub fn initial_high_watermark(&self) -> PpSeqNo {
        PpSeqNo::from(self.log_size)
    }
}

impl Default for CoreConfig {
    /// Defaults chosen to match the scenario fixtures in §8 of the
    /// design (`n=4, f=1`, checkpoint every 10 batches).
    fn default() -> Self {
        Self {
            n: 4,
            f: 1,
            log_size: 10,
            chk_freq: 10,
            max_batch_size: 100,
            batch_timeout: Duration::from_millis(300),
            acceptable_deviation_pre_prepare: Duration::from_secs(120),
            tolerate_primary_disconnection: Duration::from_secs(60),
            view_change_timeout: Duration::from_secs(60),
            max_view_change_timeout: Duration::from_secs(60 * 20),
            stasher_limit_per_kind: 1000,
            primary_history_cap: 4,
            catchup_retry_budget: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_math_matches_pbft() {
        let cfg = CoreConfig { n: 4, f: 1, ..Default::default() };
        assert_eq!(cfg.num_instances(), 2);
        assert_eq!(cfg.quorum(), 3);
        assert_eq!(cfg.prepare_certificate_size(), 2);
    }

    #[test]
    fn larger_cluster() {
        let cfg = CoreConfig { n: 7, f: 2, ..Default::default() };
        assert_eq!(cfg.quorum(), 5);
        assert_eq!(cfg.prepare_certificate_size(), 4);
    }
}
