//! Scheduled-action timer interface.
//!
//! The cooperative event loop (§5) needs to schedule work for later —
//! a batch timeout, a view-change escalation, a primary-disconnection
//! suspicion — without blocking. Grounded on the teacher's
//! `async_runtime::tokio` module, which wraps a tokio-backed
//! collaborator behind a small interface rather than calling it
//! directly from call sites: [`TokioTimer`] is that production
//! implementation, and [`ManualTimer`] is the deterministic fake clock
//! tests swap in instead.

use std::time::Duration;

/// A handle identifying a scheduled action, used to cancel it before
/// it fires.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct TimerHandle(u64);

/// Schedules and cancels delayed actions.
///
/// Implementations are expected to be non-blocking: `schedule` returns
/// immediately, and firing is observed later through `poll_expired`.
/// This mirrors the event loop's tick structure (§5.1), where timers
/// are one more source the loop polls each iteration rather than a
/// source of its own callbacks.
pub trait Timer {
    /// The engine's notion of "now", in milliseconds since an arbitrary
    /// epoch fixed at construction. Monotonic.
    fn now(&self) -> u64;

    /// Schedules `action` to become expired no earlier than `delay`
    /// from now. Returns a handle that can later be used to cancel it.
    fn schedule(&mut self, delay: Duration, action: TimerAction) -> TimerHandle;

    /// Cancels a previously scheduled action. A no-op if it already
    /// fired or was already cancelled.
    fn cancel(&mut self, handle: TimerHandle);

    /// Drains every action that has become due, oldest first.
    fn poll_expired(&mut self) -> Vec<TimerAction>;
}

/// The set of deadlines the engine needs to track. Kept as a closed
/// enum (rather than a boxed closure) so a deterministic test `Timer`
/// can assert on *which* action fired without downcasting.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TimerAction {
    BatchTimeout { inst_id: crate::ids::InstId },
    PrimaryDisconnection { inst_id: crate::ids::InstId },
    ViewChangeEscalation { inst_id: crate::ids::InstId, view_no: crate::ids::ViewNo },
}

/// A deterministic, manually-advanced `Timer` used by tests and by
/// single-process wiring that drives its own virtual clock instead of
/// relying on wall time.
#[derive(Debug, Default)]
pub struct ManualTimer {
    now_ms: u64,
    next_handle: u64,
    pending: Vec<(u64, TimerHandle, TimerAction)>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the virtual clock by `delay`. Does not itself drain
    /// expired actions; call `poll_expired` after advancing.
    pub fn advance(&mut self, delay: Duration) {
        self.now_ms += delay.as_millis() as u64;
    }
}

impl Timer for ManualTimer {
    fn now(&self) -> u64 {
        self.now_ms
    }

    fn schedule(&mut self, delay: Duration, action: TimerAction) -> TimerHandle {
        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;
        let due = self.now_ms + delay.as_millis() as u64;
        self.pending.push((due, handle, action));
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.pending.retain(|(_, h, _)| *h != handle);
    }

    fn poll_expired(&mut self) -> Vec<TimerAction> {
        let now = self.now_ms;
        let mut expired = Vec::new();
        self.pending.retain(|(due, _, action)| {
            if *due <= now {
                expired.push(action.clone());
                false
            } else {
                true
            }
        });
        expired
    }
}

/// A `Timer` backed by `tokio::time::Instant`'s monotonic clock, for a
/// production deployment that already runs its transport/executor
/// collaborators inside a tokio runtime (§6.1). `schedule`/`cancel`/
/// `poll_expired` stay synchronous and non-blocking, matching the
/// cooperative event loop's contract (§5.1): this type only ever reads
/// the clock, it never calls `tokio::time::sleep` or otherwise awaits,
/// so the loop's tick structure never yields to the runtime mid-phase.
#[cfg(feature = "async_runtime_tokio")]
#[derive(Debug)]
pub struct TokioTimer {
    epoch: ::tokio::time::Instant,
    next_handle: u64,
    pending: Vec<(u64, TimerHandle, TimerAction)>,
}

#[cfg(feature = "async_runtime_tokio")]
impl TokioTimer {
    /// Fixes `now() == 0` at the moment of construction; every later
    /// reading is milliseconds elapsed since then.
    pub fn new() -> Self {
        Self { epoch: ::tokio::time::Instant::now(), next_handle: 0, pending: Vec::new() }
    }
}

#[cfg(feature = "async_runtime_tokio")]
impl Default for TokioTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "async_runtime_tokio")]
impl Timer for TokioTimer {
    fn now(&self) -> u64 {
        ::tokio::time::Instant::now().saturating_duration_since(self.epoch).as_millis() as u64
    }

    fn schedule(&mut self, delay: Duration, action: TimerAction) -> TimerHandle {
        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;
        let due = self.now() + delay.as_millis() as u64;
        self.pending.push((due, handle, action));
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.pending.retain(|(_, h, _)| *h != handle);
    }

    fn poll_expired(&mut self) -> Vec<TimerAction> {
        let now = self.now();
        let mut expired = Vec::new();
        self.pending.retain(|(due, _, action)| {
            if *due <= now {
                expired.push(action.clone());
                false
            } else {
                true
            }
        });
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::InstId;

    #[cfg(feature = "async_runtime_tokio")]
    #[test]
    fn tokio_timer_fires_only_once_due() {
        let mut timer = TokioTimer::new();
        let handle = timer.schedule(
            Duration::from_millis(20),
            TimerAction::BatchTimeout { inst_id: InstId::from(0) },
        );
        assert!(timer.poll_expired().is_empty());
        std::thread::sleep(Duration::from_millis(40));
        let expired = timer.poll_expired();
        assert_eq!(expired.len(), 1);
        assert!(timer.poll_expired().is_empty());
        let _ = handle;
    }

    #[test]
    fn fires_only_once_due() {
        let mut timer = ManualTimer::new();
        timer.schedule(
            Duration::from_millis(100),
            TimerAction::BatchTimeout { inst_id: InstId::from(0) },
        );
        assert!(timer.poll_expired().is_empty());
        timer.advance(Duration::from_millis(100));
        let expired = timer.poll_expired();
        assert_eq!(expired.len(), 1);
        assert!(timer.poll_expired().is_empty());
    }

    #[test]
    fn cancel_prevents_firing() {
        let mut timer = ManualTimer::new();
        let handle = timer.schedule(
            Duration::from_millis(50),
            TimerAction::BatchTimeout { inst_id: InstId::from(0) },
        );
        timer.cancel(handle);
        timer.advance(Duration::from_millis(100));
        assert!(timer.poll_expired().is_empty());
    }
}
