//! Application execution, off the consensus thread.
//!
//! Grounded on the teacher's `executable` module: applying a batch can
//! run arbitrary, possibly slow, application code, so it must never
//! run inline on the cooperative event loop (§5.1, "long work never
//! blocks the loop"). The teacher spins a dedicated `std::thread` and
//! talks to it over an `mpsc` channel; this crate keeps that shape.

use std::sync::mpsc;
use std::thread;

use crate::error::*;
use crate::ids::InstId;
use crate::message::Ordered;
use crate::ordering_service::StagedRoots;

/// The application state machine being replicated. Implementations own
/// whatever storage backs their state; this crate only needs to know
/// how to hand it a batch and get back its effect on the four ledger
/// roots checked by the ordering service (§4.2, "Root integrity").
///
/// A pluggable transaction handler per §1 ("out of scope" as a
/// concrete implementation) — this trait is the narrow interface the
/// rest of the engine programs against.
pub trait Application: Send + 'static {
    /// Applies the requests named by `batch.req_idr`, in order, and
    /// returns the resulting staged roots. Staged, not yet durable:
    /// the caller may still `revert` this application if the batch
    /// never reaches `ReachedOrdered` (e.g. a view change intervenes).
    fn apply(&mut self, batch: &Ordered, requests: &[Vec<u8>]) -> StagedRoots;

    /// Commits the effects of every batch applied since the last
    /// commit, making them durable.
    fn commit(&mut self);

    /// Undoes every staged-but-uncommitted application, restoring the
    /// roots to their last committed values. Called when
    /// `OrderingService::revert_unordered_batches` discards prepared
    /// but never-ordered batches at the start of a view change (§4.2).
    fn revert(&mut self);
}

enum ExecutorCommand {
    Apply {
        batch: Ordered,
        requests: Vec<Vec<u8>>,
        reply: mpsc::Sender<StagedRoots>,
    },
    Commit,
    Revert,
    Shutdown,
}

/// A handle to an [`Application`] running on its own thread.
///
/// Dropping the handle asks the worker thread to shut down and waits
/// for it to exit, mirroring the teacher's `Executor::shutdown`.
pub struct ExecutorHandle {
    commands: mpsc::Sender<ExecutorCommand>,
    worker: Option<thread::JoinHandle<()>>,
}

impl ExecutorHandle {
    pub fn spawn<A: Application>(mut app: A) -> Self {
        let (tx, rx) = mpsc::channel::<ExecutorCommand>();
        let worker = thread::Builder::new()
            .name("rbft-executor".into())
            .spawn(move || {
                while let Ok(cmd) = rx.recv() {
                    match cmd {
                        ExecutorCommand::Apply { batch, requests, reply } => {
                            let result = app.apply(&batch, &requests);
                            let _ = reply.send(result);
                        }
                        ExecutorCommand::Commit => app.commit(),
                        ExecutorCommand::Revert => app.revert(),
                        ExecutorCommand::Shutdown => break,
                    }
                }
            })
            .expect("failed to spawn executor thread");
        Self { commands: tx, worker: Some(worker) }
    }

    /// Hands a committed batch to the application and blocks until it
    /// reports back the resulting roots.
    ///
    /// The caller (the ordering service, driven off the event loop) is
    /// expected to call this from a context that can itself block —
    /// e.g. a `tokio::task::spawn_blocking` — so that the event loop
    /// proper is never stalled waiting on application code.
    pub fn apply(&self, batch: Ordered, requests: Vec<Vec<u8>>) -> Result<StagedRoots> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.commands
            .send(ExecutorCommand::Apply { batch, requests, reply: reply_tx })
            .simple(ErrorKind::Node)?;
        reply_rx.recv().simple(ErrorKind::Node)
    }

    pub fn commit(&self) -> Result<()> {
        self.commands.send(ExecutorCommand::Commit).simple(ErrorKind::Node)
    }

    pub fn revert(&self) -> Result<()> {
        self.commands.send(ExecutorCommand::Revert).simple(ErrorKind::Node)
    }
}

impl Drop for ExecutorHandle {
    fn drop(&mut self) {
        let _ = self.commands.send(ExecutorCommand::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash::Digest;

    struct CountingApp {
        applied: usize,
        committed: usize,
        reverted: usize,
    }

    impl Application for CountingApp {
        fn apply(&mut self, _batch: &Ordered, requests: &[Vec<u8>]) -> StagedRoots {
            self.applied += requests.len();
            let root = Digest::from_data(&self.applied.to_le_bytes());
            StagedRoots { state_root: root, txn_root: root, pool_state_root: root, audit_txn_root: root }
        }

        fn commit(&mut self) {
            self.committed += 1;
        }

        fn revert(&mut self) {
            self.reverted += 1;
        }
    }

    fn sample_batch() -> Ordered {
        Ordered {
            inst_id: InstId::from(0),
            view_no: crate::ids::ViewNo::from(0),
            pp_seq_no: crate::ids::PpSeqNo::FIRST,
            ledger_id: 1,
            pp_time: 0,
            req_idr: vec![Digest::from_data(b"req-1")],
        }
    }

    #[test]
    fn applies_batches_on_worker_thread() {
        let handle = ExecutorHandle::spawn(CountingApp { applied: 0, committed: 0, reverted: 0 });
        let root_a = handle.apply(sample_batch(), vec![b"op".to_vec()]).unwrap();
        let root_b = handle.apply(sample_batch(), vec![b"op".to_vec(), b"op2".to_vec()]).unwrap();
        assert_ne!(root_a.state_root, root_b.state_root);
        handle.commit().unwrap();
        handle.revert().unwrap();
    }
}
