use tokio::sync::mpsc;

use super::RunStateId;

/// `Send + Sync` handle used to post `advance_state` from any task.
///
/// Posting never blocks and never fails silently on a healthy engine: the
/// channel is unbounded (a state machine's run-state history is a handful
/// of posts, never an unbounded stream) and posts after the machine is
/// killed are simply dropped, mirroring the original's tolerance of a
/// post arriving after `finish_impl` has already run.
#[derive(Debug, Clone)]
pub struct StateMachineHandle {
    tx: mpsc::UnboundedSender<RunStateId>,
}

impl StateMachineHandle {
    pub(super) fn new(tx: mpsc::UnboundedSender<RunStateId>) -> Self {
        Self { tx }
    }

    /// Request the machine be re-entered at (at least) `run_state` the
    /// next time the engine ticks. Concurrent posts coalesce to the
    /// largest run state seen before the next tick.
    pub fn advance_state(&self, run_state: RunStateId) {
        let _ = self.tx.send(run_state);
    }

    /// True if the engine has dropped this machine (it reached `Killed`).
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
