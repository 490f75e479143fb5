//! Per-request extension of the cooperative state machine (spec.md §4.5),
//! grounded on `aicurleasyrequeststatemachine.h`'s event set
//! (`added_to_multi_handle` / `finished` / `removed_from_multi_handle` /
//! `bad_file_descriptor`) and on the `Request<Pending|Claimed|Processing>`
//! typestate chain's notion of "spawn the transfer, then reap it".
//!
//! Run states are ordered so that a racing `RemovedAfterFinished` always
//! outranks a `TimedOut` posted moments earlier -- the inactivity timer
//! does not auto-cancel on expiry (it is a persistent, observable timer,
//! not a one-shot), so a late normal completion must still win the
//! larger-run-state-wins coalescing race in `engine::Engine::tick`.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::engine::{RunStateId, StateMachine, Step};

/// Run states for one in-flight HTTP request, numbered least to most
/// urgent per the engine's coalescing contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum HttpRequestRunState {
    AddRequest = 0,
    WaitAdded = 1,
    WaitRemoved = 2,
    TimedOut = 3,
    RemovedAfterFinished = 4,
    BadFileDescriptor = 5,
}

impl HttpRequestRunState {
    pub fn as_run_state_id(self) -> RunStateId {
        RunStateId::new(self as u32)
    }

    pub fn from_run_state_id(id: RunStateId) -> Option<Self> {
        match id.0 {
            0 => Some(Self::AddRequest),
            1 => Some(Self::WaitAdded),
            2 => Some(Self::WaitRemoved),
            3 => Some(Self::TimedOut),
            4 => Some(Self::RemovedAfterFinished),
            5 => Some(Self::BadFileDescriptor),
            _ => None,
        }
    }
}

/// Events the dispatch task (the async equivalent of the curl thread)
/// posts back to the state machine via `engine::StateMachineHandle::advance_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestEvent {
    AddedToMultiHandle,
    Finished,
    RemovedFromMultiHandle,
    BadFileDescriptor,
}

impl RequestEvent {
    pub fn run_state(self) -> HttpRequestRunState {
        match self {
            RequestEvent::AddedToMultiHandle => HttpRequestRunState::WaitAdded,
            RequestEvent::Finished => HttpRequestRunState::WaitRemoved,
            RequestEvent::RemovedFromMultiHandle => HttpRequestRunState::RemovedAfterFinished,
            RequestEvent::BadFileDescriptor => HttpRequestRunState::BadFileDescriptor,
        }
    }
}

/// Drives one HTTP request through its lifecycle. Owns nothing of the
/// actual transfer (that's `transport::run_one`'s job); this machine only
/// tracks state and the persistent inactivity timer, the way the original
/// state machine is a thin wrapper around one `AICurlEasyRequest`.
pub struct HttpRequestStateMachine {
    name: String,
    inactivity_timeout: Duration,
    last_activity: Instant,
    /// Set once the transfer genuinely finished, even if a timeout was
    /// also observed racing it -- the timer is persistent, not one-shot,
    /// so this flag is how `multiplex_impl` tells the two apart.
    finished_cleanly: bool,
}

impl HttpRequestStateMachine {
    pub fn new(name: impl Into<String>, inactivity_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            inactivity_timeout,
            last_activity: Instant::now(),
            finished_cleanly: false,
        }
    }

    pub fn note_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    fn timed_out(&self) -> bool {
        self.last_activity.elapsed() >= self.inactivity_timeout
    }
}

impl StateMachine for HttpRequestStateMachine {
    fn initialize_impl(&mut self) -> RunStateId {
        HttpRequestRunState::AddRequest.as_run_state_id()
    }

    fn multiplex_impl(&mut self, run_state: RunStateId) -> Step {
        let Some(state) = HttpRequestRunState::from_run_state_id(run_state) else {
            warn!(machine = %self.name, "request_sm: unrecognized run state, aborting");
            return Step::Abort;
        };

        match state {
            HttpRequestRunState::AddRequest => Step::Idle(HttpRequestRunState::AddRequest.as_run_state_id()),
            HttpRequestRunState::WaitAdded => {
                if self.timed_out() {
                    Step::Continue(HttpRequestRunState::TimedOut.as_run_state_id())
                } else {
                    Step::Idle(HttpRequestRunState::WaitAdded.as_run_state_id())
                }
            }
            HttpRequestRunState::WaitRemoved => {
                self.finished_cleanly = true;
                if self.timed_out() {
                    // Timer is persistent: a completion racing a timeout
                    // still counts as clean, since RemovedAfterFinished
                    // outranks TimedOut in the coalescing order.
                    Step::Continue(HttpRequestRunState::RemovedAfterFinished.as_run_state_id())
                } else {
                    Step::Idle(HttpRequestRunState::WaitRemoved.as_run_state_id())
                }
            }
            HttpRequestRunState::TimedOut => {
                if self.finished_cleanly {
                    Step::Continue(HttpRequestRunState::RemovedAfterFinished.as_run_state_id())
                } else {
                    debug!(machine = %self.name, "request_sm: inactivity timeout, aborting");
                    Step::Abort
                }
            }
            HttpRequestRunState::RemovedAfterFinished => Step::Finish,
            HttpRequestRunState::BadFileDescriptor => Step::Abort,
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::assert_monotonic_urgency;

    #[test]
    fn run_states_are_strictly_increasing_in_urgency() {
        let ordered = [
            HttpRequestRunState::AddRequest,
            HttpRequestRunState::WaitAdded,
            HttpRequestRunState::WaitRemoved,
            HttpRequestRunState::TimedOut,
            HttpRequestRunState::RemovedAfterFinished,
            HttpRequestRunState::BadFileDescriptor,
        ]
        .map(HttpRequestRunState::as_run_state_id);
        assert_monotonic_urgency(&ordered).unwrap();
    }

    #[test]
    fn finished_before_timeout_reaches_removed_after_finished() {
        let mut machine = HttpRequestStateMachine::new("test", Duration::from_secs(60));
        assert_eq!(machine.multiplex_impl(HttpRequestRunState::WaitRemoved.as_run_state_id()), Step::Idle(HttpRequestRunState::WaitRemoved.as_run_state_id()));
        assert!(machine.finished_cleanly);
    }

    #[test]
    fn inactivity_without_completion_aborts() {
        let mut machine = HttpRequestStateMachine::new("test", Duration::from_millis(0));
        // WaitAdded with an already-expired timer should move to TimedOut...
        let step = machine.multiplex_impl(HttpRequestRunState::WaitAdded.as_run_state_id());
        assert_eq!(step, Step::Continue(HttpRequestRunState::TimedOut.as_run_state_id()));
        // ...and TimedOut without a clean finish should abort.
        let step = machine.multiplex_impl(HttpRequestRunState::TimedOut.as_run_state_id());
        assert_eq!(step, Step::Abort);
    }

    #[test]
    fn late_completion_after_timeout_still_wins() {
        let mut machine = HttpRequestStateMachine::new("test", Duration::from_millis(0));
        // Timer already expired, but the transfer still reports WaitRemoved
        // (a late normal completion racing the timeout).
        let step = machine.multiplex_impl(HttpRequestRunState::WaitRemoved.as_run_state_id());
        assert_eq!(step, Step::Continue(HttpRequestRunState::RemovedAfterFinished.as_run_state_id()));
    }
}
