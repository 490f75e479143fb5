//! Cooperative state-machine runtime.
//!
//! A generalization of the original's `AICurlEasyRequestStateMachine`: a
//! state machine drives itself forward one "run state" at a time, is
//! re-entered (`multiplex_impl`) whenever something posts `advance_state`,
//! and always passes through `Abort`/`Finish` before it stops being
//! scheduled. Unlike the original single-threaded curl-thread loop, state
//! machines here may be advanced from any Tokio task; the engine owns an
//! mpsc channel per registered machine and coalesces concurrent posts
//! using "larger run-state wins" (DESIGN NOTES §9).
//!
//! Subclasses must number their own run states so that a numerically
//! larger discriminant is always at least as urgent as a smaller one --
//! the engine has no way to check this for a generic `u32`, so it is
//! documented here and asserted by tests in the modules that define
//! concrete run-state enums (`transport::request_sm`, `texture::worker`).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{CoreError, Result};

mod handle;

pub use handle::StateMachineHandle;

/// Opaque identifier for a run state. Concrete state machines define their
/// own enum and convert to/from this via `as u32` / a `TryFrom` impl; the
/// engine itself never interprets the value beyond ordering it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunStateId(pub u32);

impl RunStateId {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for RunStateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The four phases every registered machine passes through, independent of
/// its own `RunStateId` numbering. Mirrors the original's
/// `initialize_impl` / `multiplex_impl` / `abort_impl` / `finish_impl`
/// quartet plus the terminal `Killed` bookkeeping state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseState {
    Initialize,
    Multiplex,
    Abort,
    Finish,
    Killed,
}

/// What a machine wants to happen after one `multiplex_impl` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Stay in `Multiplex`, runnable again next tick at this run state.
    Continue(RunStateId),
    /// Stay in `Multiplex` but do not re-run until `advance_state` raises
    /// the run state above the parked value (mirrors the original's
    /// `idle()` / `idle_in(expected_state)`).
    Idle(RunStateId),
    /// Move to `Abort`, then `Finish`, then `Killed`.
    Abort,
    /// Move directly to `Finish`, then `Killed` (normal completion).
    Finish,
}

/// Implemented by anything the engine drives.
pub trait StateMachine: Send {
    /// One-time setup. Called exactly once, before the first
    /// `multiplex_impl`. The returned run state seeds the machine.
    fn initialize_impl(&mut self) -> RunStateId;

    /// Advance one step. Called whenever the engine decides this machine
    /// is runnable: immediately after `initialize_impl`, and again every
    /// time `advance_state`/a tick moves it out of `Idle` with a run
    /// state at least as urgent as the one it's currently parked at.
    fn multiplex_impl(&mut self, run_state: RunStateId) -> Step;

    /// Called once when the machine transitions into `Abort`. Default: no-op.
    fn abort_impl(&mut self) {}

    /// Called once when the machine transitions into `Finish`, whether it
    /// got there via normal completion or via `Abort`. Default: no-op.
    fn finish_impl(&mut self) {}

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "state_machine"
    }
}

struct Registered {
    machine: Box<dyn StateMachine>,
    base: BaseState,
    run_state: RunStateId,
    /// Set when the machine last returned `Step::Idle`; cleared once a
    /// posted `advance_state` raises the run state above `run_state`.
    idle: bool,
    /// Posts pending from `advance_state`, coalesced by `max` on drain.
    pending: Option<RunStateId>,
    rx: mpsc::UnboundedReceiver<RunStateId>,
}

/// A single-threaded-equivalent runtime driving a set of [`StateMachine`]s.
///
/// An `Engine` is meant to be owned by one Tokio task (the async analogue
/// of the original's dedicated curl thread); `StateMachineHandle`s are the
/// `Send + Sync` handle other tasks use to post `advance_state`.
pub struct Engine {
    machines: VecDeque<Registered>,
    next_id: u64,
}

/// Opaque identifier for a machine registered with an [`Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MachineId(u64);

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            machines: VecDeque::new(),
            next_id: 0,
        }
    }

    /// Register a machine, running its `initialize_impl` immediately, and
    /// return both its id and a cloneable handle other tasks can use to
    /// post `advance_state`.
    pub fn run(&mut self, mut machine: Box<dyn StateMachine>) -> (MachineId, StateMachineHandle) {
        let id = MachineId(self.next_id);
        self.next_id += 1;

        let run_state = machine.initialize_impl();
        let (tx, rx) = mpsc::unbounded_channel();

        debug!(machine = machine.name(), run_state = run_state.0, "engine: registered");

        self.machines.push_back(Registered {
            machine,
            base: BaseState::Multiplex,
            run_state,
            idle: false,
            pending: None,
            rx,
        });

        (id, StateMachineHandle::new(tx))
    }

    /// Run one scheduling pass, visiting runnable machines in insertion
    /// order, for at most `budget` wall-clock time. Returns the number of
    /// machines that were removed (reached `Killed`) this tick.
    pub fn tick(&mut self, budget: Duration) -> usize {
        let deadline = Instant::now() + budget;
        let mut removed = 0;
        let len = self.machines.len();

        for _ in 0..len {
            if Instant::now() >= deadline {
                break;
            }
            let Some(mut reg) = self.machines.pop_front() else {
                break;
            };

            self.drain_pending(&mut reg);

            if reg.idle && reg.base == BaseState::Multiplex {
                self.machines.push_back(reg);
                continue;
            }

            self.step(&mut reg);

            if reg.base == BaseState::Killed {
                removed += 1;
                trace!(machine = reg.machine.name(), "engine: killed, dropping");
            } else {
                self.machines.push_back(reg);
            }
        }

        removed
    }

    fn drain_pending(&self, reg: &mut Registered) {
        while let Ok(posted) = reg.rx.try_recv() {
            reg.pending = Some(match reg.pending {
                Some(current) => current.max(posted),
                None => posted,
            });
        }
        if let Some(posted) = reg.pending.take() {
            if posted > reg.run_state {
                reg.run_state = posted;
                reg.idle = false;
            }
        }
    }

    fn step(&self, reg: &mut Registered) {
        match reg.base {
            BaseState::Initialize => {
                reg.base = BaseState::Multiplex;
            }
            BaseState::Multiplex => match reg.machine.multiplex_impl(reg.run_state) {
                Step::Continue(next) => {
                    reg.run_state = next;
                    reg.idle = false;
                }
                Step::Idle(next) => {
                    reg.run_state = next;
                    reg.idle = true;
                }
                Step::Abort => {
                    reg.base = BaseState::Abort;
                }
                Step::Finish => {
                    reg.base = BaseState::Finish;
                }
            },
            BaseState::Abort => {
                reg.machine.abort_impl();
                reg.base = BaseState::Finish;
            }
            BaseState::Finish => {
                reg.machine.finish_impl();
                reg.base = BaseState::Killed;
            }
            BaseState::Killed => {}
        }
    }

    /// Number of machines still registered (not yet `Killed`).
    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }
}

/// Validates that a set of discriminants satisfies the "larger is more
/// urgent" total ordering the engine relies on for coalescing. Intended
/// for use in each concrete run-state enum's own unit tests, not called by
/// the engine itself.
pub fn assert_monotonic_urgency(ordered_least_to_most_urgent: &[RunStateId]) -> Result<()> {
    for pair in ordered_least_to_most_urgent.windows(2) {
        if pair[0] >= pair[1] {
            return Err(CoreError::Other(anyhow::anyhow!(
                "run states not strictly increasing in urgency: {} >= {}",
                pair[0],
                pair[1]
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingMachine {
        steps: Arc<AtomicUsize>,
        finish_calls: Arc<AtomicUsize>,
        target: u32,
    }

    impl StateMachine for CountingMachine {
        fn initialize_impl(&mut self) -> RunStateId {
            RunStateId::new(0)
        }

        fn multiplex_impl(&mut self, run_state: RunStateId) -> Step {
            self.steps.fetch_add(1, Ordering::SeqCst);
            if run_state.0 >= self.target {
                Step::Finish
            } else {
                Step::Continue(RunStateId::new(run_state.0 + 1))
            }
        }

        fn name(&self) -> &str {
            "counting_machine"
        }

        fn finish_impl(&mut self) {
            self.finish_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn tick_advances_registered_machine_to_completion() {
        let mut engine = Engine::new();
        let steps = Arc::new(AtomicUsize::new(0));
        let finishes = Arc::new(AtomicUsize::new(0));
        let (_id, _handle) = engine.run(Box::new(CountingMachine {
            steps: steps.clone(),
            finish_calls: finishes.clone(),
            target: 3,
        }));

        // Enough ticks to walk 0 -> 1 -> 2 -> 3 -> Finish -> Killed.
        for _ in 0..10 {
            if engine.is_empty() {
                break;
            }
            engine.tick(Duration::from_millis(50));
        }

        assert!(steps.load(Ordering::SeqCst) >= 4);
        assert_eq!(finishes.load(Ordering::SeqCst), 1);
        assert!(engine.is_empty());
    }

    struct IdleMachine {
        woken: Arc<AtomicUsize>,
    }

    impl StateMachine for IdleMachine {
        fn initialize_impl(&mut self) -> RunStateId {
            RunStateId::new(0)
        }

        fn multiplex_impl(&mut self, run_state: RunStateId) -> Step {
            self.woken.fetch_add(1, Ordering::SeqCst);
            if run_state.0 >= 5 {
                Step::Finish
            } else {
                Step::Idle(run_state)
            }
        }
    }

    #[test]
    fn advance_state_coalesces_to_larger_value_and_wakes_idle_machine() {
        let mut engine = Engine::new();
        let woken = Arc::new(AtomicUsize::new(0));
        let (_id, handle) = engine.run(Box::new(IdleMachine { woken: woken.clone() }));

        engine.tick(Duration::from_millis(10));
        let woken_after_first_tick = woken.load(Ordering::SeqCst);

        // Idle; further ticks with no post must not re-invoke multiplex_impl.
        engine.tick(Duration::from_millis(10));
        engine.tick(Duration::from_millis(10));
        assert_eq!(woken.load(Ordering::SeqCst), woken_after_first_tick);

        handle.advance_state(RunStateId::new(2));
        handle.advance_state(RunStateId::new(9));
        handle.advance_state(RunStateId::new(5));

        engine.tick(Duration::from_millis(10));
        assert!(woken.load(Ordering::SeqCst) > woken_after_first_tick);
    }

    #[test]
    fn monotonic_urgency_check_catches_bad_ordering() {
        let good = [RunStateId::new(0), RunStateId::new(1), RunStateId::new(2)];
        assert!(assert_monotonic_urgency(&good).is_ok());

        let bad = [RunStateId::new(0), RunStateId::new(1), RunStateId::new(1)];
        assert!(assert_monotonic_urgency(&bad).is_err());
    }
}
