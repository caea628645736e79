//! [`Future`]: a single-assignment handle to a task's eventual outcome.
//!
//! The state machine and locking style follow `zng-task`'s use of
//! `parking_lot::Mutex` for small shared cells (see `process::worker::Worker`'s
//! `requests: Arc<Mutex<IdMap<..>>>`); here the cell also carries a `Condvar`
//! so `result(timeout)` can block without polling.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::error::PoolError;

/// Observable state of a [`Future`]. Transitions are monotonic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    /// Not yet dispatched to a worker; the only state `cancel()` can act on.
    Pending,
    /// Dispatched to a worker, awaiting a result.
    Running,
    /// Cancelled while still `Pending`.
    Cancelled,
    /// Resolved with a value.
    FinishedOk,
    /// Resolved with an error.
    FinishedErr,
}
impl State {
    /// Terminal states no longer accept further transitions.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, State::Pending | State::Running)
    }
}

enum Outcome {
    Ok(serde_json::Value),
    Err(PoolError),
    Cancelled,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
    outcome: Mutex<Option<Outcome>>,
    callbacks: Mutex<Vec<Box<dyn FnOnce(&Result<serde_json::Value, PoolError>) + Send>>>,
}

/// The producer side of a [`Future`], held by the task manager.
pub struct FutureSlot {
    shared: Arc<Shared>,
}

/// A single-assignment handle to a task's eventual outcome.
///
/// Cloning a `Future` gives another handle to the same outcome; this is how
/// `add_done_callback` coexists with `result()` on independently held copies.
#[derive(Clone)]
pub struct Future {
    shared: Arc<Shared>,
}

/// Creates a linked producer/consumer pair for one task's outcome.
pub fn pending() -> (FutureSlot, Future) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State::Pending),
        cond: Condvar::new(),
        outcome: Mutex::new(None),
        callbacks: Mutex::new(Vec::new()),
    });
    (FutureSlot { shared: shared.clone() }, Future { shared })
}

impl FutureSlot {
    /// Transition `Pending -> Running`; called by the task manager when the
    /// task is stamped and sent to a worker.
    pub fn mark_running(&self) {
        let mut state = self.shared.state.lock();
        if *state == State::Pending {
            *state = State::Running;
        }
    }

    /// True if [`Future::cancel`] already resolved this task; the task
    /// manager uses this to skip dispatching a task nobody is waiting on.
    pub fn is_cancelled(&self) -> bool {
        *self.shared.state.lock() == State::Cancelled
    }

    /// Resolve with a successful value. No-op if already terminal.
    pub fn resolve_ok(&self, value: serde_json::Value) {
        self.resolve(State::FinishedOk, Outcome::Ok(value));
    }

    /// Resolve with an error (timeout, process expiry, or user error).
    pub fn resolve_err(&self, err: PoolError) {
        self.resolve(State::FinishedErr, Outcome::Err(err));
    }

    fn resolve(&self, new_state: State, outcome: Outcome) {
        {
            let mut state = self.shared.state.lock();
            if state.is_terminal() {
                return;
            }
            *state = new_state;
        }
        *self.shared.outcome.lock() = Some(outcome);
        self.shared.cond.notify_all();
        self.run_callbacks();
    }

    fn run_callbacks(&self) {
        let callbacks = std::mem::take(&mut *self.shared.callbacks.lock());
        if callbacks.is_empty() {
            return;
        }
        let result = Future { shared: self.shared.clone() }.peek_result();
        for cb in callbacks {
            // A callback error/panic must never affect other futures or the
            // pool; it is swallowed after being logged.
            if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(&result))) {
                let msg = crate::util::panic_str(&payload);
                tracing::error!(%msg, "future done-callback panicked, swallowed");
            }
        }
    }
}

impl Future {
    /// Current observable state.
    pub fn state(&self) -> State {
        self.shared.state.lock().clone()
    }

    /// True if the future reached a terminal state.
    pub fn done(&self) -> bool {
        self.state().is_terminal()
    }

    /// Attempt cancellation; only succeeds from `Pending`.
    pub fn cancel(&self) -> bool {
        let mut state = self.shared.state.lock();
        if *state == State::Pending {
            *state = State::Cancelled;
            drop(state);
            *self.shared.outcome.lock() = Some(Outcome::Cancelled);
            self.shared.cond.notify_all();
            true
        } else {
            false
        }
    }

    /// Block for the terminal transition, optionally bounded by `timeout`.
    ///
    /// Returns the value, re-raises the stored user error as [`PoolError::TaskFailed`],
    /// or fails with [`PoolError::TimedOut`] if `timeout` elapses first.
    pub fn result(&self, timeout: Option<Duration>) -> Result<serde_json::Value, PoolError> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut state = self.shared.state.lock();
        while !state.is_terminal() {
            match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(PoolError::TimedOut);
                    }
                    let timed_out = self.shared.cond.wait_for(&mut state, d - now).timed_out();
                    if timed_out && !state.is_terminal() {
                        return Err(PoolError::TimedOut);
                    }
                }
                None => self.shared.cond.wait(&mut state),
            }
        }
        drop(state);
        self.peek_result()
    }

    fn peek_result(&self) -> Result<serde_json::Value, PoolError> {
        match self.shared.outcome.lock().as_ref() {
            Some(Outcome::Ok(v)) => Ok(v.clone()),
            Some(Outcome::Err(e)) => Err(e.clone()),
            Some(Outcome::Cancelled) => Err(PoolError::Disconnected { reason: "task was cancelled".into() }),
            None => Err(PoolError::TimedOut),
        }
    }

    /// Register a callback that runs exactly once after the terminal
    /// transition. If the future is already terminal the callback runs
    /// immediately, inline.
    pub fn add_done_callback(&self, callback: impl FnOnce(&Result<serde_json::Value, PoolError>) + Send + 'static) {
        let mut state = self.shared.state.lock();
        if state.is_terminal() {
            drop(state);
            let result = self.peek_result();
            if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(&result))) {
                let msg = crate::util::panic_str(&payload);
                tracing::error!(%msg, "future done-callback panicked, swallowed");
            }
        } else {
            self.shared.callbacks.lock().push(Box::new(callback));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn resolve_is_single_assignment() {
        let (slot, future) = pending();
        slot.resolve_ok(serde_json::json!(1));
        slot.resolve_ok(serde_json::json!(2));
        assert_eq!(future.result(Some(Duration::from_millis(50))).unwrap(), serde_json::json!(1));
    }

    #[test]
    fn cancel_after_resolve_is_a_noop() {
        let (slot, future) = pending();
        slot.resolve_ok(serde_json::json!(42));
        assert!(!future.cancel());
        assert_eq!(future.state(), State::FinishedOk);
    }

    #[test]
    fn resolve_after_cancel_is_a_noop() {
        let (slot, future) = pending();
        assert!(future.cancel());
        slot.resolve_ok(serde_json::json!(42));
        assert_eq!(future.state(), State::Cancelled);
        assert!(matches!(future.result(Some(Duration::from_millis(50))), Err(PoolError::Disconnected { .. })));
    }

    #[test]
    fn cancel_only_succeeds_from_pending() {
        let (slot, future) = pending();
        slot.mark_running();
        assert!(!future.cancel());
        assert_eq!(future.state(), State::Running);
    }

    #[test]
    fn done_callback_fires_exactly_once() {
        let (slot, future) = pending();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_callback = calls.clone();
        future.add_done_callback(move |_| {
            calls_in_callback.fetch_add(1, Ordering::SeqCst);
        });
        slot.resolve_ok(serde_json::json!(1));
        slot.resolve_ok(serde_json::json!(2)); // second resolve is a no-op, must not re-fire
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn done_callback_runs_immediately_if_already_terminal() {
        let (slot, future) = pending();
        slot.resolve_ok(serde_json::json!(7));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_callback = calls.clone();
        future.add_done_callback(move |result| {
            assert_eq!(result.as_ref().unwrap(), &serde_json::json!(7));
            calls_in_callback.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn a_panicking_callback_is_swallowed() {
        let (slot, future) = pending();
        future.add_done_callback(|_| panic!("boom"));
        slot.resolve_ok(serde_json::json!(1)); // must not propagate the panic into resolve()
        assert_eq!(future.state(), State::FinishedOk);
    }
}
