//! The pool's lifecycle state machine: `CREATED -> RUNNING -> CLOSED ->
//! STOPPED`, with a sink `ERROR` state reachable from anywhere.
//! A tiny `Mutex<PoolState>` cell shared between the public [`Pool`] facade
//! and the supervisor thread, in the same spirit as `zng-task`'s small
//! `parking_lot::Mutex`-guarded shared cells.

use parking_lot::Mutex;

/// Observable lifecycle state of a [`Pool`](crate::pool::Pool).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Constructed, no workers spawned yet.
    Created,
    /// Accepting `schedule` calls, workers running.
    Running,
    /// No longer accepting new tasks; draining what's already queued/in flight.
    Closed,
    /// Fully drained (or force-stopped); all workers gone.
    Stopped,
    /// Terminal failure: an initializer crashed, or channel deadlocks repeated
    /// past the tolerance threshold. Every worker has been killed.
    Error,
}

pub(crate) struct PoolStateCell(Mutex<PoolState>);
impl PoolStateCell {
    pub(crate) fn new(initial: PoolState) -> Self {
        PoolStateCell(Mutex::new(initial))
    }

    pub(crate) fn get(&self) -> PoolState {
        *self.0.lock()
    }

    pub(crate) fn set(&self, state: PoolState) {
        let mut guard = self.0.lock();
        let from = *guard;
        if from != state {
            log_transition(from, state);
            *guard = state;
        }
    }

    /// Moves `from -> target`, but only if currently `from`. Returns whether
    /// the transition happened, so callers don't stomp a state set by
    /// another thread in the meantime (e.g. a concurrent `ERROR` escalation).
    pub(crate) fn transition(&self, from: PoolState, target: PoolState) -> bool {
        let mut guard = self.0.lock();
        if *guard == from {
            log_transition(from, target);
            *guard = target;
            true
        } else {
            false
        }
    }
}

fn log_transition(from: PoolState, to: PoolState) {
    if to == PoolState::Error {
        tracing::warn!(?from, ?to, "pool state transition");
    } else {
        tracing::debug!(?from, ?to, "pool state transition");
    }
}
