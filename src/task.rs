//! [`Task`]: an enqueued unit of work plus its wire-level request/response
//! envelopes.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    future::{Future, FutureSlot},
    registry::Args,
};

/// Monotonically increasing task identifier, unique within one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(u64);
impl TaskId {
    pub(crate) fn sequential(self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(id: u64) -> Self {
        TaskId(id)
    }
}

#[derive(Default)]
pub(crate) struct TaskIdSource(std::sync::atomic::AtomicU64);
impl TaskIdSource {
    pub(crate) fn next(&self) -> TaskId {
        TaskId(self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
    }
}

/// A unit of work submitted to the pool.
///
/// Invariant: a task has a `Dispatched` stamp if and only if it has been
/// sent to a worker.
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) function: String,
    pub(crate) args: Args,
    /// `None` means no timeout.
    pub(crate) timeout: Option<Duration>,
    pub(crate) slot: FutureSlot,
    /// Set when dispatched to a worker.
    pub(crate) dispatched: Option<Dispatched>,
}
pub(crate) struct Dispatched {
    pub(crate) timestamp: Instant,
    pub(crate) worker_id: u64,
}
impl Task {
    pub(crate) fn new(id: TaskId, function: String, args: Args, timeout: Option<Duration>, slot: FutureSlot) -> Self {
        Task { id, function, args, timeout, slot, dispatched: None }
    }

    pub(crate) fn request(&self) -> Request {
        Request { id: self.id, function: self.function.clone(), args: self.args.clone() }
    }
}

/// Wire envelope: supervisor -> worker.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Request {
    pub id: TaskId,
    pub function: String,
    pub args: Args,
}

/// Wire envelope: worker -> supervisor.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum Response {
    Ok { id: TaskId, value: Value },
    Err { id: TaskId, error: String },
    InitializerFailed { reason: String },
}

/// A handle returned by [`Pool::schedule`](crate::pool::Pool::schedule).
///
/// Thin re-export of [`crate::future::Future`] kept under this name so the
/// public API reads `schedule(...) -> Future`.
pub type TaskFuture = Future;
