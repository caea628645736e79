//! Error taxonomy for the channel and the pool.
//!
//! Mirrors the shape of `zng-task`'s hand-rolled `RunError` / `WorkerCrashError`:
//! plain enums, manual `Display`, no derive-macro error crate.

use core::fmt;
use std::sync::Arc;

/// Errors local to a single [`Channel`](crate::channel::Channel).
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum ChannelError {
    /// `recv` polled and nothing was readable within the given timeout.
    Empty,
    /// The peer is gone, or a lock acquisition (reader or writer) timed out,
    /// or a frame was malformed. Any of these mean the channel can no longer
    /// be trusted and the owning worker must be killed.
    Broken(Arc<BrokenReason>),
}
impl ChannelError {
    pub(crate) fn broken(reason: impl Into<String>) -> Self {
        ChannelError::Broken(Arc::new(BrokenReason(reason.into())))
    }
}
impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Empty => write!(f, "channel recv timed out, no frame pending"),
            ChannelError::Broken(r) => write!(f, "channel broken, {}", r.0),
        }
    }
}
impl std::error::Error for ChannelError {}

/// Opaque reason a channel reported [`ChannelError::Broken`].
#[derive(Debug)]
pub struct BrokenReason(String);
impl fmt::Display for BrokenReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors surfaced from [`Future::result`](crate::future::Future::result) and from
/// the [`Pool`](crate::pool::Pool) public API.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum PoolError {
    /// `Future::result(timeout)` or `Pool::join(timeout)` exceeded its local wait.
    TimedOut,
    /// The worker running this task exited unexpectedly (crash, signal, `exit`).
    ProcessExpired {
        /// Exit code if the OS reported one.
        exit_code: Option<i32>,
    },
    /// The user function raised/returned an error; the message is carried
    /// across the IPC boundary as a value, not unwound as a native panic.
    TaskFailed {
        /// Message captured from the worker-side error value.
        message: String,
    },
    /// `schedule` was called while the pool is not `RUNNING`.
    NotActive,
    /// `join` was called while the pool is still `RUNNING`.
    StillRunning,
    /// The pool is in the terminal `ERROR` state (initializer failure,
    /// supervisor loop death, or repeated channel deadlock).
    Disconnected {
        /// Human-readable reason the pool escalated to `ERROR`.
        reason: String,
    },
}
impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::TimedOut => write!(f, "timed out"),
            PoolError::ProcessExpired { exit_code } => match exit_code {
                Some(c) => write!(f, "worker process expired, exit code {c}"),
                None => write!(f, "worker process expired"),
            },
            PoolError::TaskFailed { message } => write!(f, "task failed, {message}"),
            PoolError::NotActive => write!(f, "pool is not active"),
            PoolError::StillRunning => write!(f, "pool is still running"),
            PoolError::Disconnected { reason } => write!(f, "pool is in the error state, {reason}"),
        }
    }
}
impl std::error::Error for PoolError {}

impl From<ChannelError> for PoolError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Empty => PoolError::TimedOut,
            ChannelError::Broken(r) => {
                tracing::debug!(reason = %r.0, "channel error converted to process-expired");
                PoolError::ProcessExpired { exit_code: None }
            }
        }
    }
}
