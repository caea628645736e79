//! [`Pool`]: the public supervisor facade.
//!
//! The first [`Pool::schedule`] or [`Pool::active`] call spawns the one
//! dedicated background thread that runs [`TaskManager::run`], the same
//! "own a background thread, talk to it through shared state" shape
//! `zng-task`'s `process::worker::Worker` uses for its response-draining
//! thread.

use std::{
    path::PathBuf,
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use serde_json::Value;

use crate::{
    dispatch::{DispatchConfig, TaskManager},
    error::PoolError,
    future::{pending, Future},
    manager::ManagerConfig,
    queue::TaskQueue,
    registry::{Args, FunctionRegistry},
    state::{PoolState, PoolStateCell},
    task::{Task, TaskIdSource},
    worker::WorkerSpawnConfig,
};

/// Tunables for a [`Pool`]. Build one with [`PoolBuilder`].
#[derive(Clone)]
pub struct PoolConfig {
    /// Number of worker processes to keep alive. Defaults to the number of
    /// available CPUs, matching the host language's `os.cpu_count()` default.
    pub max_workers: usize,
    /// A worker process is recycled after running this many tasks. `None`
    /// (the default) means a worker runs indefinitely.
    pub max_tasks_per_worker: Option<u32>,
    /// How long the supervisor waits for a freshly spawned worker to connect
    /// before treating the spawn as failed.
    pub connect_timeout: Duration,
    /// Upper bound on acquiring a channel's reader/writer lock; exceeding it
    /// is the signal a peer died mid-frame.
    pub lock_timeout: Duration,
    /// Polling cadence of the supervisor's dispatch/health loop.
    pub sleep_unit: Duration,
    /// Grace period between SIGTERM and SIGKILL when a worker is stopped.
    pub kill_grace: Duration,
    /// Consecutive worker failures (channel deadlock or crash mid-task)
    /// tolerated before the pool escalates to `ERROR`.
    pub max_consecutive_failures: u32,
    /// Positional arguments passed to the registry's initializer in every
    /// worker process, once, before it accepts its first task.
    pub initargs: Vec<Value>,
    /// Executable re-exec'd into each worker process. `None` (the default)
    /// means "the currently running binary", which is the right choice for
    /// any application that calls [`crate::run_worker`] first thing in its
    /// own `main`.
    pub worker_exe: Option<PathBuf>,
}
impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_workers: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            max_tasks_per_worker: None,
            connect_timeout: Duration::from_secs(10),
            lock_timeout: Duration::from_secs(60),
            sleep_unit: Duration::from_millis(100),
            kill_grace: Duration::from_secs(2),
            max_consecutive_failures: 3,
            initargs: Vec::new(),
            worker_exe: None,
        }
    }
}

/// Builder for [`PoolConfig`] plus the function registry, mirroring the
/// builder style `FunctionRegistry::register`/`initializer` already use.
#[derive(Default)]
pub struct PoolBuilder {
    config: PoolConfig,
    registry: FunctionRegistry,
}
impl PoolBuilder {
    pub fn new(registry: FunctionRegistry) -> Self {
        PoolBuilder { config: PoolConfig::default(), registry }
    }

    pub fn max_workers(mut self, n: usize) -> Self {
        self.config.max_workers = n.max(1);
        self
    }

    pub fn max_tasks_per_worker(mut self, n: u32) -> Self {
        self.config.max_tasks_per_worker = Some(n);
        self
    }

    pub fn connect_timeout(mut self, d: Duration) -> Self {
        self.config.connect_timeout = d;
        self
    }

    pub fn lock_timeout(mut self, d: Duration) -> Self {
        self.config.lock_timeout = d;
        self
    }

    pub fn sleep_unit(mut self, d: Duration) -> Self {
        self.config.sleep_unit = d;
        self
    }

    pub fn initargs(mut self, args: Vec<Value>) -> Self {
        self.config.initargs = args;
        self
    }

    pub fn worker_exe(mut self, path: PathBuf) -> Self {
        self.config.worker_exe = Some(path);
        self
    }

    pub fn build(self) -> Pool {
        Pool::new(self.registry, self.config)
    }
}

/// A process-based worker pool.
///
/// Cloning is not supported; share a `Pool` across threads behind an `Arc`
/// if more than one caller needs to `schedule` against it.
///
/// No worker process is forked at construction; the pool starts `CREATED`
/// and only forks its workers and spawns the supervisor thread on the first
/// [`Pool::schedule`] or [`Pool::active`] call.
pub struct Pool {
    queue: Arc<TaskQueue>,
    state: Arc<PoolStateCell>,
    ids: TaskIdSource,
    registry: FunctionRegistry,
    manager_config: ManagerConfig,
    dispatch_config: DispatchConfig,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}
impl Pool {
    /// Builds a pool in the `CREATED` state. No worker process is forked and
    /// no supervisor thread is spawned until the pool is first used.
    pub fn new(registry: FunctionRegistry, config: PoolConfig) -> Pool {
        let queue = Arc::new(TaskQueue::new());
        let state = Arc::new(PoolStateCell::new(PoolState::Created));

        let exe = config
            .worker_exe
            .clone()
            .or_else(|| std::env::current_exe().ok())
            .expect("could not resolve a worker executable path");
        let manager_config = ManagerConfig {
            max_workers: config.max_workers,
            kill_grace: config.kill_grace,
            spawn: WorkerSpawnConfig {
                exe,
                connect_timeout: config.connect_timeout,
                lock_timeout: config.lock_timeout,
                max_tasks: config.max_tasks_per_worker,
                initargs: config.initargs.clone(),
            },
        };
        let dispatch_config = DispatchConfig { sleep_unit: config.sleep_unit, max_consecutive_failures: config.max_consecutive_failures };

        Pool {
            queue,
            state,
            ids: TaskIdSource::default(),
            registry,
            manager_config,
            dispatch_config,
            supervisor: Mutex::new(None),
        }
    }

    /// Forks the workers and spawns the supervisor thread exactly once, the
    /// first time the pool is actually used. A no-op on every call after the
    /// first, and on a pool that's already past `CREATED` (closed, stopped,
    /// or errored before ever being used).
    fn ensure_started(&self) {
        if !self.state.transition(PoolState::Created, PoolState::Running) {
            return;
        }
        let task_manager = TaskManager::new(self.queue.clone(), self.manager_config.clone(), self.state.clone(), self.dispatch_config.clone());
        let handle = std::thread::Builder::new()
            .name("procpool-supervisor".into())
            .spawn(move || task_manager.run())
            .expect("failed to spawn procpool supervisor thread");
        *self.supervisor.lock() = Some(handle);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PoolState {
        self.state.get()
    }

    /// True iff the pool is `RUNNING` or `CLOSED` (still draining). Querying
    /// this is, like `schedule`, enough to trigger the pool's first start.
    pub fn active(&self) -> bool {
        self.ensure_started();
        matches!(self.state(), PoolState::Running | PoolState::Closed)
    }

    /// Enqueues a call to `function` with `args`, returning a handle to its
    /// eventual result. Fails fast with [`PoolError::NotActive`] if the pool
    /// is not `RUNNING`, or immediately if `function` is unknown.
    pub fn schedule(&self, function: impl Into<String>, args: Args, timeout: Option<Duration>) -> Result<Future, PoolError> {
        self.ensure_started();
        let function = function.into();
        match self.state() {
            PoolState::Running => {}
            PoolState::Error => return Err(PoolError::Disconnected { reason: "pool is in the error state".into() }),
            _ => return Err(PoolError::NotActive),
        }
        if !self.registry.contains(&function) {
            return Err(PoolError::TaskFailed { message: format!("no function registered under name {function:?}") });
        }

        let id = self.ids.next();
        let (slot, future) = pending();
        self.queue.put(Task::new(id, function, args, timeout, slot));
        Ok(future)
    }

    /// Stops accepting new tasks; already-queued and in-flight tasks still
    /// run to completion. The supervisor thread transitions the pool to
    /// `STOPPED` once drained. A pool that was never started (nothing was
    /// ever scheduled or queried) also moves to `CLOSED`; [`Pool::join`]
    /// finalizes it to `STOPPED` directly since there's no supervisor thread
    /// to do it.
    pub fn close(&self) {
        tracing::info!("pool close() called");
        if self.state.transition(PoolState::Created, PoolState::Closed) {
            return;
        }
        self.state.transition(PoolState::Running, PoolState::Closed);
    }

    /// Immediately kills every worker and fails every queued/in-flight task
    /// with [`PoolError::Disconnected`]. Idempotent; a no-op once the pool
    /// has reached `STOPPED` or `ERROR`.
    pub fn stop(&self) {
        tracing::info!("pool stop() called");
        loop {
            let current = self.state.get();
            if matches!(current, PoolState::Stopped | PoolState::Error) {
                return;
            }
            if self.state.transition(current, PoolState::Stopped) {
                return;
            }
        }
    }

    /// Blocks until the supervisor thread exits (pool reached `STOPPED` or
    /// `ERROR`), bounded by `timeout`. Must be called after [`Pool::close`]
    /// or [`Pool::stop`]; returns [`PoolError::StillRunning`] otherwise.
    pub fn join(&mut self, timeout: Option<Duration>) -> Result<(), PoolError> {
        if self.state() == PoolState::Running {
            return Err(PoolError::StillRunning);
        }
        let Some(handle) = self.supervisor.lock().take() else {
            // Never started (closed/stopped before first use): nothing to
            // drain or join, but an ERROR pool must stay ERROR.
            if self.state() != PoolState::Error {
                self.state.set(PoolState::Stopped);
            }
            return Ok(());
        };
        if handle.is_finished() {
            return handle.join().map_err(|_| PoolError::Disconnected { reason: "supervisor thread panicked".into() });
        }
        match timeout {
            None => handle.join().map_err(|_| PoolError::Disconnected { reason: "supervisor thread panicked".into() }),
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    if handle.is_finished() {
                        return handle.join().map_err(|_| PoolError::Disconnected { reason: "supervisor thread panicked".into() });
                    }
                    if Instant::now() >= deadline {
                        *self.supervisor.lock() = Some(handle);
                        return Err(PoolError::TimedOut);
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }
    }
}
impl Drop for Pool {
    fn drop(&mut self) {
        if self.state() != PoolState::Stopped {
            self.stop();
        }
        if let Some(handle) = self.supervisor.lock().take() {
            let _ = handle.join();
        }
    }
}
