//! [`TaskManager`]: the supervisor's single background thread, combining
//! the dispatch/result loop and the timeout/health loop into one ticking
//! pass so there is exactly one place that touches worker channels — a
//! channel is driven by at most one thread at a time.
//!
//! The polling cadence (`sleep_unit`) and the escalate-to-`ERROR` threshold
//! come from `PoolConfig`. Structurally this is the `Worker`
//! draining loop from `zng-task`'s `process::worker` turned inside-out: there
//! the dedicated thread drains one worker's responses; here it round-robins
//! every worker each tick, since the pool supervises many of them.

use std::{collections::HashMap, sync::Arc, time::Instant};

use crate::{
    error::PoolError,
    manager::{ManagerConfig, WorkerManager},
    queue::TaskQueue,
    state::{PoolState, PoolStateCell},
    task::{Response, Task, TaskId},
};

#[derive(Clone)]
pub(crate) struct DispatchConfig {
    pub(crate) sleep_unit: std::time::Duration,
    /// Consecutive worker failures (channel deadlock or crash with a task in
    /// flight) the pool tolerates before escalating to `ERROR`.
    pub(crate) max_consecutive_failures: u32,
}

pub(crate) struct TaskManager {
    queue: Arc<TaskQueue>,
    manager: WorkerManager,
    pending: HashMap<TaskId, Task>,
    state: Arc<PoolStateCell>,
    config: DispatchConfig,
    consecutive_failures: u32,
}
impl TaskManager {
    pub(crate) fn new(queue: Arc<TaskQueue>, manager_config: ManagerConfig, state: Arc<PoolStateCell>, config: DispatchConfig) -> Self {
        TaskManager {
            queue,
            manager: WorkerManager::new(manager_config),
            pending: HashMap::new(),
            state,
            config,
            consecutive_failures: 0,
        }
    }

    /// Runs until the pool reaches `STOPPED` or `ERROR`. Meant to be the body
    /// of the supervisor's dedicated background thread.
    pub(crate) fn run(mut self) {
        loop {
            match self.state.get() {
                PoolState::Stopped | PoolState::Error => {
                    self.manager.stop_all();
                    self.fail_all_pending(PoolError::Disconnected { reason: "pool stopped".into() });
                    return;
                }
                PoolState::Created => {
                    // Unreachable in practice: `Pool::ensure_started` flips
                    // this to `Running` before spawning the thread that runs
                    // this loop. Kept so the match stays exhaustive.
                    std::thread::sleep(self.config.sleep_unit);
                    continue;
                }
                PoolState::Running | PoolState::Closed => {}
            }
            self.tick();
            if self.state.get() == PoolState::Closed && self.queue.unfinished_tasks() == 0 && self.pending.is_empty() {
                self.manager.stop_all();
                self.state.transition(PoolState::Closed, PoolState::Stopped);
                return;
            }
            if matches!(self.state.get(), PoolState::Running | PoolState::Closed) {
                std::thread::sleep(self.config.sleep_unit);
            }
        }
    }

    fn tick(&mut self) {
        for dead in self.manager.reap_dead() {
            if let Some(task_id) = dead.worker.current_task {
                self.finish_task(task_id, Err(PoolError::ProcessExpired { exit_code: dead.exit_status.and_then(exit_code) }));
                self.note_failure();
            } else if dead.exit_status.and_then(exit_code) == Some(crate::worker::INITIALIZER_FAILURE_EXIT_CODE) {
                // Never delivered any task (current_task is None), but its exit
                // code says it died reporting a failed initializer: the
                // `InitializerFailed` response itself must have failed to send.
                tracing::error!(worker_id = dead.id, "worker exited with an initializer-failure code before delivering a result, pool -> ERROR");
                self.state.set(PoolState::Error);
            }
        }

        for id in self.manager.recycle_exhausted() {
            tracing::debug!(worker_id = id, "worker recycled");
        }

        if matches!(self.state.get(), PoolState::Running) {
            for err in self.manager.ensure_workers() {
                tracing::warn!(%err, "could not maintain worker pool size");
            }
        }

        self.poll_idle_for_init_failure();
        self.dispatch_queued_tasks();
        self.poll_busy_workers();
        self.check_running_timeouts();

        if self.consecutive_failures >= self.config.max_consecutive_failures {
            tracing::error!(consecutive_failures = self.consecutive_failures, "too many consecutive worker failures, pool -> ERROR");
            self.state.set(PoolState::Error);
        }
    }

    fn poll_idle_for_init_failure(&mut self) {
        for id in self.manager.idle_worker_ids() {
            let Some(worker) = self.manager.get_mut(id) else { continue };
            match worker.try_recv(std::time::Duration::from_millis(0)) {
                Ok(Response::InitializerFailed { reason }) => {
                    tracing::error!(worker_id = id, %reason, "worker initializer failed, pool -> ERROR");
                    self.manager.kill_worker(id);
                    self.state.set(PoolState::Error);
                }
                Ok(_) => {} // stray response with nothing pending; nothing to do
                Err(_) => {}
            }
        }
    }

    fn dispatch_queued_tasks(&mut self) {
        for id in self.manager.idle_worker_ids() {
            let Some(mut task) = self.queue.try_get() else { break };
            if task.slot.is_cancelled() {
                self.queue.mark_done();
                continue;
            }
            task.slot.mark_running();
            let request = task.request();
            let Some(worker) = self.manager.get_mut(id) else {
                // Worker vanished between the id list and now; requeue the task.
                self.queue.put(task);
                continue;
            };
            match worker.dispatch(&request) {
                Ok(()) => {
                    task.dispatched = Some(crate::task::Dispatched { timestamp: Instant::now(), worker_id: id });
                    self.pending.insert(task.id, task);
                }
                Err(e) => {
                    tracing::warn!(worker_id = id, %e, "dispatch failed, channel broken");
                    self.manager.kill_worker(id);
                    self.finish_task_owned(task, Err(PoolError::ProcessExpired { exit_code: None }));
                    self.note_failure();
                }
            }
        }
    }

    fn poll_busy_workers(&mut self) {
        for id in self.manager.worker_ids() {
            let Some(worker) = self.manager.get_mut(id) else { continue };
            if worker.is_idle() {
                continue;
            }
            match worker.try_recv(std::time::Duration::from_millis(0)) {
                Ok(Response::Ok { id: task_id, value }) => {
                    self.finish_task(task_id, Ok(value));
                    self.consecutive_failures = 0;
                }
                Ok(Response::Err { id: task_id, error }) => {
                    self.finish_task(task_id, Err(PoolError::TaskFailed { message: error }));
                    self.consecutive_failures = 0;
                }
                Ok(Response::InitializerFailed { .. }) => {} // only expected before the first dispatch
                Err(crate::error::ChannelError::Empty) => {}
                Err(e) => {
                    tracing::warn!(worker_id = id, %e, "worker channel broken while awaiting result");
                    if let Some(worker) = self.manager.kill_worker(id) {
                        if let Some(task_id) = worker.current_task {
                            self.finish_task(task_id, Err(PoolError::ProcessExpired { exit_code: None }));
                        }
                    }
                    self.note_failure();
                }
            }
        }
    }

    fn check_running_timeouts(&mut self) {
        let now = Instant::now();
        let timed_out: Vec<TaskId> = self
            .pending
            .values()
            .filter_map(|task| {
                let timeout = task.timeout?;
                let dispatched = task.dispatched.as_ref()?;
                (now.duration_since(dispatched.timestamp) >= timeout).then_some(task.id)
            })
            .collect();
        for task_id in timed_out {
            let worker_id = self.pending.get(&task_id).and_then(|t| t.dispatched.as_ref()).map(|d| d.worker_id);
            if let Some(worker_id) = worker_id {
                tracing::info!(task_id = task_id.sequential(), worker_id, "task timed out, killing worker");
                self.manager.kill_worker(worker_id);
            }
            self.finish_task(task_id, Err(PoolError::TimedOut));
        }
    }

    fn finish_task(&mut self, id: TaskId, outcome: Result<serde_json::Value, PoolError>) {
        if let Some(task) = self.pending.remove(&id) {
            self.finish_task_owned(task, outcome);
        }
    }

    fn finish_task_owned(&mut self, task: Task, outcome: Result<serde_json::Value, PoolError>) {
        match outcome {
            Ok(value) => task.slot.resolve_ok(value),
            Err(err) => task.slot.resolve_err(err),
        }
        self.queue.mark_done();
    }

    fn fail_all_pending(&mut self, err: PoolError) {
        for (_, task) in self.pending.drain() {
            task.slot.resolve_err(err.clone());
            self.queue.mark_done();
        }
        while let Some(task) = self.queue.try_get() {
            task.slot.resolve_err(err.clone());
            self.queue.mark_done();
        }
    }

    fn note_failure(&mut self) {
        self.consecutive_failures += 1;
    }
}

fn exit_code(status: std::process::ExitStatus) -> Option<i32> {
    status.code()
}
