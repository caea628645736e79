//! [`WorkerManager`]: spawns, tracks, recycles, and reaps worker processes.
//! The shape mirrors the polkadot-sdk pvf execute queue's
//! `Workers`/`purge_dead`/`spawn_extra_worker` split (`execute-queue.rs`),
//! adapted from a `HopSlotMap` to a plain `HashMap` keyed by a sequential id
//! since this pool has no priority queue to interleave against.

use std::{
    collections::HashMap,
    process::ExitStatus,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use crate::worker::{Worker, WorkerSpawnConfig};

/// Static knobs the manager needs across every worker it spawns.
#[derive(Clone)]
pub(crate) struct ManagerConfig {
    pub(crate) max_workers: usize,
    pub(crate) spawn: WorkerSpawnConfig,
    pub(crate) kill_grace: Duration,
}

/// A worker that exited, surfaced to the task manager so it can fail the
/// worker's in-flight task (if any) before the slot is recycled.
pub(crate) struct DeadWorker {
    pub(crate) id: u64,
    pub(crate) exit_status: Option<ExitStatus>,
    pub(crate) worker: Worker,
}

pub(crate) struct WorkerManager {
    workers: HashMap<u64, Worker>,
    next_id: AtomicU64,
    config: ManagerConfig,
}
impl WorkerManager {
    pub(crate) fn new(config: ManagerConfig) -> Self {
        WorkerManager { workers: HashMap::new(), next_id: AtomicU64::new(1), config }
    }

    /// Spawns workers until `max_workers` are tracked. Returns the ids of
    /// workers that failed to spawn this round (the caller decides whether
    /// that's fatal); a spawn failure never panics the supervisor loop.
    pub(crate) fn ensure_workers(&mut self) -> Vec<std::io::Error> {
        let mut errors = Vec::new();
        while self.workers.len() < self.config.max_workers {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            match Worker::spawn(id, &self.config.spawn) {
                Ok(worker) => {
                    tracing::debug!(worker_id = id, pid = worker.pid(), "spawned worker");
                    self.workers.insert(id, worker);
                }
                Err(e) => {
                    tracing::warn!(worker_id = id, %e, "failed to spawn worker");
                    errors.push(e);
                    break;
                }
            }
        }
        errors
    }

    pub(crate) fn get_mut(&mut self, id: u64) -> Option<&mut Worker> {
        self.workers.get_mut(&id)
    }

    pub(crate) fn idle_worker_ids(&self) -> Vec<u64> {
        self.workers.iter().filter(|(_, w)| w.is_idle()).map(|(id, _)| *id).collect()
    }

    pub(crate) fn worker_ids(&self) -> Vec<u64> {
        self.workers.keys().copied().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.workers.len()
    }

    /// Reaps workers whose process has exited on its own (crash, `os._exit`,
    /// a normal `max_tasks`-triggered exit codepath that beat recycling).
    pub(crate) fn reap_dead(&mut self) -> Vec<DeadWorker> {
        let mut dead = Vec::new();
        let dead_ids: Vec<u64> = self
            .workers
            .iter_mut()
            .filter_map(|(id, w)| match w.try_wait() {
                Ok(Some(_)) => Some(*id),
                _ => None,
            })
            .collect();
        for id in dead_ids {
            if let Some(mut worker) = self.workers.remove(&id) {
                let exit_status = worker.try_wait().ok().flatten();
                tracing::info!(worker_id = id, ?exit_status, "worker process exited");
                dead.push(DeadWorker { id, exit_status, worker });
            }
        }
        dead
    }

    /// Removes an idle worker that has run `max_tasks` requests, so the next
    /// `ensure_workers` call replaces it with a fresh process.
    pub(crate) fn recycle_exhausted(&mut self) -> Vec<u64> {
        let exhausted: Vec<u64> = self.workers.iter().filter(|(_, w)| w.is_idle() && w.exhausted()).map(|(id, _)| *id).collect();
        for id in &exhausted {
            if let Some(mut worker) = self.workers.remove(id) {
                tracing::debug!(worker_id = id, "recycling worker after max_tasks");
                worker.terminate(self.config.kill_grace);
            }
        }
        exhausted
    }

    /// Forcibly removes and kills one worker (channel deadlock, timeout
    /// kill, or initializer failure). Returns it so the caller can inspect
    /// `current_task` before it's dropped.
    pub(crate) fn kill_worker(&mut self, id: u64) -> Option<Worker> {
        let mut worker = self.workers.remove(&id)?;
        worker.terminate(self.config.kill_grace);
        Some(worker)
    }

    /// Terminates every tracked worker (pool `close`/`stop`/`ERROR`).
    pub(crate) fn stop_all(&mut self) {
        for (id, mut worker) in self.workers.drain() {
            tracing::debug!(worker_id = id, "stopping worker");
            worker.terminate(self.config.kill_grace);
        }
    }
}
