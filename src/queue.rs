//! FIFO task queue, the one cross-thread mutable structure inside the
//! supervisor. Built on `flume`, the same channel crate
//! `zng-task` uses throughout (e.g. `process::worker::Worker::run_request`'s
//! `channel::bounded(1)`).

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use crate::task::Task;

/// Single-producer-many-consumer FIFO of pending tasks.
pub struct TaskQueue {
    sender: flume::Sender<Task>,
    receiver: flume::Receiver<Task>,
    unfinished: AtomicUsize,
}
impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
impl TaskQueue {
    /// New, empty queue.
    pub fn new() -> Self {
        let (sender, receiver) = flume::unbounded();
        TaskQueue { sender, receiver, unfinished: AtomicUsize::new(0) }
    }

    /// Non-blocking enqueue; always succeeds (unbounded).
    pub fn put(&self, task: Task) {
        self.unfinished.fetch_add(1, Ordering::SeqCst);
        // the receiver is held by this same struct, so send never fails
        let _ = self.sender.send(task);
    }

    /// Blocking dequeue, bounded by `timeout`. `None` means no task was ready.
    pub fn get(&self, timeout: Duration) -> Option<Task> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Non-blocking dequeue, used by the dispatch loop's per-tick drain.
    pub fn try_get(&self) -> Option<Task> {
        self.receiver.try_recv().ok()
    }

    /// Called once a dequeued task's future has reached a terminal state.
    pub fn mark_done(&self) {
        self.unfinished.fetch_sub(1, Ordering::SeqCst);
    }

    /// `enqueued - marked_done`; used by `close()`/`join()` to detect drain completion.
    pub fn unfinished_tasks(&self) -> usize {
        self.unfinished.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{future::pending, registry::Args};

    fn dummy_task(id: u64) -> Task {
        let (slot, _future) = pending();
        Task::new(crate::task::TaskId::from_raw(id), "noop".into(), Args::default(), None, slot)
    }

    #[test]
    fn fifo_order() {
        let q = TaskQueue::new();
        q.put(dummy_task(1));
        q.put(dummy_task(2));
        q.put(dummy_task(3));
        let a = q.get(Duration::from_millis(10)).unwrap();
        let b = q.get(Duration::from_millis(10)).unwrap();
        let c = q.get(Duration::from_millis(10)).unwrap();
        assert_eq!((a.id.sequential(), b.id.sequential(), c.id.sequential()), (1, 2, 3));
    }

    #[test]
    fn unfinished_tracks_put_and_done() {
        let q = TaskQueue::new();
        assert_eq!(q.unfinished_tasks(), 0);
        q.put(dummy_task(1));
        assert_eq!(q.unfinished_tasks(), 1);
        let _ = q.get(Duration::from_millis(10));
        q.mark_done();
        assert_eq!(q.unfinished_tasks(), 0);
    }

    #[test]
    fn get_times_out_on_empty() {
        let q = TaskQueue::new();
        assert!(q.get(Duration::from_millis(10)).is_none());
    }
}
