//! End-to-end tests against the `procpool_test_worker` binary.
//!
//! Run with `cargo test --features test-util` — the worker binary and the
//! lock-poisoning hooks these tests use are both gated behind that feature.

use std::time::Duration;

use procpool::{Args, FunctionRegistry, PoolBuilder, PoolError, PoolState};
use serde_json::Value;

/// Names must match `src/bin/procpool_test_worker.rs`'s registry; the
/// handlers here never run (the worker process runs its own copy), they
/// only need to exist so `Pool::schedule` doesn't reject the name.
fn test_registry() -> FunctionRegistry {
    let stub = |_: &Args| Ok(Value::Null);
    FunctionRegistry::new()
        .register("add", stub)
        .register("sum", stub)
        .register("raise", stub)
        .register("sleep_ms", stub)
        .register("os_exit", stub)
        .register("poison_writer_lock", stub)
        .register("poison_reader_lock", stub)
}

fn worker_exe() -> std::path::PathBuf {
    std::path::PathBuf::from(env!("CARGO_BIN_EXE_procpool_test_worker"))
}

/// Installs a `tracing` subscriber once so `RUST_LOG=debug cargo test -- --nocapture`
/// shows the supervisor's state-transition and dispatch traces.
fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).with_test_writer().try_init();
    });
}

fn builder() -> PoolBuilder {
    init_tracing();
    PoolBuilder::new(test_registry())
        .worker_exe(worker_exe())
        .connect_timeout(Duration::from_secs(5))
        .lock_timeout(Duration::from_millis(300))
        .sleep_unit(Duration::from_millis(20))
}

#[test]
fn add_round_trips_through_a_worker() {
    let pool = builder().max_workers(2).build();
    let future = pool.schedule("add", Args::positional(vec![2.into(), 3.into()]), None).unwrap();
    assert_eq!(future.result(Some(Duration::from_secs(5))).unwrap(), 5);
}

#[test]
fn sum_handles_many_args() {
    let pool = builder().max_workers(2).build();
    let future = pool.schedule("sum", Args::positional(vec![1.into(), 2.into(), 3.into(), 4.into()]), None).unwrap();
    assert_eq!(future.result(Some(Duration::from_secs(5))).unwrap(), 10);
}

#[test]
fn a_raised_error_surfaces_as_task_failed() {
    let pool = builder().max_workers(1).build();
    let future = pool.schedule("raise", Args::positional(vec!["nope".into()]), None).unwrap();
    let err = future.result(Some(Duration::from_secs(5))).unwrap_err();
    assert!(matches!(err, PoolError::TaskFailed { message } if message == "nope"));
}

#[test]
fn a_task_exceeding_its_timeout_is_killed_and_reported() {
    let pool = builder().max_workers(1).build();
    let future = pool.schedule("sleep_ms", Args::positional(vec![2000.into()]), Some(Duration::from_millis(100))).unwrap();
    let err = future.result(Some(Duration::from_secs(5))).unwrap_err();
    assert!(matches!(err, PoolError::TimedOut));

    // the pool must still be usable afterwards; the worker was recycled, not the whole pool
    let future = pool.schedule("add", Args::positional(vec![1.into(), 1.into()]), None).unwrap();
    assert_eq!(future.result(Some(Duration::from_secs(5))).unwrap(), 2);
}

#[test]
fn more_tasks_than_max_workers_all_complete() {
    let pool = builder().max_workers(2).build();
    let futures: Vec<_> = (0..8)
        .map(|i| pool.schedule("add", Args::positional(vec![i.into(), 1.into()]), None).unwrap())
        .collect();
    for (i, future) in futures.into_iter().enumerate() {
        assert_eq!(future.result(Some(Duration::from_secs(5))).unwrap(), i as i64 + 1);
    }
}

#[test]
fn workers_are_recycled_after_max_tasks() {
    let pool = builder().max_workers(1).max_tasks_per_worker(2).build();
    for i in 0..6 {
        let future = pool.schedule("add", Args::positional(vec![i.into(), 0.into()]), None).unwrap();
        assert_eq!(future.result(Some(Duration::from_secs(5))).unwrap(), i);
    }
}

#[test]
fn a_worker_that_exits_abruptly_fails_its_task_as_process_expired() {
    let pool = builder().max_workers(1).build();
    let future = pool.schedule("os_exit", Args::positional(vec![17.into()]), None).unwrap();
    let err = future.result(Some(Duration::from_secs(5))).unwrap_err();
    assert!(matches!(err, PoolError::ProcessExpired { .. }));
}

#[test]
fn a_failing_initializer_drives_the_pool_to_error() {
    let pool = builder().max_workers(1).initargs(vec![true.into()]).build();
    // `active()` is what forks the worker in the first place; nothing
    // happens until the pool is actually queried or scheduled against.
    assert!(pool.active());
    // give the worker a moment to spawn, fail init, and report it
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(pool.state(), PoolState::Error);
    assert!(matches!(pool.schedule("add", Args::positional(vec![1.into(), 1.into()]), None), Err(PoolError::Disconnected { .. })));
}

#[test]
fn a_pool_does_not_fork_workers_until_first_used() {
    let pool = builder().max_workers(2).build();
    assert_eq!(pool.state(), PoolState::Created);
    std::thread::sleep(Duration::from_millis(200));
    // still CREATED: nothing forked anything yet
    assert_eq!(pool.state(), PoolState::Created);

    let future = pool.schedule("add", Args::positional(vec![1.into(), 1.into()]), None).unwrap();
    assert_eq!(future.result(Some(Duration::from_secs(5))).unwrap(), 2);
}

#[test]
fn active_is_true_while_closed_and_draining() {
    let mut pool = builder().max_workers(1).build();
    let future = pool.schedule("sleep_ms", Args::positional(vec![200.into()]), None).unwrap();
    pool.close();
    assert!(pool.active()); // CLOSED still counts as active while it drains
    assert_eq!(future.result(Some(Duration::from_secs(5))).unwrap(), Value::Null);

    pool.join(Some(Duration::from_secs(5))).unwrap();
    assert!(!pool.active()); // STOPPED
}

#[test]
fn a_worker_holding_the_writer_lock_when_it_dies_is_detected_via_timeout() {
    let pool = builder().max_workers(1).build();
    // The handler leaves the writer lock file behind before returning, so the
    // worker's own reply to *this* task is what finds the lock already held:
    // the channel is symmetric (whichever side is currently sending takes the
    // writer lock), so a worker that dies mid-write is indistinguishable from
    // one that can't complete the write of its own response.
    let poisoning = pool.schedule("poison_writer_lock", Args::default(), None).unwrap();
    let err = poisoning.result(Some(Duration::from_secs(5))).unwrap_err();
    assert!(matches!(err, PoolError::ProcessExpired { .. }));

    // the pool recovers with a freshly spawned worker
    let next = pool.schedule("add", Args::positional(vec![1.into(), 1.into()]), None).unwrap();
    assert_eq!(next.result(Some(Duration::from_secs(5))).unwrap(), 2);
}

#[test]
fn a_worker_holding_the_reader_lock_when_it_dies_is_detected_via_timeout() {
    let pool = builder().max_workers(1).build();
    // The handler leaves the reader lock file behind before returning; the
    // worker sends its reply fine (that uses the writer lock), but the
    // supervisor's own consumption of that same reply is what finds the
    // reader lock already held, so this task's own round trip times out.
    let poisoning = pool.schedule("poison_reader_lock", Args::default(), None).unwrap();
    let err = poisoning.result(Some(Duration::from_secs(5))).unwrap_err();
    assert!(matches!(err, PoolError::ProcessExpired { .. }));

    let next = pool.schedule("add", Args::positional(vec![1.into(), 1.into()]), None).unwrap();
    assert_eq!(next.result(Some(Duration::from_secs(5))).unwrap(), 2);
}

#[test]
fn close_then_join_drains_outstanding_work_before_stopping() {
    let mut pool = builder().max_workers(2).build();
    let futures: Vec<_> = (0..4)
        .map(|i| pool.schedule("add", Args::positional(vec![i.into(), 10.into()]), None).unwrap())
        .collect();
    pool.close();
    assert!(matches!(pool.schedule("add", Args::positional(vec![0.into(), 0.into()]), None), Err(PoolError::NotActive)));

    pool.join(Some(Duration::from_secs(10))).unwrap();
    assert_eq!(pool.state(), PoolState::Stopped);
    for (i, future) in futures.into_iter().enumerate() {
        assert_eq!(future.result(Some(Duration::from_secs(1))).unwrap(), i as i64 + 10);
    }
}
