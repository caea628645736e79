//! Dedicated worker entrypoint for `tests/pool_e2e.rs`.
//!
//! The integration test binary's `main` is generated by the test harness and
//! can't double as a worker process (re-exec'ing the same executable assumes
//! an application that calls [`procpool::run_worker`] first thing in its own
//! `main`), so tests point `PoolConfig::worker_exe` at this small binary
//! instead.

use procpool::{Args, FunctionRegistry};
use serde_json::Value;

fn registry() -> FunctionRegistry {
    FunctionRegistry::new()
        .register("add", |args: &Args| {
            let a = args.args[0].as_i64().unwrap_or(0);
            let b = args.args[1].as_i64().unwrap_or(0);
            Ok(Value::from(a + b))
        })
        .register("sum", |args: &Args| {
            let total: i64 = args.args.iter().filter_map(Value::as_i64).sum();
            Ok(Value::from(total))
        })
        .register("raise", |args: &Args| {
            let message = args.args.first().and_then(Value::as_str).unwrap_or("boom").to_owned();
            Err(message)
        })
        .register("sleep_ms", |args: &Args| {
            let ms = args.args.first().and_then(Value::as_u64).unwrap_or(0);
            std::thread::sleep(std::time::Duration::from_millis(ms));
            Ok(Value::Null)
        })
        .register("os_exit", |args: &Args| {
            let code = args.args.first().and_then(Value::as_i64).unwrap_or(1) as i32;
            std::process::exit(code);
        })
        // These two leave a lock file behind before returning, exactly what a
        // real crash mid-frame would leave: the reply to *this same* task is
        // what finds the lock already held and times out.
        .register("poison_writer_lock", |_args: &Args| {
            if let Ok(sock) = std::env::var("PROCPOOL_SOCK") {
                procpool::testing::poison_writer_lock(std::path::Path::new(&sock));
            }
            Ok(Value::Null)
        })
        .register("poison_reader_lock", |_args: &Args| {
            if let Ok(sock) = std::env::var("PROCPOOL_SOCK") {
                procpool::testing::poison_reader_lock(std::path::Path::new(&sock));
            }
            Ok(Value::Null)
        })
        .initializer(|initargs: &[Value]| {
            if initargs.first().and_then(Value::as_bool) == Some(true) {
                return Err("initializer deliberately failed".into());
            }
            Ok(())
        })
}

fn main() {
    procpool::run_worker(registry());
    // Only reached if this binary was launched directly, outside a pool.
    eprintln!("procpool_test_worker is meant to be spawned by a Pool, not run directly");
    std::process::exit(2);
}
