//! A process-based worker pool: a fixed set of subprocess workers, a FIFO
//! task queue, and single-assignment futures for results — the same shape as
//! `multiprocessing.Pool`, expressed with OS processes, `serde_json::Value`
//! payloads, and a name-keyed function registry instead of pickled closures.
//!
//! ```no_run
//! use procpool::{Args, FunctionRegistry, PoolBuilder};
//!
//! fn registry() -> FunctionRegistry {
//!     FunctionRegistry::new().register("add", |args: &Args| {
//!         let a = args.args[0].as_i64().unwrap_or(0);
//!         let b = args.args[1].as_i64().unwrap_or(0);
//!         Ok((a + b).into())
//!     })
//! }
//!
//! fn main() {
//!     procpool::run_worker(registry());
//!
//!     let pool = PoolBuilder::new(registry()).max_workers(4).build();
//!     let future = pool.schedule("add", Args::positional(vec![1.into(), 2.into()]), None).unwrap();
//!     assert_eq!(future.result(None).unwrap(), 3);
//! }
//! ```

mod channel;
mod dispatch;
mod error;
mod future;
mod manager;
mod queue;
mod registry;
mod state;
mod task;
mod worker;

pub mod pool;

pub use error::{ChannelError, PoolError};
pub use future::{Future, State};
pub use pool::{Pool, PoolBuilder, PoolConfig};
pub use registry::{Args, FunctionRegistry};
pub use state::PoolState;
pub use task::TaskFuture;
pub use worker::run_worker;

#[cfg(any(test, feature = "test-util"))]
pub use channel::testing;
