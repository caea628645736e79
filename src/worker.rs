//! One worker: the supervisor-side process handle plus the worker-side
//! entrypoint that turns the same executable into that process.
//!
//! Grounded on `zng-task`'s `process::worker` module: re-exec the current
//! binary with environment variables marking the child as a worker
//! (`WORKER_VERSION`/`WORKER_SERVER`/`WORKER_NAME` there, `PROCPOOL_*` here),
//! and a free function the embedding `main()` calls first so a worker child
//! never falls through to the application's own startup code.

use std::{
    io,
    os::unix::net::UnixListener,
    path::PathBuf,
    process::{Child, Command, ExitStatus},
    time::{Duration, Instant},
};

use serde_json::Value;

use crate::{
    channel::Channel,
    error::ChannelError,
    registry::FunctionRegistry,
    task::{Request, Response, TaskId},
};

/// Exit code a worker uses when it dies because its initializer failed,
/// whether or not it managed to deliver [`Response::InitializerFailed`]
/// first. Distinct from the generic `exit(1)` used for channel breakage, so
/// a dead idle worker (one that never got a task, hence no result to fail)
/// can still be told apart from an ordinary crash.
pub(crate) const INITIALIZER_FAILURE_EXIT_CODE: i32 = 65;

/// Knobs a [`crate::manager::WorkerManager`] applies to every worker it spawns.
#[derive(Clone)]
pub(crate) struct WorkerSpawnConfig {
    /// The executable re-exec'd into a worker. Defaults to the running
    /// binary itself, but can point at a separate binary — e.g.
    /// a test harness can't double as a worker entrypoint, since its `main`
    /// is generated by the test framework, so it spawns a small dedicated
    /// binary instead (see `tests/pool_e2e.rs`).
    pub(crate) exe: PathBuf,
    pub(crate) connect_timeout: Duration,
    pub(crate) lock_timeout: Duration,
    pub(crate) max_tasks: Option<u32>,
    pub(crate) initargs: Vec<Value>,
}

/// The supervisor's handle to one worker process.
pub(crate) struct Worker {
    pub(crate) id: u64,
    child: Child,
    channel: Channel,
    sock_path: PathBuf,
    max_tasks: Option<u32>,
    tasks_run: u32,
    pub(crate) current_task: Option<TaskId>,
    pub(crate) busy_since: Option<Instant>,
}
impl Worker {
    pub(crate) fn spawn(id: u64, config: &WorkerSpawnConfig) -> io::Result<Worker> {
        let sock_path = std::env::temp_dir().join(format!("procpool-{}-{id}.sock", std::process::id()));
        let _ = std::fs::remove_file(&sock_path);
        let listener = UnixListener::bind(&sock_path)?;

        let mut cmd = Command::new(&config.exe);
        cmd.env("PROCPOOL_WORKER", "1")
            .env("PROCPOOL_WORKER_VERSION", env!("CARGO_PKG_VERSION"))
            .env("PROCPOOL_SOCK", &sock_path)
            .env("PROCPOOL_LOCK_TIMEOUT_MS", config.lock_timeout.as_millis().to_string())
            .env("PROCPOOL_INITARGS", serde_json::to_string(&config.initargs).unwrap_or_else(|_| "[]".into()));
        if let Some(max) = config.max_tasks {
            cmd.env("PROCPOOL_MAX_TASKS", max.to_string());
        }

        let child = cmd.spawn()?;
        let accept_result = Channel::accept(&listener, config.connect_timeout, &sock_path, config.lock_timeout);
        drop(listener);
        let channel = match accept_result {
            Ok(c) => c,
            Err(e) => {
                let mut child = child;
                let _ = child.kill();
                let _ = child.wait();
                cleanup_sock(&sock_path);
                return Err(e);
            }
        };

        Ok(Worker {
            id,
            child,
            channel,
            sock_path,
            max_tasks: config.max_tasks,
            tasks_run: 0,
            current_task: None,
            busy_since: None,
        })
    }

    /// True once `max_tasks` worth of requests have been dispatched; the
    /// manager recycles a worker reaching this instead of reusing it again.
    pub(crate) fn exhausted(&self) -> bool {
        matches!(self.max_tasks, Some(max) if self.tasks_run >= max)
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.current_task.is_none()
    }

    pub(crate) fn pid(&self) -> u32 {
        self.child.id()
    }

    pub(crate) fn dispatch(&mut self, request: &Request) -> Result<(), ChannelError> {
        self.channel.send_value(request)?;
        self.current_task = Some(request.id);
        self.busy_since = Some(Instant::now());
        self.tasks_run += 1;
        Ok(())
    }

    /// Poll for this worker's next response, bounded by `timeout`.
    /// `Err(ChannelError::Empty)` just means nothing has arrived yet.
    pub(crate) fn try_recv(&mut self, timeout: Duration) -> Result<Response, ChannelError> {
        let response = self.channel.recv_value(timeout)?;
        self.current_task = None;
        self.busy_since = None;
        Ok(response)
    }

    /// Non-blocking check of whether the process has exited.
    pub(crate) fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL if it hasn't exited.
    #[cfg(unix)]
    pub(crate) fn terminate(&mut self, grace: Duration) {
        // Safety: `pid` is this child's own pid for the lifetime of `self.child`.
        unsafe {
            libc::kill(self.child.id() as libc::pid_t, libc::SIGTERM);
        }
        let deadline = Instant::now() + grace;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(_) => return,
            }
        }
        unsafe {
            libc::kill(self.child.id() as libc::pid_t, libc::SIGKILL);
        }
        let _ = self.child.wait();
    }
}
impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        cleanup_sock(&self.sock_path);
    }
}

fn cleanup_sock(sock_path: &PathBuf) {
    let _ = std::fs::remove_file(sock_path);
    let _ = std::fs::remove_file(Channel::reader_lock_path(sock_path));
    let _ = std::fs::remove_file(Channel::writer_lock_path(sock_path));
}

/// Turns the current process into a worker, if the environment says it
/// should be one. Called first thing by the embedding application's `main`;
/// returns immediately (a no-op) in the app process, and never returns in a
/// worker process, calling [`std::process::exit`] once the worker loop ends.
///
/// ```no_run
/// fn main() {
///     let registry = procpool::FunctionRegistry::new()
///         .register("add", |args| Ok((args.args[0].as_i64().unwrap_or(0) + args.args[1].as_i64().unwrap_or(0)).into()));
///     procpool::run_worker(registry);
///     // ... application code, only ever reached in the app process ...
/// }
/// ```
pub fn run_worker(registry: FunctionRegistry) {
    let Ok(sock) = std::env::var("PROCPOOL_SOCK") else {
        return;
    };
    // A worker re-exec'd from a different build of this crate (mismatched
    // wire format) must fail loudly instead of garbling frames silently.
    if let Ok(expected) = std::env::var("PROCPOOL_WORKER_VERSION") {
        if expected != env!("CARGO_PKG_VERSION") {
            tracing::error!(expected, actual = env!("CARGO_PKG_VERSION"), "worker version mismatch");
            std::process::exit(71);
        }
    }
    let lock_timeout_ms: u64 = std::env::var("PROCPOOL_LOCK_TIMEOUT_MS").ok().and_then(|s| s.parse().ok()).unwrap_or(60_000);
    let lock_timeout = Duration::from_millis(lock_timeout_ms);
    let max_tasks: Option<u32> = std::env::var("PROCPOOL_MAX_TASKS").ok().and_then(|s| s.parse().ok());

    tracing::info!(sock, "procpool worker starting");
    let mut channel = match Channel::connect(std::path::Path::new(&sock), lock_timeout) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(%e, "worker failed to connect to supervisor");
            std::process::exit(70);
        }
    };

    let initargs: Vec<Value> = std::env::var("PROCPOOL_INITARGS")
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    if let Err(reason) = registry.run_initializer(&initargs) {
        tracing::error!(%reason, "worker initializer failed");
        let _ = channel.send_value(&Response::InitializerFailed { reason });
        std::process::exit(INITIALIZER_FAILURE_EXIT_CODE);
    }

    let mut completed: u32 = 0;
    loop {
        let request: Request = match channel.recv_value(Duration::from_secs(3600)) {
            Ok(r) => r,
            Err(ChannelError::Empty) => continue,
            Err(ChannelError::Broken(reason)) => {
                tracing::warn!(%reason, "worker channel broken, exiting");
                std::process::exit(1);
            }
        };

        let response = match registry.dispatch(&request.function, &request.args) {
            Ok(value) => Response::Ok { id: request.id, value },
            Err(error) => Response::Err { id: request.id, error },
        };
        if let Err(e) = channel.send_value(&response) {
            tracing::error!(%e, "worker failed to send response, exiting");
            std::process::exit(1);
        }

        completed += 1;
        if max_tasks.is_some_and(|max| completed >= max) {
            tracing::debug!(completed, "worker reached max_tasks, exiting");
            std::process::exit(0);
        }
    }
}
