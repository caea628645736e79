//! Dispatch registry: symbol name -> handler closure.
//!
//! Rust cannot send an arbitrary closure across a process boundary, so
//! callables are resolved by name in a registry built identically in the
//! app-process and in every worker-process (they are, after all, the same
//! executable re-spawned).

use std::{collections::HashMap, panic::AssertUnwindSafe, sync::Arc};

use serde_json::Value;

/// Positional and keyword arguments handed to a registered function.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Args {
    /// Positional arguments, in call order.
    pub args: Vec<Value>,
    /// Keyword arguments.
    pub kwargs: HashMap<String, Value>,
}
impl Args {
    /// Build from positional args only.
    pub fn positional(args: Vec<Value>) -> Self {
        Args { args, kwargs: HashMap::new() }
    }
}

/// A task handler: takes the call arguments, returns a value or an error message.
///
/// Handlers run inside the worker process. A handler returning `Err` is the
/// user-exception path: it travels back as a value on the result frame and
/// never causes the worker to exit. A handler that *panics* is also
/// caught by [`run_worker`](crate::worker::run_worker) and converted into the
/// same `Err` path, so a registered closure does not need to catch its own
/// panics.
pub type HandlerFn = dyn Fn(&Args) -> Result<Value, String> + Send + Sync + 'static;

/// An initializer: runs once per worker process before it accepts any task.
pub type InitializerFn = dyn Fn(&[Value]) -> Result<(), String> + Send + Sync + 'static;

/// Maps function names to handlers, shared between the app-process (for
/// validation) and the worker-process (for dispatch).
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    handlers: HashMap<String, Arc<HandlerFn>>,
    initializer: Option<Arc<InitializerFn>>,
}
impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("has_initializer", &self.initializer.is_some())
            .finish()
    }
}
impl FunctionRegistry {
    /// New, empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`. Re-registering the same name replaces it.
    pub fn register(mut self, name: impl Into<String>, handler: impl Fn(&Args) -> Result<Value, String> + Send + Sync + 'static) -> Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    /// Set the per-worker initializer, run once before the first task.
    pub fn initializer(mut self, initializer: impl Fn(&[Value]) -> Result<(), String> + Send + Sync + 'static) -> Self {
        self.initializer = Some(Arc::new(initializer));
        self
    }

    /// True if `name` is a registered handler; used by `schedule` to fail fast
    /// on an unknown function instead of round-tripping to a worker.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub(crate) fn run_initializer(&self, initargs: &[Value]) -> Result<(), String> {
        match &self.initializer {
            Some(init) => catch_to_string(|| init(initargs)),
            None => Ok(()),
        }
    }

    pub(crate) fn dispatch(&self, name: &str, args: &Args) -> Result<Value, String> {
        match self.handlers.get(name) {
            Some(handler) => catch_to_string(|| handler(args)),
            None => Err(format!("no function registered under name {name:?}")),
        }
    }
}

/// Runs `f`, converting both an `Err` return and a panic into the same
/// string-carrying error so the worker loop never has to special-case panics
/// separately from ordinary user errors: neither path ever takes the worker
/// process down.
fn catch_to_string<T>(f: impl FnOnce() -> Result<T, String>) -> Result<T, String> {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(r) => r,
        Err(payload) => Err(crate::util::panic_str(&payload).to_owned()),
    }
}
