use crate::context;
use crate::fiber::{Error, Fiber, Id, Value};
use crate::reactor::{PollReactor, Reactor};
use crate::runtime::{Handle, Stats};
use anyhow::{Result, anyhow};
use std::cell::Cell;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;
use std::time::Duration;

/// How many switches between forced non-blocking reactor polls.
#[cfg(not(test))]
const POLL_INTERVAL: u32 = 61;

#[cfg(test)]
const POLL_INTERVAL: u32 = 4; // make tests tick faster

/// Fiber threads below this stack size tend to fault before user code even
/// runs.
const MIN_STACK_SIZE: usize = 16 * 1024;

/// Initial run-queue capacity, in fibers. The queue grows past it; the knob
/// only saves reallocation under a known fiber count.
const RUN_QUEUE_CAPACITY: usize = 256;

#[derive(Clone)]
pub(crate) struct ThreadNameFn(Arc<dyn Fn(Id) -> String + Send + Sync + 'static>);

impl ThreadNameFn {
    pub(crate) fn make(&self, id: Id) -> String {
        (self.0)(id)
    }
}

fn default_thread_name_fn() -> ThreadNameFn {
    ThreadNameFn(Arc::new(|id| format!("spindle-fiber-{id}")))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// Configures and creates a [`Runtime`].
pub struct Builder {
    /// Run a non-blocking reactor poll every N fiber switches.
    poll_interval: u32,

    /// Name fn for fiber threads.
    thread_name: ThreadNameFn,

    /// Stack size for fiber threads.
    thread_stack_size: Option<usize>,

    /// How often idle moments trigger reactor maintenance.
    idle_period: Option<Duration>,

    /// Initial capacity of the run queue.
    run_queue_capacity: usize,

    reactor: Option<Box<dyn Reactor>>,
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            poll_interval: POLL_INTERVAL,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            idle_period: None,
            run_queue_capacity: RUN_QUEUE_CAPACITY,
            reactor: None,
        }
    }

    /// Sets the number of fiber switches after which the scheduler runs a
    /// non-blocking reactor poll, so CPU-bound fiber churn cannot starve
    /// I/O.
    ///
    /// # Panics
    ///
    /// Panics if 0 is passed.
    #[track_caller]
    pub fn poll_interval(mut self, val: u32) -> Self {
        assert!(val > 0, "poll_interval must be greater than 0");
        self.poll_interval = val;
        self
    }

    /// Sets the name of threads backing fibers.
    ///
    /// The default name is "spindle-fiber-{id}".
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move |_| val.clone()));
        self
    }

    /// Sets a function used to generate fiber thread names from fiber IDs.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(Id) -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for fiber threads.
    ///
    /// The platform may round it up to its minimum.
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        self.thread_stack_size = Some(val);
        self
    }

    /// Enables periodic idle maintenance of reactor bookkeeping.
    pub fn idle_period(mut self, val: Duration) -> Self {
        self.idle_period = Some(val);
        self
    }

    /// Sets the initial capacity of the run queue, in fibers. The queue
    /// still grows on demand; size this to the expected fiber count to
    /// avoid reallocation.
    pub fn run_queue_capacity(mut self, val: usize) -> Self {
        self.run_queue_capacity = val;
        self
    }

    /// Replaces the default [`PollReactor`] with a custom reactor.
    pub fn reactor(mut self, reactor: impl Reactor + 'static) -> Self {
        self.reactor = Some(Box::new(reactor));
        self
    }

    /// Creates the configured `Runtime`.
    #[track_caller]
    pub fn try_build(mut self) -> Result<Runtime> {
        let reactor = match self.reactor.take() {
            Some(reactor) => reactor,
            None => Box::new(PollReactor::try_new()?),
        };
        let cfg = RuntimeConfig::try_from(self)?;

        // Claim the thread only once nothing can fail anymore, so a rejected
        // build does not leave the slot taken.
        IS_RUNTIME_ACTIVE.with(|is_active| -> Result<()> {
            if is_active.get() {
                Err(anyhow!(
                    "Cannot create a new Runtime: a runtime is already active on this thread."
                ))
            } else {
                is_active.set(true);
                Ok(())
            }
        })?;

        Ok(Runtime {
            handle: Handle::new(cfg, reactor),
        })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Builder::new()
    }
}

// Track whether a runtime is already active on this thread.
thread_local! {
    static IS_RUNTIME_ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// A configured scheduler plus its reactor.
///
/// [`run`](Runtime::run) hosts the root fiber on the calling thread; fibers
/// spun up inside it form a supervision tree under that root. When the entry
/// function returns, remaining live fibers are stopped in reverse spawn
/// order, the run queue is drained and the reactor is left empty.
pub struct Runtime {
    handle: Handle,
}

impl Runtime {
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    pub fn stats(&self) -> Stats {
        self.handle.stats()
    }

    /// Runs `entry` as the root fiber to completion.
    pub fn run<T>(&self, entry: impl FnOnce() -> Result<T, Error>) -> Result<T, Error> {
        let root = Fiber::new_root(&self.handle);
        self.handle.set_root(&root);
        context::enter(self.handle.clone(), root.clone());

        let result = catch_unwind(AssertUnwindSafe(entry));

        // Structured shutdown runs however the entry exited: finalize stops
        // the root's live children in reverse spawn order before marking the
        // root terminated.
        root.finalize(Ok(Value::nil()));
        self.handle.clear_root();
        context::exit();

        match result {
            Ok(outcome) => outcome,
            Err(panic) => resume_unwind(panic),
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        IS_RUNTIME_ACTIVE.with(|is_active| is_active.set(false));
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime").finish_non_exhaustive()
    }
}

/// Validated builder output consumed by the scheduler.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) poll_interval: u32,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) idle_period: Option<Duration>,
    pub(crate) run_queue_capacity: usize,
}

impl RuntimeConfig {
    fn validate(&self) -> Result<()> {
        if self.poll_interval == 0 {
            return Err(anyhow!("poll_interval must be greater than 0"));
        }
        if let Some(size) = self.thread_stack_size {
            if size < MIN_STACK_SIZE {
                return Err(anyhow!(
                    "thread_stack_size must be at least {} bytes, got {}",
                    MIN_STACK_SIZE,
                    size
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            poll_interval: POLL_INTERVAL,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            idle_period: None,
            run_queue_capacity: RUN_QUEUE_CAPACITY,
        }
    }
}

impl TryFrom<Builder> for RuntimeConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let cfg = RuntimeConfig {
            poll_interval: builder.poll_interval,
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
            idle_period: builder.idle_period,
            run_queue_capacity: builder.run_queue_capacity,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(RuntimeConfig: Send, Sync, Clone);

    #[test]
    fn test_zero_stack_size_is_rejected() {
        let res = Builder::new().thread_stack_size(1024).try_build();
        assert!(res.is_err());
    }

    #[test]
    #[should_panic(expected = "poll_interval")]
    fn test_zero_poll_interval_panics() {
        let _ = Builder::new().poll_interval(0);
    }

    #[test]
    fn test_run_queue_capacity_is_accepted() {
        let runtime = Builder::new().run_queue_capacity(64).try_build().unwrap();
        runtime.run(|| Ok(())).unwrap();
    }

    #[test]
    fn test_two_runtimes_on_one_thread_rejected() {
        let first = Builder::new().try_build().unwrap();
        let second = Builder::new().try_build();
        assert!(second.is_err());
        drop(first);

        // Dropping the first runtime frees the slot.
        assert!(Builder::new().try_build().is_ok());
    }
}
