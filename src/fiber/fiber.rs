use crate::context;
use crate::fiber::context::Handoff;
use crate::fiber::{Error, Id, Mailbox, Outcome, Resume, Value};
use crate::runtime::Handle;
use parking_lot::Mutex;
use std::backtrace::Backtrace;
use std::fmt;
use std::panic::{AssertUnwindSafe, Location, catch_unwind};
use std::sync::Arc;

pub(crate) type Entry = Box<dyn FnOnce() -> Outcome + Send + 'static>;
type DoneFn = Box<dyn FnOnce(&Outcome) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Suspended,
    Runnable,
    Running,
    Terminated,
}

/// Handle to a cooperatively scheduled unit of execution.
///
/// A `Fiber` is cheap to clone; every clone refers to the same underlying
/// fiber. Fibers form a supervision tree rooted at the fiber hosting
/// [`Runtime::run`](crate::runtime::Runtime::run): a terminating fiber stops
/// its live children (in reverse spawn order) before it finishes, and an
/// error it did not hand to an awaiter is raised in its parent.
#[derive(Clone)]
pub struct Fiber {
    inner: Arc<Inner>,
}

struct Inner {
    id: Id,
    scheduler: Handle,
    handoff: Handoff,
    core: Mutex<Core>,
    location: &'static Location<'static>,
    caller: Backtrace,
}

struct Core {
    state: State,
    entry: Option<Entry>,
    started: bool,
    result: Option<Outcome>,
    parent: Option<Fiber>,
    children: Vec<Fiber>,
    awaiters: Vec<Fiber>,
    when_done: Vec<DoneFn>,
    injection: Option<Error>,
    mailbox: Mailbox,
}

impl Fiber {
    /// Creates a child fiber of `parent`, runnable at the back of the queue.
    #[track_caller]
    pub(crate) fn spawn(scheduler: &Handle, parent: Option<&Fiber>, entry: Entry) -> Fiber {
        let fiber = Fiber {
            inner: Arc::new(Inner {
                id: Id::next(),
                scheduler: scheduler.clone(),
                handoff: Handoff::new(),
                core: Mutex::new(Core {
                    state: State::Suspended,
                    entry: Some(entry),
                    started: false,
                    result: None,
                    parent: parent.cloned(),
                    children: Vec::new(),
                    awaiters: Vec::new(),
                    when_done: Vec::new(),
                    injection: None,
                    mailbox: Mailbox::default(),
                }),
                location: Location::caller(),
                caller: Backtrace::capture(),
            }),
        };

        if let Some(parent) = parent {
            parent.inner.core.lock().children.push(fiber.clone());
        }

        scheduler.schedule(&fiber, Ok(Value::nil()), false);
        fiber
    }

    /// The fiber embodied by the thread that entered the runtime.
    #[track_caller]
    pub(crate) fn new_root(scheduler: &Handle) -> Fiber {
        Fiber {
            inner: Arc::new(Inner {
                id: Id::root(),
                scheduler: scheduler.clone(),
                handoff: Handoff::new(),
                core: Mutex::new(Core {
                    state: State::Running,
                    entry: None,
                    started: true,
                    result: None,
                    parent: None,
                    children: Vec::new(),
                    awaiters: Vec::new(),
                    when_done: Vec::new(),
                    injection: None,
                    mailbox: Mailbox::default(),
                }),
                location: Location::caller(),
                caller: Backtrace::capture(),
            }),
        }
    }

    pub fn id(&self) -> Id {
        self.inner.id
    }

    /// True until the fiber has terminated.
    pub fn is_alive(&self) -> bool {
        self.inner.core.lock().state != State::Terminated
    }

    /// The outcome if terminated, else `None`.
    pub fn result(&self) -> Option<Outcome> {
        self.inner.core.lock().result.clone()
    }

    /// The spawn site.
    pub fn location(&self) -> &'static Location<'static> {
        self.inner.location
    }

    /// Call stack captured at the spawn site. Empty unless backtraces are
    /// enabled for the process.
    pub fn caller(&self) -> &Backtrace {
        &self.inner.caller
    }

    /// Blocks the calling fiber until this fiber terminates, then returns its
    /// result value or re-raises its error. Every awaiter observes the same
    /// outcome.
    pub fn join(&self) -> Outcome {
        let (scheduler, cur) = context::current();
        if cur.id() == self.id() {
            return Err(Error::Deadlock);
        }

        {
            let mut core = self.inner.core.lock();
            if core.state == State::Terminated {
                return core.result.clone().expect("terminated fiber has a result");
            }
            core.awaiters.push(cur.clone());
        }

        cur.set_state(State::Suspended);
        let resume = scheduler.switch();

        // Resumed either by this fiber's termination or by an injection into
        // the awaiter itself; in the latter case the registration is stale.
        self.inner
            .core
            .lock()
            .awaiters
            .retain(|a| a.id() != cur.id());

        resume
    }

    /// Terminates the fiber without error: a move-on sentinel is injected,
    /// unwinds it at its next resume, and `value` becomes its result.
    /// Prioritized over ordinary scheduling.
    pub fn stop(&self, value: Value) {
        self.inject(Error::MoveOn {
            token: crate::fiber::error::STOP_TOKEN,
            value,
        });
    }

    /// Alias for [`stop`](Fiber::stop).
    pub fn interrupt(&self, value: Value) {
        self.stop(value);
    }

    /// Injects a cancellation. Unless the fiber catches it, `Cancel` becomes
    /// its result and awaiters re-raise it. Prioritized.
    pub fn cancel(&self) {
        self.inject(Error::Cancel);
    }

    /// Schedules the fiber at the back of the queue with `value` as its
    /// resume value. No-op if terminated; ignored if already scheduled.
    pub fn resume(&self, value: Value) {
        self.inner.scheduler.schedule(self, Ok(value), false);
    }

    /// Registers a callback invoked after termination with the result.
    /// Callbacks run in scheduler context, must not suspend, and run to
    /// completion; a panicking callback is reported and swallowed.
    pub fn when_done(&self, callback: impl FnOnce(&Outcome) + Send + 'static) {
        let mut callback = Some(Box::new(callback) as DoneFn);
        let already_done = {
            let mut core = self.inner.core.lock();
            if core.state == State::Terminated {
                core.result.clone()
            } else {
                core.when_done.push(callback.take().expect("callback set"));
                None
            }
        };
        if let Some(outcome) = already_done {
            run_done_callback(self.id(), callback.take().expect("callback set"), &outcome);
        }
    }

    /// Appends `msg` to the fiber's mailbox; if the fiber is parked in
    /// `receive`, resumes it with the message instead.
    pub fn send(&self, msg: Value) {
        let mut msg = Some(msg);
        let deliver = {
            let mut core = self.inner.core.lock();
            if core.state == State::Terminated {
                return;
            }
            if core.mailbox.receiver_waiting() {
                core.mailbox.clear_waiting();
                true
            } else {
                core.mailbox.push(msg.take().expect("message set"));
                false
            }
        };
        if deliver {
            self.inner
                .scheduler
                .schedule(self, Ok(msg.take().expect("message set")), false);
        }
    }

    /// `receive` on the current fiber: pops the next mailbox message,
    /// suspending until one arrives.
    pub(crate) fn receive_current(&self) -> Result<Value, Error> {
        let (scheduler, cur) = context::current();
        debug_assert_eq!(cur.id(), self.id(), "receive is owner-only");
        scheduler.count_op();

        {
            let mut core = self.inner.core.lock();
            if let Some(msg) = core.mailbox.pop() {
                return Ok(msg);
            }
            core.mailbox.set_waiting();
            core.state = State::Suspended;
        }

        let resume = scheduler.switch();
        self.inner.core.lock().mailbox.clear_waiting();
        resume
    }

    // --- runtime internals ---

    pub(crate) fn scheduler(&self) -> &Handle {
        &self.inner.scheduler
    }

    pub(crate) fn state(&self) -> State {
        self.inner.core.lock().state
    }

    pub(crate) fn set_state(&self, state: State) {
        let mut core = self.inner.core.lock();
        if core.state != State::Terminated {
            core.state = state;
        }
    }

    pub(crate) fn take_injection(&self) -> Option<Error> {
        self.inner.core.lock().injection.take()
    }

    /// Sets a pending error delivered at the fiber's next resume and makes
    /// sure that resume happens soon (front of queue).
    pub(crate) fn inject(&self, error: Error) {
        {
            let mut core = self.inner.core.lock();
            if core.state == State::Terminated {
                return;
            }
            core.injection = Some(error);
        }
        self.inner.scheduler.schedule(self, Ok(Value::nil()), true);
    }

    /// Parks the calling thread (which embodies this fiber) until resumed.
    /// A pending injection overrides the delivered resume value.
    pub(crate) fn park(&self) -> Resume {
        let resume = self.inner.handoff.wait();
        match self.take_injection() {
            Some(error) => Err(error),
            None => resume,
        }
    }

    /// Hands control to this fiber, spawning its thread on first resume.
    pub(crate) fn resume_context(&self, resume: Resume) {
        let spawn_thread = {
            let mut core = self.inner.core.lock();
            if core.started {
                false
            } else {
                core.started = true;
                true
            }
        };
        if spawn_thread {
            self.spawn_thread();
        }
        self.inner.handoff.deliver(resume);
    }

    fn spawn_thread(&self) {
        let fiber = self.clone();
        let scheduler = self.inner.scheduler.clone();
        let cfg = scheduler.config();

        let mut builder = std::thread::Builder::new().name(cfg.thread_name.make(self.id()));
        if let Some(size) = cfg.thread_stack_size {
            builder = builder.stack_size(size);
        }
        builder
            .spawn(move || fiber_main(fiber, scheduler))
            .expect("failed to spawn fiber thread");
    }

    /// Stops live children in reverse spawn order, yielding until each one
    /// confirms termination. Runs on the terminating fiber itself and may
    /// re-enter the scheduler.
    pub(crate) fn shutdown_children(&self) {
        loop {
            let child = self.inner.core.lock().children.last().cloned();
            let Some(child) = child else { break };
            child.stop(Value::nil());
            child.wait_terminated();
        }
    }

    /// Like `join`, but swallows the outcome and any injection: a
    /// terminating fiber is not itself cancellable.
    fn wait_terminated(&self) {
        let (scheduler, cur) = context::current();
        loop {
            {
                let mut core = self.inner.core.lock();
                if core.state == State::Terminated {
                    return;
                }
                core.awaiters.push(cur.clone());
            }
            cur.set_state(State::Suspended);
            let _ = scheduler.switch();
            self.inner
                .core
                .lock()
                .awaiters
                .retain(|a| a.id() != cur.id());
        }
    }

    /// Termination sequence: result slot, children shutdown, detach,
    /// `when_done` callbacks, awaiters, orphan-error propagation.
    pub(crate) fn finalize(&self, outcome: Outcome) {
        // A move-on sentinel reaching the entry frame is a normal return
        // carrying its value.
        let outcome = match outcome {
            Err(Error::MoveOn { value, .. }) => Ok(value),
            other => other,
        };

        tracing::trace!(target: "spindle::fiber", id = %self.id(), "fiber_terminate");

        {
            let mut core = self.inner.core.lock();
            debug_assert!(core.result.is_none(), "result slot is set exactly once");
            core.result = Some(outcome.clone());
        }

        self.shutdown_children();

        let parent = {
            let mut core = self.inner.core.lock();
            core.state = State::Terminated;
            core.injection = None;
            core.entry = None;
            core.mailbox.clear();
            core.parent.take()
        };
        if let Some(parent) = &parent {
            parent.remove_child(self);
        }

        let callbacks = std::mem::take(&mut self.inner.core.lock().when_done);
        for callback in callbacks {
            run_done_callback(self.id(), callback, &outcome);
        }

        let awaiters = std::mem::take(&mut self.inner.core.lock().awaiters);
        let had_awaiters = !awaiters.is_empty();
        for awaiter in &awaiters {
            // On the awaiter's own scheduler: joins may cross schedulers.
            awaiter.scheduler().schedule(awaiter, outcome.clone(), false);
        }

        // An unhandled error with no awaiter surfaces in the parent at its
        // next resume.
        if let Err(error) = &outcome {
            if !had_awaiters {
                if let Some(parent) = parent {
                    if parent.is_alive() {
                        parent.inject(error.clone());
                    }
                }
            }
        }
    }

    fn remove_child(&self, child: &Fiber) {
        self.inner
            .core
            .lock()
            .children
            .retain(|c| c.id() != child.id());
    }

    #[cfg(test)]
    pub(crate) fn detached_for_tests() -> Fiber {
        let scheduler = Handle::new_for_tests();
        Fiber {
            inner: Arc::new(Inner {
                id: Id::next(),
                scheduler,
                handoff: Handoff::new(),
                core: Mutex::new(Core {
                    state: State::Suspended,
                    entry: None,
                    started: true,
                    result: None,
                    parent: None,
                    children: Vec::new(),
                    awaiters: Vec::new(),
                    when_done: Vec::new(),
                    injection: None,
                    mailbox: Mailbox::default(),
                }),
                location: Location::caller(),
                caller: Backtrace::capture(),
            }),
        }
    }
}

/// Entry point of every fiber thread.
fn fiber_main(fiber: Fiber, scheduler: Handle) {
    context::enter(scheduler.clone(), fiber.clone());

    // First resume. An injection that landed before the fiber ever ran
    // (cancelled or stopped at birth) skips the body entirely.
    let first = fiber.park();

    let outcome = match first {
        Ok(_) => {
            tracing::trace!(target: "spindle::fiber", id = %fiber.id(), "fiber_run");
            let entry = fiber
                .inner
                .core
                .lock()
                .entry
                .take()
                .expect("fiber entry is taken exactly once");
            match catch_unwind(AssertUnwindSafe(entry)) {
                Ok(outcome) => outcome,
                Err(panic) => Err(Error::Failure(panic_message(&panic))),
            }
        }
        Err(error) => Err(error),
    };

    fiber.finalize(outcome);
    scheduler.switch_terminated();
    context::exit();
}

fn run_done_callback(id: Id, callback: DoneFn, outcome: &Outcome) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(outcome))) {
        tracing::error!(
            target: "spindle::fiber",
            fiber = %id,
            panic = %panic_message(&panic),
            "when_done callback panicked"
        );
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "fiber panicked".to_string()
    }
}

impl PartialEq for Fiber {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Fiber {}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
