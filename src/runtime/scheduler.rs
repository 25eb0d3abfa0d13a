use crate::context;
use crate::fiber::{Error, Fiber, Resume, State};
use crate::reactor::{Completion, Reactor, WatcherCounts};
use crate::runtime::RunQueue;
use crate::runtime::builder::RuntimeConfig;
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

/// Per-thread driver: picks the next runnable fiber, polls the reactor when
/// idle, and delivers values or injected errors on resume.
///
/// There is no scheduler thread. The loop in [`Handle::switch`] runs inline
/// on whichever fiber yields, up to the point where control is handed to the
/// next fiber's stack.
pub struct Scheduler {
    pub(crate) cfg: RuntimeConfig,

    reactor: Box<dyn Reactor>,

    queue: Mutex<RunQueue>,

    /// The fiber currently holding the CPU.
    current: Mutex<Option<Fiber>>,

    /// Set while a blocking reactor poll is in flight, so a cross-thread
    /// schedule knows to break it.
    polling: AtomicBool,

    root: Mutex<Option<Fiber>>,

    tick: AtomicU32,
    stats: StatCounters,
    idle: Mutex<IdleState>,
}

#[derive(Default)]
struct StatCounters {
    switches: AtomicU64,
    polls: AtomicU64,
    ops: AtomicU64,
}

struct IdleState {
    period: Option<std::time::Duration>,
    last_maintenance: Instant,
    hook: Option<Box<dyn FnMut() + Send>>,
}

/// Scheduler counters and live watcher counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Fiber-to-fiber context switches.
    pub switches: u64,
    /// Reactor poll iterations.
    pub polls: u64,
    /// Suspending operations started.
    pub ops: u64,
    /// Watchers currently registered with the reactor.
    pub watchers: WatcherCounts,
}

/// Shared handle to a [`Scheduler`].
#[derive(Clone)]
pub struct Handle(Arc<Scheduler>);

impl Handle {
    pub(crate) fn new(cfg: RuntimeConfig, reactor: Box<dyn Reactor>) -> Handle {
        let idle_period = cfg.idle_period;
        let queue = RunQueue::new(cfg.run_queue_capacity);
        Handle(Arc::new(Scheduler {
            cfg,
            reactor,
            queue: Mutex::new(queue),
            current: Mutex::new(None),
            polling: AtomicBool::new(false),
            root: Mutex::new(None),
            tick: AtomicU32::new(0),
            stats: StatCounters::default(),
            idle: Mutex::new(IdleState {
                period: idle_period,
                last_maintenance: Instant::now(),
                hook: None,
            }),
        }))
    }

    pub(crate) fn ptr_eq(a: &Handle, b: &Handle) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.cfg
    }

    pub(crate) fn reactor(&self) -> &dyn Reactor {
        self.reactor.as_ref()
    }

    pub(crate) fn count_op(&self) {
        self.stats.ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> Stats {
        Stats {
            switches: self.stats.switches.load(Ordering::Relaxed),
            polls: self.stats.polls.load(Ordering::Relaxed),
            ops: self.stats.ops.load(Ordering::Relaxed),
            watchers: self.reactor.watcher_counts(),
        }
    }

    /// Callback invoked whenever the scheduler is about to block in the
    /// reactor.
    pub fn set_idle_hook(&self, hook: impl FnMut() + Send + 'static) {
        self.idle.lock().hook = Some(Box::new(hook));
    }

    /// How often idle moments trigger a maintenance pass over reactor
    /// bookkeeping. `None` disables it.
    pub fn set_idle_period(&self, period: Option<std::time::Duration>) {
        self.idle.lock().period = period;
    }

    pub(crate) fn set_root(&self, root: &Fiber) {
        *self.root.lock() = Some(root.clone());
        *self.current.lock() = Some(root.clone());
    }

    pub(crate) fn clear_root(&self) {
        self.root.lock().take();
        self.current.lock().take();
        self.queue.lock().clear();
    }

    /// Makes `fiber` runnable with `resume` as its resume value.
    ///
    /// `prioritize` puts it at the front of the queue, replacing a pending
    /// entry; otherwise a fiber already scheduled keeps its original entry.
    /// Safe to call from any OS thread; the cross-thread case breaks a
    /// blocking reactor poll.
    pub(crate) fn schedule(&self, fiber: &Fiber, resume: Resume, prioritize: bool) {
        if !fiber.is_alive() {
            return;
        }
        fiber.set_state(State::Runnable);
        {
            let mut queue = self.queue.lock();
            if prioritize {
                queue.delete(fiber);
                queue.push_front(fiber.clone(), resume);
            } else if queue.contains(fiber) {
                // The original entry stands.
                return;
            } else {
                queue.push_back(fiber.clone(), resume);
            }
        }
        if !context::is_scheduler(self) && self.polling.load(Ordering::SeqCst) {
            self.reactor.wakeup();
        }
    }

    /// Removes a pending resume for `fiber`, if any.
    pub(crate) fn unschedule(&self, fiber: &Fiber) {
        self.queue.lock().delete(fiber);
    }

    /// Yields the calling fiber. Returns when the fiber is next resumed,
    /// with the value it was resumed with, or with the error injected into
    /// it. The caller decides beforehand whether it is suspended or
    /// self-scheduled.
    pub(crate) fn switch(&self) -> Resume {
        let (_, cur) = context::current();

        // A pending injection is delivered at the very next yield point,
        // before any queued resume; its kick entry is consumed with it.
        if let Some(error) = cur.take_injection() {
            self.unschedule(&cur);
            cur.set_state(State::Running);
            return Err(error);
        }

        loop {
            let tick = self.tick.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if tick % self.cfg.poll_interval == 0 {
                // Guarantee I/O progress under CPU-bound fiber churn.
                self.poll_reactor(false);
            }

            let next = self.queue.lock().pop_front();
            if let Some((fiber, resume)) = next {
                if fiber.id() != cur.id() && !fiber.is_alive() {
                    continue;
                }
                return self.transfer(&cur, fiber, resume);
            }

            self.run_idle_hooks();

            self.polling.store(true, Ordering::SeqCst);
            if !self.queue.lock().is_empty() {
                // A cross-thread schedule slipped in before we could block.
                self.polling.store(false, Ordering::SeqCst);
                continue;
            }
            let fired = self.poll_reactor(true);
            self.polling.store(false, Ordering::SeqCst);

            if fired == 0 && self.queue.lock().is_empty() && self.reactor.referenced() == 0 {
                // Nothing can ever resume this fiber again.
                return Err(Error::Deadlock);
            }
        }
    }

    /// Final yield of a terminated fiber: hands control onward and returns
    /// so the fiber thread can exit.
    pub(crate) fn switch_terminated(&self) {
        loop {
            let next = self.queue.lock().pop_front();
            if let Some((fiber, resume)) = next {
                if !fiber.is_alive() {
                    continue;
                }
                self.stats.switches.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(target: "spindle::scheduler", to = %fiber.id(), "fiber_switch");
                *self.current.lock() = Some(fiber.clone());
                fiber.set_state(State::Running);
                fiber.resume_context(resume);
                return;
            }

            self.run_idle_hooks();

            self.polling.store(true, Ordering::SeqCst);
            if !self.queue.lock().is_empty() {
                self.polling.store(false, Ordering::SeqCst);
                continue;
            }
            let fired = self.poll_reactor(true);
            self.polling.store(false, Ordering::SeqCst);

            if fired == 0 && self.queue.lock().is_empty() && self.reactor.referenced() == 0 {
                // Every live fiber is suspended with nothing to wake it.
                // Surface the deadlock in the root fiber, the one supervisor
                // guaranteed to be awaited.
                let root = self.root.lock().clone();
                match root {
                    Some(root) if root.is_alive() => root.inject(Error::Deadlock),
                    _ => return,
                }
            }
        }
    }

    fn transfer(&self, cur: &Fiber, next: Fiber, resume: Resume) -> Resume {
        if next.id() == cur.id() {
            cur.set_state(State::Running);
            return match cur.take_injection() {
                Some(error) => Err(error),
                None => resume,
            };
        }

        self.stats.switches.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            target: "spindle::scheduler",
            from = %cur.id(),
            to = %next.id(),
            "fiber_switch"
        );
        *self.current.lock() = Some(next.clone());
        next.set_state(State::Running);
        next.resume_context(resume);

        // Parks until another fiber transfers back here; by then `current`
        // and our state have been updated by the resumer.
        cur.park()
    }

    fn poll_reactor(&self, blocking: bool) -> usize {
        self.stats.polls.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(target: "spindle::scheduler", blocking, "fiber_event_poll_enter");

        let mut completions: Vec<Completion> = Vec::new();
        let fired = match self.reactor.poll(blocking, &mut completions) {
            Ok(fired) => fired,
            // An unpollable reactor is an invariant violation, not an I/O
            // error any fiber could handle.
            Err(error) => panic!("reactor poll failed: {error}"),
        };

        tracing::trace!(target: "spindle::scheduler", fired, "fiber_event_poll_leave");

        // Back of the queue, preserving OS report order.
        for completion in completions {
            self.schedule(&completion.fiber, completion.resume, false);
        }
        fired
    }

    fn run_idle_hooks(&self) {
        let mut idle = self.idle.lock();
        if let Some(hook) = idle.hook.as_mut() {
            hook();
        }
        if let Some(period) = idle.period {
            if idle.last_maintenance.elapsed() >= period {
                idle.last_maintenance = Instant::now();
                drop(idle);
                self.reactor.maintain();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_tests() -> Handle {
        let reactor = crate::reactor::PollReactor::try_new().expect("reactor");
        Handle::new(RuntimeConfig::default(), Box::new(reactor))
    }
}

impl Deref for Handle {
    type Target = Scheduler;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle").finish_non_exhaustive()
    }
}
