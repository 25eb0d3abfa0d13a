use crate::fiber::{Error, Fiber, Resume};
use bitflags::bitflags;
use std::os::fd::RawFd;
use std::time::Instant;

// Public API
pub mod poll;
pub use poll::PollReactor;

mod timers;
pub(crate) use timers::TimerQueue;

bitflags! {
    /// FD readiness interest for [`Reactor::register_io`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Interest: u8 {
        const READ = 1;
        const WRITE = 1 << 1;
    }
}

/// Identifies one registration with the reactor.
///
/// Keys carry a generation so that a stale deregistration (the watcher
/// already fired and its slot was reused) can never remove someone else's
/// watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherKey {
    pub(crate) index: usize,
    pub(crate) generation: u64,
}

/// A fired watcher: the fiber to resume and what to resume it with.
pub struct Completion {
    pub fiber: Fiber,
    pub resume: Resume,
}

/// Live watcher counts, surfaced through [`Stats`](crate::runtime::Stats).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatcherCounts {
    pub io: usize,
    pub timers: usize,
    pub children: usize,
    pub asyncs: usize,
}

/// The OS event multiplexer behind a scheduler.
///
/// The scheduler speaks only this contract; the bundled implementation is
/// [`PollReactor`], but any multiplexer able to translate FD readiness,
/// timer deadlines, child exits and cross-thread wakeups into
/// [`Completion`]s can be plugged in via
/// [`Builder::reactor`](crate::runtime::Builder::reactor).
///
/// Io and child watchers are one-shot: they are consumed when they fire.
/// The owning wait deregisters them on every other exit path. Watchers are
/// referenced — their presence keeps a blocking poll alive — except the
/// internal wakeup watcher, so an otherwise idle reactor never blocks
/// forever.
pub trait Reactor: Send + Sync {
    /// Registers one-shot interest in `fd` readiness for `fiber`.
    fn register_io(&self, fd: RawFd, interest: Interest, fiber: Fiber) -> WatcherKey;

    /// Removes an io watcher. Idempotent; a key whose watcher already fired
    /// is ignored.
    fn deregister_io(&self, key: WatcherKey);

    /// Arms a timer resuming `fiber` with `resume` at `deadline`.
    fn register_timer(&self, deadline: Instant, fiber: Fiber, resume: Resume) -> WatcherKey;

    /// Disarms a timer. Returns `false` when the timer already fired.
    fn cancel_timer(&self, key: WatcherKey) -> bool;

    /// Registers interest in the exit of child process `pid`. The completion
    /// resume value is a `Value` holding `(pid, exit_status)` after the
    /// child has been reaped.
    fn register_child(&self, pid: i32, fiber: Fiber) -> Result<WatcherKey, Error>;

    /// Removes a child watcher. Idempotent.
    fn deregister_child(&self, key: WatcherKey);

    /// Registers a referenced placeholder for a fiber that will be resumed
    /// by an explicit cross-task (possibly cross-thread) signal rather than
    /// by an OS event. It never fires on its own; its presence keeps a
    /// blocking poll alive until the signal's wakeup breaks it.
    fn register_async(&self, fiber: Fiber) -> WatcherKey;

    /// Removes an async watcher. Idempotent.
    fn deregister_async(&self, key: WatcherKey);

    /// Breaks a blocking [`poll`](Reactor::poll) from another OS thread.
    /// Must be async-signal-safe.
    fn wakeup(&self);

    /// Runs one iteration, appending fired watchers to `completions` in the
    /// order the OS reported them. Blocking mode waits until at least one
    /// event fires (bounded by the nearest timer deadline) unless no
    /// referenced watcher exists, in which case it returns immediately;
    /// non-blocking mode drains ready events and returns.
    fn poll(&self, blocking: bool, completions: &mut Vec<Completion>) -> Result<usize, Error>;

    /// Number of referenced watchers (the wakeup watcher is not counted).
    fn referenced(&self) -> usize;

    fn watcher_counts(&self) -> WatcherCounts;

    /// Idle maintenance: reclaim bookkeeping for watchers cancelled long
    /// ago. Invoked by the scheduler when the idle period elapses.
    fn maintain(&self) {}
}

impl Interest {
    pub(crate) fn poll_events(self) -> libc::c_short {
        let mut events = 0;
        if self.contains(Interest::READ) {
            events |= libc::POLLIN;
        }
        if self.contains(Interest::WRITE) {
            events |= libc::POLLOUT;
        }
        events
    }
}
