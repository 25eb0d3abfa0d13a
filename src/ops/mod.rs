//! Suspension primitives.
//!
//! Everything here (plus the operations in [`io`] and `Fiber::join`/
//! `receive`) is a yield point: the calling fiber may be resumed with an
//! injected error instead of a value, which is how cancellation and
//! timeouts reach it. Code between yield points runs atomically with
//! respect to other fibers of the same scheduler.

use crate::context;
use crate::fiber::error::next_token;
use crate::fiber::{Error, Fiber, Outcome, State, Value};
use crate::reactor::Interest;
use crate::utils::ScopeGuard;
use parking_lot::Mutex;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub mod io;


/// Creates a fiber running `f` as a child of the current fiber, scheduled at
/// the back of the run queue.
#[track_caller]
pub fn spin<F>(f: F) -> Fiber
where
    F: FnOnce() -> Outcome + Send + 'static,
{
    let (scheduler, cur) = context::current();
    Fiber::spawn(&scheduler, Some(&cur), Box::new(f))
}

/// Yields to the end of the run queue and resumes after every fiber already
/// queued has run. The single fairness point: tight syscall loops call this
/// between syscalls.
pub fn snooze() -> Result<Value, Error> {
    let (scheduler, cur) = context::current();
    scheduler.schedule(&cur, Ok(Value::nil()), false);
    scheduler.switch()
}

/// Yields without rescheduling; resumes only when another fiber explicitly
/// schedules this one.
pub fn suspend() -> Result<Value, Error> {
    let (scheduler, cur) = context::current();
    cur.set_state(State::Suspended);
    scheduler.switch()
}

/// Pops the next message from the current fiber's mailbox, suspending until
/// one arrives.
pub fn receive() -> Result<Value, Error> {
    let (_, cur) = context::current();
    cur.receive_current()
}

/// Suspends the current fiber for at least `duration`.
pub fn sleep(duration: Duration) -> Result<(), Error> {
    sleep_until(Instant::now() + duration)
}

fn sleep_until(deadline: Instant) -> Result<(), Error> {
    let (scheduler, cur) = context::current();
    scheduler.count_op();

    let key = scheduler
        .reactor()
        .register_timer(deadline, cur.clone(), Ok(Value::nil()));
    let guard_scheduler = scheduler.clone();
    let _guard = ScopeGuard::new(move || {
        guard_scheduler.reactor().cancel_timer(key);
    });

    cur.set_state(State::Suspended);
    scheduler.switch()?;
    Ok(())
}

/// Runs `f` once per `interval`, forever (or until `f` returns an error,
/// including an injected one).
///
/// Deadlines are anchored to the first tick, so drift does not accumulate;
/// ticks missed while `f` ran long are collapsed rather than replayed.
pub fn timer_loop<F>(interval: Duration, mut f: F) -> Result<(), Error>
where
    F: FnMut() -> Result<(), Error>,
{
    let mut next_tick = Instant::now() + interval;
    loop {
        if next_tick > Instant::now() {
            sleep_until(next_tick)?;
        }
        f()?;

        let now = Instant::now();
        loop {
            next_tick += interval;
            if next_tick > now {
                break;
            }
        }
    }
}

/// Runs `f` with a deadline of `duration`, raising `Timeout` at the current
/// fiber's innermost yield point when it fires.
///
/// The timer is cancelled on every exit. Nested timeouts are independent: an
/// outer deadline propagates through an inner `timeout` untouched.
pub fn timeout<T, F>(duration: Duration, f: F) -> Result<T, Error>
where
    F: FnOnce() -> Result<T, Error>,
{
    with_deadline(duration, Error::Timeout { token: next_token() }, f)
}

/// Like [`timeout`], but when the deadline fires the result is `value`
/// rather than an error.
pub fn move_on_after<F>(duration: Duration, value: Value, f: F) -> Result<Value, Error>
where
    F: FnOnce() -> Result<Value, Error>,
{
    let token = next_token();
    match with_deadline(duration, Error::MoveOn { token, value }, f) {
        Err(Error::MoveOn { token: t, value }) if t == token => Ok(value),
        other => other,
    }
}

/// Like [`timeout`], but the deadline raises `Cancel`.
pub fn cancel_after<T, F>(duration: Duration, f: F) -> Result<T, Error>
where
    F: FnOnce() -> Result<T, Error>,
{
    with_deadline(duration, Error::Cancel, f)
}

fn with_deadline<T, F>(duration: Duration, sentinel: Error, f: F) -> Result<T, Error>
where
    F: FnOnce() -> Result<T, Error>,
{
    let (scheduler, cur) = context::current();
    scheduler.count_op();

    let key = scheduler
        .reactor()
        .register_timer(Instant::now() + duration, cur.clone(), Err(sentinel));

    let guard_scheduler = scheduler.clone();
    let guard_cur = cur.clone();
    let _guard = ScopeGuard::new(move || {
        if !guard_scheduler.reactor().cancel_timer(key) {
            // The deadline fired while the fiber was between yield points;
            // drop the stale resume so it cannot hit an unrelated
            // suspension later.
            guard_scheduler.unschedule(&guard_cur);
        }
    });

    f()
}

/// Blocks every fiber in `fibers`, returning their values in argument order
/// or the first re-raised error.
pub fn await_all(fibers: &[Fiber]) -> Result<Vec<Value>, Error> {
    fibers.iter().map(|f| f.join()).collect()
}

/// Suspends until `fd` reports readable (or writable when `write` is set).
/// Pure wait: no syscall is attempted on the fd.
pub fn wait_io(fd: RawFd, write: bool) -> Result<Value, Error> {
    let interest = if write {
        Interest::WRITE
    } else {
        Interest::READ
    };
    wait_fd(fd, interest)
}

pub(crate) fn wait_fd(fd: RawFd, interest: Interest) -> Result<Value, Error> {
    let (scheduler, cur) = context::current();
    scheduler.count_op();

    let key = scheduler.reactor().register_io(fd, interest, cur.clone());
    let guard_scheduler = scheduler.clone();
    let _guard = ScopeGuard::new(move || guard_scheduler.reactor().deregister_io(key));

    cur.set_state(State::Suspended);
    scheduler.switch()
}

/// Waits on two fds at once; resumes when either fires. Used by `splice`,
/// where EAGAIN does not say which side is the bottleneck.
pub(crate) fn wait_fd_rw(read_fd: RawFd, write_fd: RawFd) -> Result<Value, Error> {
    let (scheduler, cur) = context::current();
    scheduler.count_op();

    let read_key = scheduler
        .reactor()
        .register_io(read_fd, Interest::READ, cur.clone());
    let write_key = scheduler
        .reactor()
        .register_io(write_fd, Interest::WRITE, cur.clone());

    let guard_scheduler = scheduler.clone();
    let _guard = ScopeGuard::new(move || {
        guard_scheduler.reactor().deregister_io(read_key);
        guard_scheduler.reactor().deregister_io(write_key);
    });

    cur.set_state(State::Suspended);
    scheduler.switch()
}

/// Suspends until child process `pid` exits; returns `(pid, exit_status)`
/// once the child has been reaped.
pub fn wait_child(pid: i32) -> Result<(i32, i32), Error> {
    let (scheduler, cur) = context::current();
    scheduler.count_op();

    let key = scheduler.reactor().register_child(pid, cur.clone())?;
    let guard_scheduler = scheduler.clone();
    let _guard = ScopeGuard::new(move || guard_scheduler.reactor().deregister_child(key));

    cur.set_state(State::Suspended);
    let value = scheduler.switch()?;
    value
        .downcast_ref::<(i32, i32)>()
        .copied()
        .ok_or_else(|| Error::failure("unexpected child watcher payload"))
}

/// One-shot cross-fiber event.
///
/// A fiber parks in [`wait`](Event::wait) until any fiber (or any OS thread)
/// calls [`signal`](Event::signal). A signal sent before the wait is
/// buffered; a second buffered signal overwrites the first.
#[derive(Clone, Default)]
pub struct Event {
    inner: Arc<Mutex<EventState>>,
}

#[derive(Default)]
struct EventState {
    waiter: Option<Fiber>,
    signaled: Option<Value>,
}

impl Event {
    pub fn new() -> Event {
        Event::default()
    }

    /// Suspends the current fiber until the event is signaled; returns the
    /// signal value.
    pub fn wait(&self) -> Result<Value, Error> {
        let (scheduler, cur) = context::current();
        scheduler.count_op();

        {
            let mut state = self.inner.lock();
            if let Some(value) = state.signaled.take() {
                return Ok(value);
            }
            state.waiter = Some(cur.clone());
        }

        // The async watcher keeps the reactor referenced while we wait on a
        // signal no OS event will deliver.
        let key = scheduler.reactor().register_async(cur.clone());
        let guard_scheduler = scheduler.clone();
        let _guard = ScopeGuard::new(move || guard_scheduler.reactor().deregister_async(key));

        cur.set_state(State::Suspended);
        let result = scheduler.switch();

        // Drop a stale registration whether we were resumed by a signal or
        // unwound by an injection.
        {
            let mut state = self.inner.lock();
            if matches!(&state.waiter, Some(w) if w.id() == cur.id()) {
                state.waiter = None;
            }
        }

        result
    }

    /// Wakes the waiter with `value`, or buffers it if nobody waits yet.
    /// Callable from any OS thread.
    pub fn signal(&self, value: Value) {
        let mut value = Some(value);
        let waiter = {
            let mut state = self.inner.lock();
            match state.waiter.take() {
                Some(waiter) => Some(waiter),
                None => {
                    state.signaled = Some(value.take().expect("value set"));
                    None
                }
            }
        };
        if let Some(waiter) = waiter {
            let resume = value.take().expect("value set");
            waiter.scheduler().schedule(&waiter, Ok(resume), false);
        }
    }
}
