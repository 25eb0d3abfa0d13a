use crate::fiber::{Error, Fiber, Resume, Value};
use crate::reactor::{Completion, Interest, Reactor, TimerQueue, WatcherCounts, WatcherKey};
use crate::utils::sys;
use parking_lot::Mutex;
use slab::Slab;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::Instant;

/// `poll(2)`-based [`Reactor`].
///
/// The pollset is rebuilt from the watcher slab on every iteration, which is
/// O(watchers) per poll; right-sized for the fiber counts a single scheduler
/// hosts. Child exits are watched through a pidfd registered in the same
/// pollset and reaped with `waitpid(WNOHANG)` once it reports readable.
/// Cross-thread wakeups go through an eventfd that is part of the pollset
/// but unreferenced: it never keeps a blocking poll alive on its own.
pub struct PollReactor {
    state: Mutex<State>,
    wake: OwnedFd,
}

struct State {
    ios: Slab<IoWatcher>,
    io_generation: u64,
    timers: TimerQueue,
    asyncs: Slab<AsyncWatcher>,
    async_generation: u64,
}

struct AsyncWatcher {
    // Held so diagnostics can say who is parked on a signal; the watcher
    // itself never fires.
    _fiber: Fiber,
    generation: u64,
}

struct IoWatcher {
    fd: RawFd,
    interest: Interest,
    fiber: Fiber,
    generation: u64,
    kind: IoKind,
}

enum IoKind {
    Io,
    Child {
        pid: i32,
        // Kept open for the lifetime of the watcher; closed on fire or
        // deregistration when the watcher drops.
        _pidfd: OwnedFd,
    },
}

impl PollReactor {
    pub fn try_new() -> Result<Self, Error> {
        let wake = sys::eventfd().map_err(|e| Error::syscall("eventfd", e))?;
        Ok(Self {
            state: Mutex::new(State {
                ios: Slab::new(),
                io_generation: 0,
                timers: TimerQueue::new(),
                asyncs: Slab::new(),
                async_generation: 0,
            }),
            wake,
        })
    }
}

impl State {
    fn insert_io(&mut self, fd: RawFd, interest: Interest, fiber: Fiber, kind: IoKind) -> WatcherKey {
        self.io_generation += 1;
        let generation = self.io_generation;
        let index = self.ios.insert(IoWatcher {
            fd,
            interest,
            fiber,
            generation,
            kind,
        });
        WatcherKey { index, generation }
    }

    fn remove_io(&mut self, key: WatcherKey) {
        if let Some(w) = self.ios.get(key.index) {
            if w.generation == key.generation {
                self.ios.remove(key.index);
            }
        }
    }
}

impl Reactor for PollReactor {
    fn register_io(&self, fd: RawFd, interest: Interest, fiber: Fiber) -> WatcherKey {
        self.state.lock().insert_io(fd, interest, fiber, IoKind::Io)
    }

    fn deregister_io(&self, key: WatcherKey) {
        self.state.lock().remove_io(key);
    }

    fn register_timer(&self, deadline: Instant, fiber: Fiber, resume: Resume) -> WatcherKey {
        self.state.lock().timers.insert(deadline, fiber, resume)
    }

    fn cancel_timer(&self, key: WatcherKey) -> bool {
        self.state.lock().timers.cancel(key)
    }

    fn register_child(&self, pid: i32, fiber: Fiber) -> Result<WatcherKey, Error> {
        let pidfd = sys::pidfd_open(pid).map_err(|e| Error::syscall("pidfd_open", e))?;
        let fd = pidfd.as_raw_fd();
        Ok(self.state.lock().insert_io(
            fd,
            Interest::READ,
            fiber,
            IoKind::Child { pid, _pidfd: pidfd },
        ))
    }

    fn deregister_child(&self, key: WatcherKey) {
        self.state.lock().remove_io(key);
    }

    fn register_async(&self, fiber: Fiber) -> WatcherKey {
        let mut state = self.state.lock();
        state.async_generation += 1;
        let generation = state.async_generation;
        let index = state.asyncs.insert(AsyncWatcher {
            _fiber: fiber,
            generation,
        });
        WatcherKey { index, generation }
    }

    fn deregister_async(&self, key: WatcherKey) {
        let mut state = self.state.lock();
        if let Some(w) = state.asyncs.get(key.index) {
            if w.generation == key.generation {
                state.asyncs.remove(key.index);
            }
        }
    }

    fn wakeup(&self) {
        sys::eventfd_write(self.wake.as_raw_fd());
    }

    fn poll(&self, blocking: bool, completions: &mut Vec<Completion>) -> Result<usize, Error> {
        let mut state = self.state.lock();

        // A blocking iteration with nothing referenced would never return:
        // report no progress instead and let the scheduler decide (this is
        // the deadlock precondition).
        if blocking && state.ios.is_empty() && state.timers.len() == 0 && state.asyncs.is_empty() {
            return Ok(0);
        }

        let timeout_ms = if !blocking {
            0
        } else {
            match state.timers.next_deadline() {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        0
                    } else {
                        // Round up so a sub-millisecond remainder does not
                        // degrade into a busy loop.
                        let ms = deadline.duration_since(now).as_millis() + 1;
                        ms.min(i32::MAX as u128) as i32
                    }
                }
                None => -1,
            }
        };

        let mut pollfds = Vec::with_capacity(state.ios.len() + 1);
        pollfds.push(libc::pollfd {
            fd: self.wake.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        let mut keys = Vec::with_capacity(state.ios.len());
        for (index, watcher) in state.ios.iter() {
            pollfds.push(libc::pollfd {
                fd: watcher.fd,
                events: watcher.interest.poll_events(),
                revents: 0,
            });
            keys.push(index);
        }

        sys::poll(&mut pollfds, timeout_ms).map_err(|e| Error::syscall("poll", e))?;

        if pollfds[0].revents != 0 {
            sys::eventfd_drain(self.wake.as_raw_fd());
        }

        let mut fired = 0;
        for (slot, index) in keys.into_iter().enumerate() {
            // POLLERR/POLLHUP/POLLNVAL resume the waiter too; the retried
            // syscall surfaces the actual error at the call site.
            if pollfds[slot + 1].revents == 0 {
                continue;
            }
            let watcher = state.ios.remove(index);
            let resume = match &watcher.kind {
                IoKind::Io => Ok(Value::nil()),
                IoKind::Child { pid, .. } => match sys::reap(*pid) {
                    Ok((pid, status)) => Ok(Value::new((pid, status))),
                    Err(e) => Err(Error::syscall("waitpid", e)),
                },
            };
            completions.push(Completion {
                fiber: watcher.fiber.clone(),
                resume,
            });
            fired += 1;
        }

        fired += state.timers.expire(Instant::now(), completions);
        Ok(fired)
    }

    fn referenced(&self) -> usize {
        let state = self.state.lock();
        state.ios.len() + state.timers.len() + state.asyncs.len()
    }

    fn watcher_counts(&self) -> WatcherCounts {
        let state = self.state.lock();
        let children = state
            .ios
            .iter()
            .filter(|(_, w)| matches!(w.kind, IoKind::Child { .. }))
            .count();
        WatcherCounts {
            io: state.ios.len() - children,
            timers: state.timers.len(),
            children,
            asyncs: state.asyncs.len(),
        }
    }

    fn maintain(&self) {
        self.state.lock().timers.purge();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::time::Duration;

    assert_impl_all!(PollReactor: Send, Sync);

    fn dummy_fiber() -> Fiber {
        crate::fiber::Fiber::detached_for_tests()
    }

    #[test]
    fn test_blocking_poll_with_no_watchers_returns_immediately() {
        let reactor = PollReactor::try_new().unwrap();
        let mut out = Vec::new();
        let fired = reactor.poll(true, &mut out).unwrap();
        assert_eq!(fired, 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_timer_fires_and_is_consumed() {
        let reactor = PollReactor::try_new().unwrap();
        let deadline = Instant::now() + Duration::from_millis(5);
        reactor.register_timer(deadline, dummy_fiber(), Ok(Value::nil()));
        assert_eq!(reactor.referenced(), 1);

        let mut out = Vec::new();
        while out.is_empty() {
            reactor.poll(true, &mut out).unwrap();
        }
        assert!(Instant::now() >= deadline);
        assert_eq!(reactor.referenced(), 0);
    }

    #[test]
    fn test_cancelled_timer_does_not_fire() {
        let reactor = PollReactor::try_new().unwrap();
        let key = reactor.register_timer(
            Instant::now() + Duration::from_millis(1),
            dummy_fiber(),
            Ok(Value::nil()),
        );
        assert!(reactor.cancel_timer(key));
        assert!(!reactor.cancel_timer(key));
        assert_eq!(reactor.referenced(), 0);

        std::thread::sleep(Duration::from_millis(2));
        let mut out = Vec::new();
        assert_eq!(reactor.poll(false, &mut out).unwrap(), 0);
    }

    #[test]
    fn test_stale_io_key_is_ignored() {
        let reactor = PollReactor::try_new().unwrap();
        let (r, _w) = sys::pipe().unwrap();
        let key = reactor.register_io(r.as_raw_fd(), Interest::READ, dummy_fiber());
        reactor.deregister_io(key);

        // Slot may be reused; the stale key must not remove the new watcher.
        let _key2 = reactor.register_io(r.as_raw_fd(), Interest::READ, dummy_fiber());
        reactor.deregister_io(key);
        assert_eq!(reactor.referenced(), 1);
    }

    #[test]
    fn test_wakeup_breaks_blocking_poll() {
        use std::sync::Arc;

        let reactor = Arc::new(PollReactor::try_new().unwrap());
        // A far-away timer keeps the poll referenced and blocking.
        reactor.register_timer(
            Instant::now() + Duration::from_secs(60),
            dummy_fiber(),
            Ok(Value::nil()),
        );

        let remote = Arc::clone(&reactor);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            remote.wakeup();
        });

        let start = Instant::now();
        let mut out = Vec::new();
        reactor.poll(true, &mut out).unwrap();
        assert!(start.elapsed() < Duration::from_secs(60));
        handle.join().unwrap();
    }
}
