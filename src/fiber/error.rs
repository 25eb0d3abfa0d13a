use crate::fiber::Value;
use nix::errno::Errno;
use std::sync::atomic::{AtomicU64, Ordering};

/// What a fiber is resumed with at a suspension point: a value, or an error
/// raised at the suspended site.
pub type Resume = Result<Value, Error>;

/// The final result of a fiber, set exactly once at termination.
pub type Outcome = Result<Value, Error>;

/// Errors crossing the fiber boundary.
///
/// `Cancel`, `MoveOn` and `Timeout` are sentinels injected by the runtime to
/// terminate a waiting point; user code may catch them, otherwise they unwind
/// to the fiber entry frame. The type is `Clone` so that every awaiter of a
/// fiber observes the same outcome.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Injected by [`Fiber::cancel`](crate::Fiber::cancel). Unless caught, it
    /// becomes the fiber's result and awaiters re-raise it.
    #[error("fiber was cancelled")]
    Cancel,

    /// Injected by `stop`/`interrupt` and by `move_on_after`. Caught at the
    /// fiber entry frame, where it sets the result to `value` without error.
    /// Never surfaces to awaiters.
    #[error("fiber was told to move on")]
    MoveOn { token: u64, value: Value },

    /// Injected by `timeout` / `cancel_after` when the deadline fires. The
    /// token ties the sentinel to the `timeout` call that armed it, so nested
    /// timeouts cannot swallow each other.
    #[error("operation timed out")]
    Timeout { token: u64 },

    /// No fiber is runnable and no watcher is pending: the current fiber
    /// would block forever.
    #[error("deadlock: no runnable fiber and no pending watcher")]
    Deadlock,

    /// A syscall failed with anything other than a retryable would-block
    /// code. Raised synchronously at the call site.
    #[error("{op}: {errno}")]
    Syscall { op: &'static str, errno: Errno },

    /// A user-raised failure.
    #[error("{0}")]
    Failure(String),
}

// Tokens tie a MoveOn/Timeout sentinel to the wait that armed it. Zero is
// reserved for fiber-level stop/interrupt, which any entry frame may catch.
pub(crate) const STOP_TOKEN: u64 = 0;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_token() -> u64 {
    NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)
}

impl Error {
    pub fn failure(msg: impl Into<String>) -> Self {
        Error::Failure(msg.into())
    }

    pub(crate) fn syscall(op: &'static str, errno: Errno) -> Self {
        Error::Syscall { op, errno }
    }

    pub fn is_cancel(&self) -> bool {
        matches!(self, Error::Cancel)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    pub fn is_deadlock(&self) -> bool {
        matches!(self, Error::Deadlock)
    }

    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Syscall { errno, .. } => Some(*errno as i32),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Error: Send, Sync, Clone, std::error::Error);

    #[test]
    fn test_tokens_are_unique() {
        let a = next_token();
        let b = next_token();
        assert_ne!(a, b);
        assert_ne!(a, STOP_TOKEN);
    }

    #[test]
    fn test_raw_os_error_mapping() {
        let e = Error::syscall("read", Errno::EBADF);
        assert_eq!(e.raw_os_error(), Some(Errno::EBADF as i32));
        assert_eq!(Error::Cancel.raw_os_error(), None);
    }
}
