//! Thread-local runtime context.
//!
//! Every OS thread hosting part of a scheduler (the root thread plus one
//! thread per fiber) records which scheduler it belongs to and which fiber it
//! embodies. The handoff discipline guarantees at most one of those threads
//! runs at a time, so this is the "current fiber" of the spec, expressed as
//! per-thread state with an explicit setup/teardown API rather than a hidden
//! singleton.

use crate::fiber::Fiber;
use crate::runtime::Handle;
use std::cell::RefCell;

struct FiberContext {
    scheduler: Handle,
    fiber: Fiber,
}

thread_local! {
    static CONTEXT: RefCell<Option<FiberContext>> = const { RefCell::new(None) };
}

/// Binds this OS thread to `fiber`. Called once at the start of every fiber
/// thread, and by the runtime for the root thread.
pub(crate) fn enter(scheduler: Handle, fiber: Fiber) {
    CONTEXT.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        debug_assert!(ctx.is_none(), "thread already bound to a fiber");
        *ctx = Some(FiberContext { scheduler, fiber });
    });
}

pub(crate) fn exit() {
    CONTEXT.with(|ctx| ctx.borrow_mut().take());
}

/// The scheduler and fiber bound to this thread.
///
/// # Panics
///
/// Panics when called from outside a runtime (no fiber is bound to this
/// thread).
#[track_caller]
pub(crate) fn current() -> (Handle, Fiber) {
    try_current().expect("not inside a spindle runtime")
}

pub(crate) fn try_current() -> Option<(Handle, Fiber)> {
    CONTEXT.with(|ctx| {
        ctx.borrow()
            .as_ref()
            .map(|c| (c.scheduler.clone(), c.fiber.clone()))
    })
}

/// Whether the calling thread belongs to `scheduler`. A schedule request from
/// a thread that does not is the cross-thread case and may need to break a
/// blocking reactor poll.
pub(crate) fn is_scheduler(scheduler: &Handle) -> bool {
    CONTEXT.with(|ctx| {
        ctx.borrow()
            .as_ref()
            .map(|c| Handle::ptr_eq(&c.scheduler, scheduler))
            .unwrap_or(false)
    })
}
