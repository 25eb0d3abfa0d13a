//! Execution contexts for fibers.
//!
//! Each fiber owns an independent call stack in the form of a dedicated OS
//! thread, spawned lazily on first resume. Control moves between stacks by
//! handoff: the running thread deposits a [`Resume`] in the target fiber's
//! slot and wakes it, then parks on its own slot. Exactly one thread of a
//! scheduler's family is awake at any instant, which is what makes the
//! runtime cooperatively single-threaded even though stacks are threads.

use crate::fiber::Resume;
use parking_lot::{Condvar, Mutex};

/// One fiber's side of the transfer protocol.
pub(crate) struct Handoff {
    slot: Mutex<Option<Resume>>,
    resumed: Condvar,
}

impl Handoff {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            resumed: Condvar::new(),
        }
    }

    /// Deposits `resume` and wakes the owning fiber.
    ///
    /// The slot is empty whenever this is called: the owner consumed the
    /// previous resume before it could possibly be scheduled again, because
    /// the scheduler allows at most one pending entry per fiber and the
    /// deliverer parks immediately after delivering.
    pub(crate) fn deliver(&self, resume: Resume) {
        let mut slot = self.slot.lock();
        debug_assert!(slot.is_none(), "double resume of a parked fiber");
        *slot = Some(resume);
        self.resumed.notify_one();
    }

    /// Parks the calling thread until a resume is delivered.
    pub(crate) fn wait(&self) -> Resume {
        let mut slot = self.slot.lock();
        loop {
            if let Some(resume) = slot.take() {
                return resume;
            }
            self.resumed.wait(&mut slot);
        }
    }
}
