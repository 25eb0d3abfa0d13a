use crate::fiber::Value;
use std::collections::VecDeque;

/// Per-fiber message FIFO.
///
/// Consumed only by the owning fiber. When the owner is parked inside
/// `receive`, the next `send` bypasses the queue and resumes it with the
/// message directly; messages queued earlier are always drained first, so
/// delivery order is send order.
#[derive(Default)]
pub(crate) struct Mailbox {
    queue: VecDeque<Value>,
    receiver_waiting: bool,
}

impl Mailbox {
    pub(crate) fn push(&mut self, msg: Value) {
        self.queue.push_back(msg);
    }

    pub(crate) fn pop(&mut self) -> Option<Value> {
        self.queue.pop_front()
    }

    pub(crate) fn receiver_waiting(&self) -> bool {
        self.receiver_waiting
    }

    pub(crate) fn set_waiting(&mut self) {
        self.receiver_waiting = true;
    }

    pub(crate) fn clear_waiting(&mut self) {
        self.receiver_waiting = false;
    }

    pub(crate) fn clear(&mut self) {
        self.queue.clear();
        self.receiver_waiting = false;
    }
}
