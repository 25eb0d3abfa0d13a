use crate::fiber::{Fiber, Resume};
use std::collections::VecDeque;

/// FIFO of runnable fibers awaiting CPU.
///
/// Holds at most one entry per fiber. Re-scheduling a queued fiber is
/// ignored unless prioritized, in which case the newer request replaces the
/// pending entry at the front (`interrupt`/`cancel` preempting ordinary
/// resumes).
pub(crate) struct RunQueue {
    entries: VecDeque<(Fiber, Resume)>,
}

impl RunQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub(crate) fn push_back(&mut self, fiber: Fiber, resume: Resume) {
        self.entries.push_back((fiber, resume));
    }

    pub(crate) fn push_front(&mut self, fiber: Fiber, resume: Resume) {
        self.entries.push_front((fiber, resume));
    }

    pub(crate) fn pop_front(&mut self) -> Option<(Fiber, Resume)> {
        self.entries.pop_front()
    }

    /// Removal by identity. O(queue length); idempotent.
    pub(crate) fn delete(&mut self, fiber: &Fiber) {
        self.entries.retain(|(f, _)| f.id() != fiber.id());
    }

    pub(crate) fn contains(&self, fiber: &Fiber) -> bool {
        self.entries.iter().any(|(f, _)| f.id() == fiber.id())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::Value;

    #[test]
    fn test_fifo_and_priority_order() {
        let mut queue = RunQueue::new(4);
        let a = Fiber::detached_for_tests();
        let b = Fiber::detached_for_tests();
        let c = Fiber::detached_for_tests();

        queue.push_back(a.clone(), Ok(Value::nil()));
        queue.push_back(b.clone(), Ok(Value::nil()));
        queue.push_front(c.clone(), Ok(Value::nil()));

        let order: Vec<_> = std::iter::from_fn(|| queue.pop_front())
            .map(|(f, _)| f.id())
            .collect();
        assert_eq!(order, vec![c.id(), a.id(), b.id()]);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let mut queue = RunQueue::new(4);
        let a = Fiber::detached_for_tests();
        queue.push_back(a.clone(), Ok(Value::nil()));

        assert!(queue.contains(&a));
        queue.delete(&a);
        assert!(!queue.contains(&a));
        queue.delete(&a);
        assert!(queue.is_empty());
    }
}
