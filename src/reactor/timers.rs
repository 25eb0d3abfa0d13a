use crate::fiber::{Fiber, Resume};
use crate::reactor::{Completion, WatcherKey};
use slab::Slab;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

/// Timer watchers: a slab of live entries plus a min-heap of deadlines.
///
/// Cancellation only removes the slab entry; the heap entry goes stale and is
/// skipped lazily when it surfaces. `purge` rebuilds the heap when the idle
/// maintenance pass runs.
pub(crate) struct TimerQueue {
    slab: Slab<TimerWatcher>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    generation: u64,
}

struct TimerWatcher {
    fiber: Fiber,
    resume: Option<Resume>,
    generation: u64,
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    deadline: Instant,
    index: usize,
    generation: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self {
            slab: Slab::new(),
            heap: BinaryHeap::new(),
            generation: 0,
        }
    }

    pub(crate) fn insert(&mut self, deadline: Instant, fiber: Fiber, resume: Resume) -> WatcherKey {
        self.generation += 1;
        let generation = self.generation;
        let index = self.slab.insert(TimerWatcher {
            fiber,
            resume: Some(resume),
            generation,
        });
        self.heap.push(Reverse(HeapEntry {
            deadline,
            index,
            generation,
        }));
        WatcherKey { index, generation }
    }

    /// Returns `false` when the timer already fired (or was never armed).
    pub(crate) fn cancel(&mut self, key: WatcherKey) -> bool {
        match self.slab.get(key.index) {
            Some(w) if w.generation == key.generation => {
                self.slab.remove(key.index);
                true
            }
            _ => false,
        }
    }

    /// The nearest live deadline, dropping stale heap entries on the way.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            let (deadline, index, generation) = (entry.deadline, entry.index, entry.generation);
            let live = matches!(self.slab.get(index), Some(w) if w.generation == generation);
            if live {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Fires every timer whose deadline has passed, in deadline order.
    pub(crate) fn expire(&mut self, now: Instant, completions: &mut Vec<Completion>) -> usize {
        let mut fired = 0;
        while let Some(Reverse(entry)) = self.heap.peek() {
            let (deadline, index, generation) = (entry.deadline, entry.index, entry.generation);
            let live = matches!(self.slab.get(index), Some(w) if w.generation == generation);
            if !live {
                self.heap.pop();
                continue;
            }
            if deadline > now {
                break;
            }
            self.heap.pop();
            let mut watcher = self.slab.remove(index);
            completions.push(Completion {
                fiber: watcher.fiber.clone(),
                resume: watcher.resume.take().expect("timer resume set at insert"),
            });
            fired += 1;
        }
        fired
    }

    pub(crate) fn len(&self) -> usize {
        self.slab.len()
    }

    /// Drops heap entries whose watcher was cancelled.
    pub(crate) fn purge(&mut self) {
        let slab = &self.slab;
        let live: Vec<_> = self
            .heap
            .drain()
            .filter(|Reverse(e)| {
                matches!(slab.get(e.index), Some(w) if w.generation == e.generation)
            })
            .collect();
        self.heap.extend(live);
    }
}
