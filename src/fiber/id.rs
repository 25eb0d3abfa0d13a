use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

/// An opaque ID that uniquely identifies a fiber relative to all other
/// fibers of the process.
///
/// IDs are never reused. They are sequential per process, not per scheduler,
/// so they do not indicate spawn order within one scheduler.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct Id(NonZeroU64);

const ROOT_ID_VAL: u64 = 1;

/// Reserved ID of a scheduler's root fiber.
pub(crate) static ROOT_ID: Id = Id(NonZeroU64::new(ROOT_ID_VAL).unwrap());

impl Id {
    pub(crate) fn next() -> Self {
        // Reserve ID == 1 for root fibers.
        static COUNTER: AtomicU64 = AtomicU64::new(ROOT_ID_VAL + 1);

        let id = COUNTER.fetch_add(1, Ordering::Relaxed);

        // Safety: this number is unimaginably large; even spawning a billion
        // fibers per second it would take centuries to wrap around.
        let Some(id) = NonZeroU64::new(id) else {
            Self::exhausted();
        };

        Self(id)
    }

    pub(crate) fn root() -> Self {
        ROOT_ID
    }

    #[cold]
    fn exhausted() -> ! {
        panic!("failed to generate unique fiber ID: bitspace exhausted")
    }

    pub fn as_u64(&self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_unique_and_never_root() {
        let ids: HashSet<Id> = (0..64).map(|_| Id::next()).collect();
        assert_eq!(ids.len(), 64);
        assert!(!ids.contains(&Id::root()));
    }
}
