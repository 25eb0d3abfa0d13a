/// A guard that executes a closure when it goes out of scope.
///
/// Every suspension primitive owns a watcher for the duration of its wait;
/// wrapping the deregistration in a `ScopeGuard` guarantees release on every
/// exit path (normal completion, error propagation, cancellation). The
/// closure always runs: watcher removal is keyed by generation, so releasing
/// one the reactor already consumed is a no-op.
pub(crate) struct ScopeGuard<F: FnOnce()> {
    // Wrapped in an `Option` so the closure can be taken out exactly once
    // on drop.
    closure: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub(crate) fn new(closure: F) -> Self {
        ScopeGuard {
            closure: Some(closure),
        }
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(closure) = self.closure.take() {
            closure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_guard_runs_on_drop() {
        let ran = Cell::new(false);
        {
            let _guard = ScopeGuard::new(|| ran.set(true));
            assert!(!ran.get());
        }
        assert!(ran.get());
    }
}
