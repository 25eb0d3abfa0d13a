// Public API
mod builder;
pub use builder::{Builder, Runtime};

mod scheduler;
pub use scheduler::{Handle, Scheduler, Stats};

// Internals
mod runqueue;
pub(crate) use runqueue::RunQueue;

#[cfg(test)]
mod tests;
