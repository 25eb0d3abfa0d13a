//! A per-thread cooperative fiber runtime.
//!
//! Lightweight fibers are multiplexed onto one logical thread of control per
//! scheduler and parked on a reactor for fd readiness, timers, child exits
//! and cross-thread wakeups. Concurrency is structured: fibers form a
//! supervision tree, a terminating fiber stops its children first, and
//! orphaned errors surface in the parent.
//!
//! ```no_run
//! use spindle::{Builder, Value, sleep, spin};
//! use std::time::Duration;
//!
//! let runtime = Builder::new().try_build().unwrap();
//! runtime
//!     .run(|| {
//!         let worker = spin(|| {
//!             sleep(Duration::from_millis(10))?;
//!             Ok(Value::new("done"))
//!         });
//!         let result = worker.join()?;
//!         assert_eq!(result.downcast_ref::<&str>(), Some(&"done"));
//!         Ok(())
//!     })
//!     .unwrap();
//! ```

pub mod fiber;
pub use fiber::{Error, Fiber, Id, Outcome, Resume, Value};

pub mod ops;
pub use ops::{
    Event, await_all, cancel_after, move_on_after, receive, sleep, snooze, spin, suspend, timeout,
    timer_loop, wait_child, wait_io,
};

pub mod reactor;

pub mod runtime;
pub use runtime::{Builder, Runtime, Stats};

mod context;

mod utils;
