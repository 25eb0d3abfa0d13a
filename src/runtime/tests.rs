use crate::fiber::{Error, Outcome, Value};
use crate::ops::{snooze, spin, suspend};
use crate::runtime::{Builder, Handle, Stats};
use anyhow::Result;
use parking_lot::Mutex;
use static_assertions::assert_impl_all;
use std::sync::Arc;

assert_impl_all!(Handle: Send, Sync, Clone);
assert_impl_all!(Stats: Send, Sync, Copy);

#[test]
fn test_run_returns_the_entry_value() -> Result<()> {
    let runtime = Builder::new().try_build()?;
    let value = runtime.run(|| Ok(41 + 1))?;
    assert_eq!(value, 42);
    Ok(())
}

#[test]
fn test_snooze_round_trips_the_sole_runnable_fiber() -> Result<()> {
    let runtime = Builder::new().try_build()?;
    runtime.run(|| {
        for _ in 0..10 {
            let resumed = snooze()?;
            assert!(resumed.is_nil());
        }
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_snoozing_fibers_resume_in_fifo_order() -> Result<()> {
    let runtime = Builder::new().try_build()?;
    runtime.run(|| {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::default();

        for name in ["a", "b", "c"] {
            let sink = Arc::clone(&order);
            spin(move || -> Outcome {
                sink.lock().push(name);
                Ok(Value::nil())
            });
        }

        snooze()?;
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_prioritized_termination_preempts_ordinary_resumes() -> Result<()> {
    let runtime = Builder::new().try_build()?;
    runtime.run(|| {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::default();

        let sink = Arc::clone(&order);
        let second = spin(move || -> Outcome {
            sink.lock().push("ordinary");
            Ok(Value::nil())
        });

        let sink = Arc::clone(&order);
        let stopped = spin(move || -> Outcome {
            sink.lock().push("never runs");
            Ok(Value::nil())
        });

        let sink = Arc::clone(&order);
        stopped.when_done(move |_| sink.lock().push("stopped"));

        // Front of the queue: terminates before `second` ever runs.
        stopped.stop(Value::nil());

        snooze()?;
        second.join()?;
        assert_eq!(*order.lock(), vec!["stopped", "ordinary"]);
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_suspend_with_nothing_pending_is_a_deadlock() -> Result<()> {
    let runtime = Builder::new().try_build()?;
    let result = runtime.run(|| suspend());
    assert!(matches!(result, Err(Error::Deadlock)));
    Ok(())
}

#[test]
fn test_join_on_self_is_a_deadlock() -> Result<()> {
    let runtime = Builder::new().try_build()?;
    runtime.run(|| {
        let myself: Arc<Mutex<Option<crate::Fiber>>> = Arc::default();
        let slot = Arc::clone(&myself);
        let fiber = spin(move || -> Outcome {
            let me = slot.lock().take().expect("own handle");
            match me.join() {
                Err(Error::Deadlock) => Ok(Value::nil()),
                other => panic!("expected deadlock, got {other:?}"),
            }
        });
        *myself.lock() = Some(fiber.clone());
        fiber.join()?;
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_resume_keeps_the_first_pending_entry() -> Result<()> {
    let runtime = Builder::new().try_build()?;
    runtime.run(|| {
        let seen: Arc<Mutex<Vec<i32>>> = Arc::default();
        let sink = Arc::clone(&seen);

        let fiber = spin(move || -> Outcome {
            let value = suspend()?;
            sink.lock().push(*value.downcast_ref::<i32>().expect("i32 resume"));
            Ok(Value::nil())
        });

        snooze()?; // let the fiber suspend
        fiber.resume(Value::new(7));
        fiber.resume(Value::new(8)); // ignored: one pending entry per fiber

        fiber.join()?;
        assert_eq!(*seen.lock(), vec![7]);
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_stats_count_switches_polls_and_ops() -> Result<()> {
    let runtime = Builder::new().try_build()?;
    let handle = runtime.handle();
    runtime.run(|| {
        let before = handle.stats();

        let fiber = spin(|| -> Outcome {
            crate::sleep(std::time::Duration::from_millis(1))?;
            Ok(Value::nil())
        });
        fiber.join()?;

        let after = handle.stats();
        assert!(after.switches > before.switches);
        assert!(after.polls > before.polls);
        assert!(after.ops > before.ops);
        assert_eq!(after.watchers.timers, 0);
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_idle_hook_runs_when_the_scheduler_blocks() -> Result<()> {
    let runtime = Builder::new().try_build()?;
    let handle = runtime.handle();

    let idle_calls: Arc<Mutex<u32>> = Arc::default();
    let sink = Arc::clone(&idle_calls);
    handle.set_idle_hook(move || *sink.lock() += 1);

    runtime.run(|| {
        // Sleeping leaves the scheduler with nothing runnable, which is
        // exactly when the idle hook must fire.
        crate::sleep(std::time::Duration::from_millis(2))?;
        Ok(())
    })?;

    assert!(*idle_calls.lock() > 0);
    Ok(())
}

#[test]
fn test_cross_thread_resume_breaks_a_blocking_poll() -> Result<()> {
    use std::time::{Duration, Instant};

    let runtime = Builder::new().try_build()?;
    runtime.run(|| {
        let event = crate::Event::new();
        let remote = event.clone();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            remote.signal(Value::new("poked"));
        });

        let start = Instant::now();
        let value = event.wait()?;
        assert_eq!(value.downcast_ref::<&str>(), Some(&"poked"));
        assert!(start.elapsed() < Duration::from_secs(10));

        waker.join().expect("waker thread");
        Ok(())
    })?;
    Ok(())
}
