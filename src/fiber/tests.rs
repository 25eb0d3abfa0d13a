use crate::fiber::{Error, Fiber, Outcome, Value};
use crate::ops::{receive, snooze, spin, suspend};
use crate::runtime::Builder;
use anyhow::Result;
use parking_lot::Mutex;
use static_assertions::assert_impl_all;
use std::sync::Arc;

assert_impl_all!(Fiber: Send, Sync, Clone);

#[test]
fn test_mailbox_delivers_in_send_order() -> Result<()> {
    let runtime = Builder::new().try_build()?;
    runtime.run(|| {
        let msgs: Arc<Mutex<Vec<i32>>> = Arc::default();
        let sink = Arc::clone(&msgs);

        let fiber = spin(move || -> Outcome {
            loop {
                let msg = receive()?;
                sink.lock().push(*msg.downcast_ref::<i32>().expect("i32 message"));
            }
        });

        for i in 0..3 {
            fiber.send(Value::new(i));
        }
        for _ in 0..3 {
            snooze()?;
        }

        assert_eq!(*msgs.lock(), vec![0, 1, 2]);

        fiber.stop(Value::nil());
        fiber.join()?;
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_cancel_unwinds_at_next_yield() -> Result<()> {
    let runtime = Builder::new().try_build()?;
    runtime.run(|| {
        let seen: Arc<Mutex<Vec<i32>>> = Arc::default();
        let sink = Arc::clone(&seen);

        let fiber = spin(move || -> Outcome {
            sink.lock().push(1);
            snooze()?;
            snooze()?;
            sink.lock().push(2);
            Ok(Value::nil())
        });

        // Let the fiber reach its first snooze before cancelling it.
        snooze()?;
        fiber.cancel();

        let outcome = fiber.join();
        assert!(matches!(outcome, Err(Error::Cancel)));
        assert!(!fiber.is_alive());
        assert!(matches!(fiber.result(), Some(Err(Error::Cancel))));
        assert_eq!(*seen.lock(), vec![1]);
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_stop_terminates_with_value() -> Result<()> {
    let runtime = Builder::new().try_build()?;
    runtime.run(|| {
        let seen: Arc<Mutex<Vec<i32>>> = Arc::default();
        let sink = Arc::clone(&seen);

        let fiber = spin(move || -> Outcome {
            sink.lock().push(1);
            snooze()?;
            snooze()?;
            sink.lock().push(2);
            Ok(Value::new(3))
        });

        snooze()?;
        fiber.stop(Value::new(42));

        let value = fiber.join()?;
        assert_eq!(value.downcast_ref::<i32>(), Some(&42));
        assert!(!fiber.is_alive());
        assert_eq!(*seen.lock(), vec![1]);
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_stop_before_first_run_skips_the_body() -> Result<()> {
    let runtime = Builder::new().try_build()?;
    runtime.run(|| {
        let fiber = spin(|| -> Outcome { panic!("body must not run") });
        fiber.stop(Value::new(7));

        let value = fiber.join()?;
        assert_eq!(value.downcast_ref::<i32>(), Some(&7));
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_orphan_error_surfaces_in_parent() -> Result<()> {
    let runtime = Builder::new().try_build()?;
    runtime.run(|| {
        spin(|| -> Outcome {
            snooze()?;
            Err(Error::failure("bar"))
        });

        // The child is never awaited; its error lands at our next resume.
        match suspend() {
            Err(Error::Failure(msg)) => assert_eq!(msg, "bar"),
            other => panic!("expected the child's failure, got {other:?}"),
        }
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_all_awaiters_observe_the_same_outcome() -> Result<()> {
    let runtime = Builder::new().try_build()?;
    runtime.run(|| {
        let target = spin(|| -> Outcome {
            snooze()?;
            Ok(Value::new("shared"))
        });

        let watchers: Vec<Fiber> = (0..3)
            .map(|_| {
                let target = target.clone();
                spin(move || -> Outcome {
                    let value = target.join()?;
                    assert_eq!(value.downcast_ref::<&str>(), Some(&"shared"));
                    Ok(Value::nil())
                })
            })
            .collect();

        for watcher in &watchers {
            watcher.join()?;
        }
        assert_eq!(
            target.result().unwrap()?.downcast_ref::<&str>(),
            Some(&"shared")
        );
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_join_after_termination_returns_the_result() -> Result<()> {
    let runtime = Builder::new().try_build()?;
    runtime.run(|| {
        let fiber = spin(|| -> Outcome { Ok(Value::new(9u8)) });
        snooze()?;
        assert!(!fiber.is_alive());

        let value = fiber.join()?;
        assert_eq!(value.downcast_ref::<u8>(), Some(&9));
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_parent_termination_stops_descendants_first() -> Result<()> {
    let runtime = Builder::new().try_build()?;
    runtime.run(|| {
        let tree: Arc<Mutex<Vec<Fiber>>> = Arc::default();
        let sink = Arc::clone(&tree);

        let parent = spin(move || -> Outcome {
            let inner_sink = Arc::clone(&sink);
            let child = spin(move || -> Outcome {
                let grandchild = spin(|| -> Outcome {
                    suspend()?;
                    Ok(Value::nil())
                });
                inner_sink.lock().push(grandchild);
                suspend()?;
                Ok(Value::nil())
            });
            sink.lock().push(child);
            snooze()?;
            Ok(Value::nil())
        });

        parent.join()?;
        for descendant in tree.lock().iter() {
            assert!(!descendant.is_alive());
        }
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_when_done_runs_on_termination_and_retroactively() -> Result<()> {
    let runtime = Builder::new().try_build()?;
    runtime.run(|| {
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::default();

        let fiber = spin(|| -> Outcome { Ok(Value::new(1)) });
        let sink = Arc::clone(&log);
        fiber.when_done(move |outcome| {
            assert!(outcome.is_ok());
            sink.lock().push("registered before");
        });

        snooze()?;
        assert!(!fiber.is_alive());

        let sink = Arc::clone(&log);
        fiber.when_done(move |outcome| {
            assert!(outcome.is_ok());
            sink.lock().push("registered after");
        });

        assert_eq!(*log.lock(), vec!["registered before", "registered after"]);
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_send_to_terminated_fiber_is_a_noop() -> Result<()> {
    let runtime = Builder::new().try_build()?;
    runtime.run(|| {
        let fiber = spin(|| -> Outcome { Ok(Value::nil()) });
        fiber.join()?;
        fiber.send(Value::new(1));
        fiber.resume(Value::new(2));
        assert!(!fiber.is_alive());
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_fiber_panic_becomes_a_failure_outcome() -> Result<()> {
    let runtime = Builder::new().try_build()?;
    runtime.run(|| {
        let fiber = spin(|| -> Outcome { panic!("boom") });
        match fiber.join() {
            Err(Error::Failure(msg)) => assert_eq!(msg, "boom"),
            other => panic!("expected failure, got {other:?}"),
        }
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_spawn_site_location_is_captured() -> Result<()> {
    let runtime = Builder::new().try_build()?;
    runtime.run(|| {
        let fiber = spin(|| -> Outcome { Ok(Value::nil()) });
        assert!(fiber.location().file().ends_with("tests.rs"));
        fiber.join()?;
        Ok(())
    })?;
    Ok(())
}
