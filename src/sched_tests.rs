//! Scheduler scenario tests
//!
//! Whole-scheduler runs exercising the event loop, the wait machine,
//! timescale hierarchies, actions, handles and the background pool.
//! Deterministic scenarios use the virtual clock; threaded scenarios run
//! in realtime mode with short real delays.

use crate::{Config, Mode, Scheduler, Signal, Wakeup};
use crate::{CurveAxes, CurveDescriptor, CurveElement};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn virtual_sched() -> Scheduler {
    Scheduler::new(Config { mode: Mode::Virtual, background_threads: 2, ..Config::default() })
}

fn realtime_sched() -> Scheduler {
    Scheduler::new(Config { mode: Mode::Realtime, background_threads: 2, ..Config::default() })
}

#[test]
fn test_run_returns_root_exit_code() {
    let exit = virtual_sched().run(|_ctx| async move { 42 });
    assert_eq!(exit, 42);
}

/// A task ticking twenty unit steps; the waiting main fiber resumes with
/// `Signaled` once it completes.
#[test]
fn test_tick_loop_completes_and_signals() {
    let events: Arc<Mutex<Vec<(usize, f64)>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = events.clone();

    let exit = virtual_sched().run(|ctx| async move {
        let task = ctx
            .task_create(move |ctx| async move {
                for i in 0..20 {
                    recorded.lock().unwrap().push((i, ctx.logical_position()));
                    ctx.wait(1.0).await;
                }
                7
            })
            .unwrap();

        let code = ctx.wait_completion(task).await;
        assert_eq!(code, Wakeup::Signaled);
        assert_eq!(ctx.handle_exit_code(task), Some(7));
        ctx.handle_release(task);
        0
    });
    assert_eq!(exit, 0);

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 20);
    for (i, (index, pos)) in events.iter().enumerate() {
        assert_eq!(*index, i);
        assert!((pos - i as f64).abs() < 1e-9, "tick {} at position {}", i, pos);
    }
}

static ORDERED_TICKS: AtomicUsize = AtomicUsize::new(0);

fn ordered_tick_cb(data: &[u8]) {
    let value = u32::from_le_bytes(data.try_into().unwrap());
    let seen = ORDERED_TICKS.fetch_add(1, Ordering::SeqCst);
    assert_eq!(value as usize, seen);
}

#[test]
fn test_actions_fire_in_order() {
    ORDERED_TICKS.store(0, Ordering::SeqCst);
    virtual_sched().run(|ctx| async move {
        for i in 0..5u32 {
            ctx.action(ordered_tick_cb, &i.to_le_bytes());
            ctx.wait(0.1).await;
        }
        ctx.wait(0.1).await;
        0
    });
    assert_eq!(ORDERED_TICKS.load(Ordering::SeqCst), 5);
}

#[test]
fn test_action_no_copy_owns_its_data() {
    let sum = Arc::new(AtomicUsize::new(0));
    let captured = sum.clone();
    virtual_sched().run(|ctx| async move {
        let payload = vec![1usize, 2, 3];
        ctx.action_no_copy(move || {
            captured.fetch_add(payload.iter().sum::<usize>(), Ordering::SeqCst);
        });
        ctx.wait(0.1).await;
        0
    });
    assert_eq!(sum.load(Ordering::SeqCst), 6);
}

/// Waits under a constant-tempo curve: one local step takes half a clock
/// second at tempo 2.
#[test]
fn test_curve_task_waits_follow_curve() {
    let times: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = times.clone();

    virtual_sched().run(|ctx| async move {
        let task = ctx
            .task_create(move |ctx| async move {
                for _ in 0..4 {
                    ctx.wait(1.0).await;
                    recorded.lock().unwrap().push(ctx.clock_now());
                }
                0
            })
            .unwrap();
        let descriptor = CurveDescriptor {
            axes: CurveAxes::PosTempo,
            elements: vec![CurveElement::constant(2.0, 100.0)],
        };
        ctx.task_set_tempo_curve(task, &descriptor).unwrap();

        let _ = ctx.wait_completion(task).await;
        ctx.handle_release(task);
        0
    });

    let times = times.lock().unwrap();
    assert_eq!(times.len(), 4);
    for (i, t) in times.iter().enumerate() {
        let expected = 0.5 * (i + 1) as f64;
        // Fibers may fire up to the look-ahead window early.
        assert!((t - expected).abs() < 0.02, "tick {} at {} expected {}", i, t, expected);
    }
}

/// Nested half-speed tasks: a wait of 4 at quarter speed spans 16 clock
/// seconds.
#[test]
fn test_hierarchical_scaling() {
    let resumed: Arc<Mutex<Option<(f64, f64)>>> = Arc::new(Mutex::new(None));
    let recorded = resumed.clone();

    virtual_sched().run(|ctx| async move {
        let outer = ctx
            .task_create(move |ctx| async move {
                let inner = ctx
                    .task_create(move |ctx| async move {
                        ctx.wait(4.0).await;
                        *recorded.lock().unwrap() = Some((ctx.clock_now(), ctx.logical_position()));
                        0
                    })
                    .unwrap();
                let me = ctx.task_self().unwrap();
                ctx.task_set_scaling(inner, 0.5);
                ctx.task_set_scaling(me, 0.5);
                ctx.handle_release(me);
                let _ = ctx.wait_completion(inner).await;
                ctx.handle_release(inner);
                0
            })
            .unwrap();
        let _ = ctx.wait_completion(outer).await;
        ctx.handle_release(outer);
        0
    });

    let (clock, pos) = resumed.lock().unwrap().expect("inner fiber resumed");
    assert_eq!(pos, 4.0);
    assert!((clock - 16.0).abs() < 0.02, "resumed at clock {}", clock);
}

/// Two fibers a millisecond apart fuse into the same sleep but still fire
/// strictly in order, ahead of real time.
#[test]
fn test_lookahead_fires_in_order() {
    let order: Arc<Mutex<Vec<(&'static str, f64)>>> = Arc::new(Mutex::new(Vec::new()));
    let o1 = order.clone();
    let o2 = order.clone();

    virtual_sched().run(|ctx| async move {
        let a = ctx
            .fiber_create(
                move |ctx| async move {
                    o1.lock().unwrap().push(("a", ctx.clock_now()));
                    0
                },
                0.005,
            )
            .unwrap();
        let b = ctx
            .fiber_create(
                move |ctx| async move {
                    o2.lock().unwrap().push(("b", ctx.clock_now()));
                    0
                },
                0.006,
            )
            .unwrap();

        ctx.wait(0.02).await;
        ctx.handle_release(a);
        ctx.handle_release(b);
        0
    });

    let order = order.lock().unwrap();
    let names: Vec<&str> = order.iter().map(|(n, _)| *n).collect();
    assert_eq!(names, vec!["a", "b"]);
    // Both fired inside the look-ahead window, before their nominal times.
    for (_, t) in order.iter() {
        assert!(*t < 0.005, "fired at {}", t);
    }
}

/// Handle slots recycle under pressure, and a stale handle resolves to
/// invalid even though its slot is live again.
#[test]
fn test_handle_recycle_generations() {
    let sched = Scheduler::new(Config {
        mode: Mode::Virtual,
        background_threads: 0,
        handle_slots: 8,
        ..Config::default()
    });
    sched.run(|ctx| async move {
        let mut stale = None;
        for _ in 0..20 {
            let fiber = ctx.fiber_create(|_| async move { 0 }, 0.0).unwrap();
            let code = ctx.wait_completion(fiber).await;
            assert_eq!(code, Wakeup::Signaled);
            if stale.is_none() {
                stale = Some(fiber);
            }
            ctx.handle_release(fiber);
        }
        let code = ctx.wait_for_handle(stale.unwrap(), Signal::COMPLETED, -1.0).await;
        assert_eq!(code, Wakeup::InvalidHandle);
        0
    });
}

#[test]
fn test_wait_for_handle_timeout_codes() {
    virtual_sched().run(|ctx| async move {
        let task = ctx
            .task_create(|ctx| async move {
                ctx.wait(10.0).await;
                0
            })
            .unwrap();

        // Zero timeout reports immediately.
        assert_eq!(ctx.wait_for_handle(task, Signal::COMPLETED, 0.0).await, Wakeup::Timeout);

        // Positive timeout expires before the task completes.
        let before = ctx.clock_now();
        assert_eq!(ctx.wait_for_handle(task, Signal::COMPLETED, 1.0).await, Wakeup::Timeout);
        assert!(ctx.clock_now() - before >= 0.9);

        // Unbounded wait sees the completion.
        assert_eq!(ctx.wait_for_handle(task, Signal::COMPLETED, -1.0).await, Wakeup::Signaled);

        // Already completed: signaled without parking.
        assert_eq!(ctx.wait_for_handle(task, Signal::COMPLETED, 5.0).await, Wakeup::Signaled);

        ctx.handle_release(task);
        0
    });
}

/// A task with no fibers left goes idle before it completes; both signals
/// are observable in order.
#[test]
fn test_idle_then_completed_signals() {
    virtual_sched().run(|ctx| async move {
        let task = ctx
            .task_create(|ctx| async move {
                let child = ctx
                    .task_create(|ctx| async move {
                        ctx.wait(2.0).await;
                        0
                    })
                    .unwrap();
                ctx.handle_release(child);
                0
            })
            .unwrap();

        assert_eq!(ctx.wait_idling(task).await, Wakeup::Signaled);
        // Idle but not completed: the child is still running.
        assert_eq!(ctx.wait_for_handle(task, Signal::COMPLETED, 0.0).await, Wakeup::Timeout);
        assert_eq!(ctx.wait_completion(task).await, Wakeup::Signaled);
        ctx.handle_release(task);
        0
    });
}

#[test]
fn test_fiber_suspend_resume() {
    let resumed_at: Arc<Mutex<Option<f64>>> = Arc::new(Mutex::new(None));
    let recorded = resumed_at.clone();

    virtual_sched().run(|ctx| async move {
        let fiber = ctx
            .fiber_create(
                move |ctx| async move {
                    ctx.suspend().await;
                    *recorded.lock().unwrap() = Some(ctx.clock_now());
                    0
                },
                0.0,
            )
            .unwrap();

        ctx.wait(1.0).await;
        ctx.fiber_resume(fiber);
        assert_eq!(ctx.wait_completion(fiber).await, Wakeup::Signaled);
        ctx.handle_release(fiber);
        0
    });

    let t = resumed_at.lock().unwrap().expect("fiber resumed");
    assert!((t - 1.0).abs() < 0.02, "resumed at {}", t);
}

/// Cancelling a task cancels its children and reports `Cancelled` to every
/// waiter.
#[test]
fn test_cancel_cascade() {
    let observed: Arc<Mutex<Option<Wakeup>>> = Arc::new(Mutex::new(None));
    let recorded = observed.clone();

    virtual_sched().run(|ctx| async move {
        let victim = ctx
            .task_create(|ctx| async move {
                let child = ctx
                    .task_create(|ctx| async move {
                        ctx.wait(100.0).await;
                        0
                    })
                    .unwrap();
                ctx.handle_release(child);
                ctx.wait(100.0).await;
                0
            })
            .unwrap();

        let watcher = ctx
            .fiber_create(
                move |ctx| async move {
                    *recorded.lock().unwrap() = Some(ctx.wait_completion(victim).await);
                    0
                },
                0.0,
            )
            .unwrap();

        ctx.wait(1.0).await;
        ctx.task_cancel(victim);

        assert_eq!(ctx.wait_completion(watcher).await, Wakeup::Signaled);
        // The cancelled task reads as completed afterwards.
        assert_eq!(ctx.wait_for_handle(victim, Signal::COMPLETED, 0.0).await, Wakeup::Signaled);
        ctx.handle_release(victim);
        ctx.handle_release(watcher);
        0
    });

    assert_eq!(*observed.lock().unwrap(), Some(Wakeup::Cancelled));
}

/// Suspending a task freezes its position and its events until resumed.
#[test]
fn test_task_suspend_freezes_time() {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();

    virtual_sched().run(|ctx| async move {
        let task = ctx
            .task_create(move |ctx| async move {
                for _ in 0..10_000 {
                    ctx.wait(1.0).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                0
            })
            .unwrap();

        ctx.wait(2.6).await; // ticks at 1.0 and 2.0
        ctx.task_suspend(task);
        ctx.wait(5.0).await; // frozen: no ticks
        ctx.task_resume(task);
        ctx.wait(2.0).await; // ticks at ~8.0 and ~9.0
        ctx.task_cancel(task);
        ctx.handle_release(task);
        0
    });

    assert_eq!(count.load(Ordering::SeqCst), 4);
}

#[test]
fn test_background_roundtrip() {
    let blocked = Arc::new(AtomicBool::new(false));
    let flag = blocked.clone();

    let exit = realtime_sched().run(|ctx| async move {
        let fiber = ctx
            .fiber_create(
                move |ctx| async move {
                    ctx.background().await;
                    // Off the scheduler thread: blocking is allowed here.
                    std::thread::sleep(Duration::from_millis(20));
                    flag.store(true, Ordering::SeqCst);
                    ctx.foreground().await;
                    9
                },
                0.0,
            )
            .unwrap();

        let code = ctx.wait_completion(fiber).await;
        assert_eq!(code, Wakeup::Signaled);
        assert_eq!(ctx.handle_exit_code(fiber), Some(9));
        ctx.handle_release(fiber);
        0
    });

    assert_eq!(exit, 0);
    assert!(blocked.load(Ordering::SeqCst));
}

/// A fiber that returns while still on the worker completes through the
/// message path.
#[test]
fn test_background_finish_on_worker() {
    realtime_sched().run(|ctx| async move {
        let fiber = ctx
            .fiber_create(
                |ctx| async move {
                    ctx.background().await;
                    3
                },
                0.0,
            )
            .unwrap();
        assert_eq!(ctx.wait_completion(fiber).await, Wakeup::Signaled);
        assert_eq!(ctx.handle_exit_code(fiber), Some(3));
        ctx.handle_release(fiber);
        0
    });
}

/// Cancelling a fiber that is blocked on a worker: waiters observe
/// `Cancelled` immediately, and the blocking section still runs to its end.
#[test]
fn test_background_cancel() {
    let release = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let observed: Arc<Mutex<Option<Wakeup>>> = Arc::new(Mutex::new(None));

    let release_in = release.clone();
    let finished_in = finished.clone();
    let recorded = observed.clone();

    realtime_sched().run(|ctx| async move {
        let blocker = ctx
            .fiber_create(
                move |ctx| async move {
                    ctx.background().await;
                    while !release_in.load(Ordering::SeqCst) {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    finished_in.store(true, Ordering::SeqCst);
                    ctx.foreground().await;
                    0
                },
                0.0,
            )
            .unwrap();

        let watcher = ctx
            .fiber_create(
                move |ctx| async move {
                    *recorded.lock().unwrap() = Some(ctx.wait_completion(blocker).await);
                    0
                },
                0.0,
            )
            .unwrap();

        ctx.wait(0.05).await;
        ctx.fiber_cancel(blocker);
        release.store(true, Ordering::SeqCst);

        assert_eq!(ctx.wait_completion(watcher).await, Wakeup::Signaled);
        ctx.handle_release(blocker);
        ctx.handle_release(watcher);
        0
    });

    assert_eq!(*observed.lock().unwrap(), Some(Wakeup::Cancelled));
    // Shutdown joins the workers, so the blocking section has finished.
    assert!(finished.load(Ordering::SeqCst));
}

/// An external thread can force-resume a suspended fiber; the fiber
/// observes `Timeout`, not `Signaled`.
#[test]
fn test_remote_fiber_wakeup() {
    let woke: Arc<Mutex<Option<Wakeup>>> = Arc::new(Mutex::new(None));
    let recorded = woke.clone();

    realtime_sched().run(|ctx| async move {
        let own_task = ctx.task_self().unwrap();
        let fiber = ctx
            .fiber_create(
                move |ctx| async move {
                    // The root task never completes while we wait on it.
                    let code = ctx.wait_for_handle(own_task, Signal::COMPLETED, -1.0).await;
                    *recorded.lock().unwrap() = Some(code);
                    0
                },
                0.0,
            )
            .unwrap();

        // Give the fiber time to park before anything wakes it.
        ctx.wait(0.05).await;

        let remote = ctx.remote();
        let producer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.fiber_wakeup(fiber);
        });

        assert_eq!(ctx.wait_completion(fiber).await, Wakeup::Signaled);
        producer.join().unwrap();

        ctx.handle_release(fiber);
        ctx.handle_release(own_task);
        0
    });

    assert_eq!(*woke.lock().unwrap(), Some(Wakeup::Timeout));
}

/// Consecutive waits land exactly on the accumulated logical location.
#[test]
fn test_wait_accumulates_exactly() {
    virtual_sched().run(|ctx| async move {
        let mut expected = ctx.logical_position();
        for _ in 0..5 {
            expected += 0.1;
            ctx.wait(0.1).await;
            assert_eq!(ctx.logical_position(), expected);
        }
        0
    });
}
