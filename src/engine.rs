//! Scheduler engine
//!
//! The front object and its run loop. Each turn picks the next event
//! (the head action, the soonest fiber across all tasks, or an incoming
//! message), sleeping on the message condition until it is due. Fibers may
//! fire up to the look-ahead window ahead of real time to absorb timer
//! jitter; the look-ahead and the sleep residue are tracked as separate
//! scalars (the former is policy, the latter an accounting correction).

use crate::background::{Job, JobQueue, BACKGROUND_THREADS};
use crate::context::Ctx;
use crate::handle::HANDLE_SLOTS;
use crate::messages::{Message, MessageQueue};
use crate::scheduler::{Action, FiberFuture, FiberId, SchedCore, Status};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context as PollContext, Poll, RawWaker, RawWakerVTable, Waker};
use std::time::Instant;

/// Default early-fire window for fiber events.
pub const LOOK_AHEAD_WINDOW: f64 = 10e-3;

/// How the scheduler's clock advances.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Monotonic wall clock; timed sleeps really sleep.
    Realtime,
    /// Virtual clock; timed sleeps jump it forward instead. Deterministic
    /// and faster than real time.
    Virtual,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub mode: Mode,
    pub background_threads: usize,
    pub handle_slots: usize,
    pub look_ahead_window: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Realtime,
            background_threads: BACKGROUND_THREADS,
            handle_slots: HANDLE_SLOTS,
            look_ahead_window: LOOK_AHEAD_WINDOW,
        }
    }
}

/// Monotonic or virtual clock, in seconds since scheduler start.
pub(crate) struct Clock {
    kind: ClockKind,
}

enum ClockKind {
    Monotonic(Instant),
    Virtual(AtomicU64),
}

impl Clock {
    pub fn realtime() -> Self {
        Self { kind: ClockKind::Monotonic(Instant::now()) }
    }

    pub fn virtual_clock() -> Self {
        Self { kind: ClockKind::Virtual(AtomicU64::new(0f64.to_bits())) }
    }

    pub fn now(&self) -> f64 {
        match &self.kind {
            ClockKind::Monotonic(start) => start.elapsed().as_secs_f64(),
            ClockKind::Virtual(bits) => f64::from_bits(bits.load(Ordering::Acquire)),
        }
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.kind, ClockKind::Virtual(_))
    }

    /// Jump a virtual clock forward. Only the scheduler thread writes.
    pub fn advance(&self, dt: f64) {
        if let ClockKind::Virtual(bits) = &self.kind {
            let now = f64::from_bits(bits.load(Ordering::Acquire));
            bits.store((now + dt).to_bits(), Ordering::Release);
        }
    }
}

/// State shared between the scheduler thread, fiber contexts, background
/// workers and remote producers.
pub(crate) struct Shared {
    pub core: Mutex<SchedCore>,
    pub messages: MessageQueue,
    pub jobs: JobQueue,
    pub clock: Clock,
}

/// A waker that does nothing: fibers are re-polled when the scheduler picks
/// their event, never by wake-ups.
pub(crate) fn noop_waker() -> Waker {
    fn raw() -> RawWaker {
        unsafe fn clone_fn(_: *const ()) -> RawWaker {
            raw()
        }
        unsafe fn wake_fn(_: *const ()) {}
        unsafe fn wake_by_ref_fn(_: *const ()) {}
        unsafe fn drop_fn(_: *const ()) {}
        static VTABLE: RawWakerVTable =
            RawWakerVTable::new(clone_fn, wake_fn, wake_by_ref_fn, drop_fn);
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe { Waker::from_raw(raw()) }
}

enum Picked {
    Action(Action),
    Fiber(FiberId),
    Message,
}

/// The scheduler. Owns the run loop; everything else reaches the shared
/// state through [`Ctx`] or [`crate::Remote`].
pub struct Scheduler {
    shared: Arc<Shared>,
    last_time_update: f64,
    sleep_residue: f64,
}

impl Scheduler {
    pub fn new(config: Config) -> Self {
        let clock = match config.mode {
            Mode::Realtime => Clock::realtime(),
            Mode::Virtual => Clock::virtual_clock(),
        };
        let shared = Arc::new(Shared {
            core: Mutex::new(SchedCore::new(config.handle_slots, config.look_ahead_window)),
            messages: MessageQueue::new(),
            jobs: JobQueue::new(),
            clock,
        });
        JobQueue::start(&shared, config.background_threads);
        Self { shared, last_time_update: 0.0, sleep_residue: 0.0 }
    }

    /// Run `proc` as the main fiber of a fresh root task, driving the loop
    /// until the root task completes. Cancels any stragglers and joins the
    /// worker pool on the way out; returns the root task's exit code.
    pub fn run<F, Fut>(mut self, proc: F) -> i64
    where
        F: FnOnce(Ctx) -> Fut,
        Fut: Future<Output = i64> + Send + 'static,
    {
        let (root, main_fiber) = {
            let mut core = self.shared.core.lock();
            let root = core.spawn_task(None);
            // Pin the record so the exit code survives completion.
            core.task_mut(root).open_handles = 1;
            let fiber = core.alloc_fiber_record(root);
            core.task_mut(root).main_fiber = Some(fiber);
            (root, fiber)
        };

        let ctx = Ctx::new(self.shared.clone(), main_fiber, root);
        let future: FiberFuture = Box::pin(proc(ctx));
        {
            let mut core = self.shared.core.lock();
            core.attach_future(main_fiber, future);
            core.reschedule_in_steps(main_fiber, 0.0);
        }

        self.last_time_update = self.shared.clock.now();
        loop {
            match self.pick_event() {
                Picked::Action(action) => action.run(),
                Picked::Fiber(fiber) => self.dispatch_fiber(fiber),
                Picked::Message => self.dispatch_messages(),
            }
            if self.shared.core.lock().task_status(root) == Status::Completed {
                break;
            }
        }

        let exit = self.shared.core.lock().task(root).exit_code;
        self.end();
        exit
    }

    /// Determine the next event, sleeping until it is due.
    fn pick_event(&mut self) -> Picked {
        let (next_action_delay, fiber_pick, look_ahead, window) = {
            let mut core = self.shared.core.lock();
            let action_delay = core.actions.front().map(|a| a.delay);
            let fiber = core.next_fiber_event();
            (action_delay, fiber, core.look_ahead, core.look_ahead_window)
        };

        // Delay of the fiber event measured from the logical front.
        let fiber_delay_from_logical = fiber_pick.map(|(_, delay)| delay + look_ahead);

        let mut logical_timeout = 0.0;
        let mut next_is_action = false;

        if fiber_pick.is_some() || next_action_delay.is_some() {
            // Fibers may fire up to the window early; actions may not.
            let window_shift = fiber_delay_from_logical
                .map(|d| (d - window).max(0.0))
                .unwrap_or(f64::MAX);
            let action_delay = next_action_delay.unwrap_or(f64::MAX);

            next_is_action = action_delay < window_shift;
            logical_timeout = if next_is_action { action_delay } else { window_shift };

            if logical_timeout > 0.0 {
                let working_time = self.shared.clock.now() - self.last_time_update;
                let real_timeout = logical_timeout + self.sleep_residue - working_time;
                if real_timeout <= 0.0 {
                    self.sleep_residue = real_timeout;
                } else {
                    self.shared
                        .messages
                        .wait_for_message_or_timeout(real_timeout, &self.shared.clock);
                }
            }
        } else {
            self.shared.messages.wait_for_message();
        }

        let mut core = self.shared.core.lock();
        if !self.shared.messages.has_messages() {
            // Woke on timeout, so there was a scheduled fiber or action.
            let now = self.shared.clock.now();
            let elapsed = now - self.last_time_update;
            self.last_time_update = now;
            self.sleep_residue += logical_timeout - elapsed;

            if next_is_action {
                let position_update = (logical_timeout - core.look_ahead).max(0.0);
                core.look_ahead = (core.look_ahead - logical_timeout).max(0.0);
                core.update_task_positions(position_update);

                let action = core.actions.pop_front().expect("picked action");
                Picked::Action(action)
            } else {
                let (fiber, fiber_delay) = fiber_pick.expect("picked fiber");
                if let Some(head) = core.actions.front_mut() {
                    head.delay -= logical_timeout;
                }
                // Positions advance to the event; what the sleep did not
                // cover becomes consumed look-ahead. Curve round-trips can
                // leave an overdue event marginally in the past; clamp.
                core.look_ahead =
                    (fiber_delay_from_logical.expect("fiber delay") - logical_timeout).max(0.0);
                core.update_task_positions(fiber_delay.max(0.0));
                Picked::Fiber(fiber)
            }
        } else {
            let now = self.shared.clock.now();
            let elapsed = now - self.last_time_update;
            self.last_time_update = now;
            self.sleep_residue = 0.0;

            let position_update = (elapsed - core.look_ahead).max(0.0);
            core.look_ahead = (core.look_ahead - elapsed).max(0.0);
            core.update_task_positions(position_update);

            if let Some(head) = core.actions.front_mut() {
                head.delay -= elapsed;
            }
            Picked::Message
        }
    }

    /// Poll the picked fiber once and sort out what its yield meant.
    fn dispatch_fiber(&mut self, fiber_id: FiberId) {
        let future = self.shared.core.lock().begin_fiber_dispatch(fiber_id);
        let Some(mut future) = future else {
            return;
        };

        let waker = noop_waker();
        let mut cx = PollContext::from_waker(&waker);
        let poll = future.as_mut().poll(&mut cx);

        let mut job = None;
        let mut orphan = None;
        {
            let mut core = self.shared.core.lock();
            match poll {
                Poll::Ready(code) => {
                    if core.fiber_status(fiber_id) != Status::Completed {
                        core.fiber_mut(fiber_id).exit_code = code;
                        core.fiber_complete(fiber_id);
                    }
                    core.end_fiber_dispatch(fiber_id);
                    orphan = Some(future);
                }
                Poll::Pending => match core.fiber_status(fiber_id) {
                    Status::Background => {
                        core.fiber_mut(fiber_id).in_background = true;
                        core.end_fiber_dispatch(fiber_id);
                        job = Some(Job { fiber: fiber_id, future });
                    }
                    Status::Completed => {
                        // Cancelled itself mid-flight; the coroutine is
                        // abandoned.
                        core.end_fiber_dispatch(fiber_id);
                        orphan = Some(future);
                    }
                    _ => {
                        core.fiber_mut(fiber_id).future = Some(future);
                        core.end_fiber_dispatch(fiber_id);
                    }
                },
            }
        }
        if let Some(job) = job {
            self.shared.jobs.push(job);
        }
        // User destructors run outside the core lock.
        drop(orphan);
    }

    fn dispatch_messages(&mut self) {
        while let Some(message) = self.shared.messages.next() {
            let mut core = self.shared.core.lock();
            match message {
                Message::Foreground { fiber, outcome } => core.do_foreground(fiber, outcome),
                Message::Wakeup { fiber } => core.do_wakeup(fiber),
            }
        }
    }

    /// Tear down: cancel everything still alive and join the workers.
    fn end(&mut self) {
        {
            let mut core = self.shared.core.lock();
            let running = core.running_tasks.clone();
            for task in running {
                // A parent's cancellation may already have recycled this one.
                if core.task_exists(task) {
                    core.task_cancel(task);
                }
            }
            let suspended = core.suspended_tasks.clone();
            for task in suspended {
                if core.task_exists(task) {
                    core.task_cancel(task);
                }
            }
            core.actions.clear();
        }
        self.shared.jobs.shutdown();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shared.jobs.shutdown();
    }
}
