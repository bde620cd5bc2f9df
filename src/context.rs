//! Fiber context
//!
//! `Ctx` is the fiber-facing API of the scheduler: every fiber proc receives
//! one, and all cooperative operations (waits, suspension, background
//! migration, task and fiber management, actions) go through it. The wait
//! primitives are small hand-written futures that register with the core on
//! their first poll, yield once, and read their wakeup on resumption; the
//! scheduler re-polls a fiber only when its event is due, so no waker
//! machinery is involved.

use crate::curve::{CurveDescriptor, CurveError};
use crate::engine::Shared;
use crate::handle::{FiberHandle, Handle, TaskHandle};
use crate::messages::Message;
use crate::scheduler::{
    ActionPayload, FiberFuture, FiberId, Signal, Steps, TaskId, Wakeup,
};
use smallvec::SmallVec;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as PollContext, Poll};

/// Execution context of a fiber.
///
/// Cloneable and `Send`: a fiber may hand copies to the closures it
/// schedules, and keeps using its own across a background migration.
#[derive(Clone)]
pub struct Ctx {
    shared: Arc<Shared>,
    fiber: FiberId,
    task: TaskId,
}

impl Ctx {
    pub(crate) fn new(shared: Arc<Shared>, fiber: FiberId, task: TaskId) -> Self {
        Self { shared, fiber, task }
    }

    //----------------------------------------------------------------------
    // Self-scheduling primitives
    //----------------------------------------------------------------------

    /// Yield and resume `steps` later on the task's timescale.
    ///
    /// The resumption location is exactly the task's current logical
    /// location plus `steps`; waits accumulate without drift.
    pub fn wait(&self, steps: Steps) -> Wait {
        Wait { shared: self.shared.clone(), fiber: self.fiber, steps, armed: false }
    }

    /// Park this fiber until something resumes it.
    pub fn suspend(&self) -> Suspend {
        Suspend { shared: self.shared.clone(), fiber: self.fiber, armed: false }
    }

    /// Migrate to a background worker thread. Everything between this call
    /// and [`Ctx::foreground`] runs off the scheduler thread and may block.
    pub fn background(&self) -> Background {
        Background { shared: self.shared.clone(), fiber: self.fiber, armed: false }
    }

    /// Return from a background worker to the scheduler thread; the fiber
    /// is rescheduled with no delay.
    pub fn foreground(&self) -> Foreground {
        Foreground { armed: false }
    }

    /// Park until `handle` raises a signal in `signal`, or `timeout` local
    /// steps pass. A zero timeout reports `Timeout` immediately; a negative
    /// timeout waits forever.
    pub fn wait_for_handle(
        &self,
        handle: impl Into<Handle>,
        signal: Signal,
        timeout: Steps,
    ) -> WaitForHandle {
        WaitForHandle {
            shared: self.shared.clone(),
            fiber: self.fiber,
            handle: handle.into(),
            signal,
            timeout,
            armed: false,
        }
    }

    /// Wait until the object goes idle.
    pub fn wait_idling(&self, handle: impl Into<Handle>) -> WaitForHandle {
        self.wait_for_handle(handle, Signal::IDLE, -1.0)
    }

    /// Wait until the object completes.
    pub fn wait_completion(&self, handle: impl Into<Handle>) -> WaitForHandle {
        self.wait_for_handle(handle, Signal::COMPLETED, -1.0)
    }

    //----------------------------------------------------------------------
    // Tasks
    //----------------------------------------------------------------------

    /// Create a child task of the current task, with `proc` as its main
    /// fiber. Returns `None` when the handle table is full.
    pub fn task_create<F, Fut>(&self, proc: F) -> Option<TaskHandle>
    where
        F: FnOnce(Ctx) -> Fut,
        Fut: Future<Output = i64> + Send + 'static,
    {
        self.task_create_with_parent_id(self.task, proc)
    }

    /// Create a child task of an explicit parent.
    pub fn task_create_for_parent<F, Fut>(&self, parent: TaskHandle, proc: F) -> Option<TaskHandle>
    where
        F: FnOnce(Ctx) -> Fut,
        Fut: Future<Output = i64> + Send + 'static,
    {
        let parent = self.shared.core.lock().handles.get_task(parent)?;
        self.task_create_with_parent_id(parent, proc)
    }

    fn task_create_with_parent_id<F, Fut>(&self, parent: TaskId, proc: F) -> Option<TaskHandle>
    where
        F: FnOnce(Ctx) -> Fut,
        Fut: Future<Output = i64> + Send + 'static,
    {
        let (task_id, fiber_id, handle) = {
            let mut core = self.shared.core.lock();
            let task_id = core.spawn_task(Some(parent));
            let Some(handle) = core.handles.alloc_task(task_id) else {
                core.abort_spawn_task(task_id);
                return None;
            };
            core.task_mut(task_id).open_handles = 1;
            let fiber_id = core.alloc_fiber_record(task_id);
            core.task_mut(task_id).main_fiber = Some(fiber_id);
            (task_id, fiber_id, handle)
        };

        // The proc is invoked outside the lock; it only builds the future.
        let ctx = Ctx::new(self.shared.clone(), fiber_id, task_id);
        let future: FiberFuture = Box::pin(proc(ctx));

        let mut core = self.shared.core.lock();
        core.attach_future(fiber_id, future);
        core.reschedule_in_steps(fiber_id, 0.0);
        Some(handle)
    }

    /// A fresh handle to the current task.
    pub fn task_self(&self) -> Option<TaskHandle> {
        let mut core = self.shared.core.lock();
        let handle = core.handles.alloc_task(self.task)?;
        core.task_mut(self.task).open_handles += 1;
        Some(handle)
    }

    /// Cancel a task, its children, and all their fibers. Waiters observe
    /// `Cancelled`.
    pub fn task_cancel(&self, handle: TaskHandle) {
        let mut core = self.shared.core.lock();
        if let Some(task_id) = core.handles.get_task(handle) {
            core.task_cancel(task_id);
        }
    }

    /// Freeze a task: it is skipped by event picking and position updates.
    pub fn task_suspend(&self, handle: TaskHandle) {
        let mut core = self.shared.core.lock();
        if let Some(task_id) = core.handles.get_task(handle) {
            core.task_suspend(task_id);
        }
    }

    pub fn task_resume(&self, handle: TaskHandle) {
        let mut core = self.shared.core.lock();
        if let Some(task_id) = core.handles.get_task(handle) {
            core.task_resume(task_id);
        }
    }

    /// Relate the task's timescale to its source by a constant factor.
    pub fn task_set_scaling(&self, handle: TaskHandle, scaling: f64) {
        let mut core = self.shared.core.lock();
        if let Some(task_id) = core.handles.get_task(handle) {
            core.set_scaling(task_id, scaling);
        }
    }

    /// Drive the task's timescale by a tempo curve. On a build error the
    /// previous timescale stays in place.
    pub fn task_set_tempo_curve(
        &self,
        handle: TaskHandle,
        descriptor: &CurveDescriptor,
    ) -> Result<(), CurveError> {
        let mut core = self.shared.core.lock();
        match core.handles.get_task(handle) {
            Some(task_id) => core.set_tempo_curve(task_id, descriptor),
            None => Ok(()),
        }
    }

    //----------------------------------------------------------------------
    // Fibers
    //----------------------------------------------------------------------

    /// Create a fiber on the current task, first scheduled `steps` from the
    /// task's logical location.
    pub fn fiber_create<F, Fut>(&self, proc: F, steps: Steps) -> Option<FiberHandle>
    where
        F: FnOnce(Ctx) -> Fut,
        Fut: Future<Output = i64> + Send + 'static,
    {
        self.fiber_create_with_task_id(self.task, proc, steps)
    }

    /// Create a fiber on an explicit task.
    pub fn fiber_create_for_task<F, Fut>(
        &self,
        task: TaskHandle,
        proc: F,
        steps: Steps,
    ) -> Option<FiberHandle>
    where
        F: FnOnce(Ctx) -> Fut,
        Fut: Future<Output = i64> + Send + 'static,
    {
        let task_id = self.shared.core.lock().handles.get_task(task)?;
        self.fiber_create_with_task_id(task_id, proc, steps)
    }

    fn fiber_create_with_task_id<F, Fut>(
        &self,
        task_id: TaskId,
        proc: F,
        steps: Steps,
    ) -> Option<FiberHandle>
    where
        F: FnOnce(Ctx) -> Fut,
        Fut: Future<Output = i64> + Send + 'static,
    {
        let (fiber_id, handle) = {
            let mut core = self.shared.core.lock();
            let fiber_id = core.alloc_fiber_record(task_id);
            let Some(handle) = core.handles.alloc_fiber(fiber_id) else {
                core.abort_spawn_fiber(fiber_id);
                return None;
            };
            core.fiber_mut(fiber_id).open_handles = 1;
            (fiber_id, handle)
        };

        let ctx = Ctx::new(self.shared.clone(), fiber_id, task_id);
        let future: FiberFuture = Box::pin(proc(ctx));

        let mut core = self.shared.core.lock();
        core.attach_future(fiber_id, future);
        core.reschedule_in_steps(fiber_id, steps);
        Some(handle)
    }

    /// A fresh handle to the current fiber.
    pub fn fiber_self(&self) -> Option<FiberHandle> {
        let mut core = self.shared.core.lock();
        let handle = core.handles.alloc_fiber(self.fiber)?;
        core.fiber_mut(self.fiber).open_handles += 1;
        Some(handle)
    }

    /// Cancel a fiber; its waiters observe `Cancelled`. Cancelling the
    /// current fiber takes effect at its next suspension point.
    pub fn fiber_cancel(&self, handle: FiberHandle) {
        let mut core = self.shared.core.lock();
        if let Some(fiber_id) = core.handles.get_fiber(handle) {
            core.fiber_cancel(fiber_id);
        }
    }

    /// Move a fiber to its task's suspended list. Suspending the current
    /// fiber only takes effect at its next yield; use [`Ctx::suspend`] to
    /// park immediately.
    pub fn fiber_suspend(&self, handle: FiberHandle) {
        let mut core = self.shared.core.lock();
        if let Some(fiber_id) = core.handles.get_fiber(handle) {
            core.fiber_suspend(fiber_id);
        }
    }

    pub fn fiber_resume(&self, handle: FiberHandle) {
        let mut core = self.shared.core.lock();
        if let Some(fiber_id) = core.handles.get_fiber(handle) {
            core.fiber_resume(fiber_id);
        }
    }

    //----------------------------------------------------------------------
    // Handles
    //----------------------------------------------------------------------

    /// Release a handle. The object is recycled once it is completed and no
    /// other handles refer to it. Releasing an invalid handle is a no-op.
    pub fn handle_release(&self, handle: impl Into<Handle>) {
        self.shared.core.lock().handle_release(handle.into());
    }

    /// Exit code of the object behind `handle`, or `None` for an invalid
    /// handle.
    pub fn handle_exit_code(&self, handle: impl Into<Handle>) -> Option<i64> {
        self.shared.core.lock().handle_exit_code(handle.into())
    }

    //----------------------------------------------------------------------
    // Actions
    //----------------------------------------------------------------------

    /// Schedule `callback` to fire at the current logical front with a copy
    /// of `data` (inline up to [`crate::ACTION_INLINE_SIZE`] bytes).
    pub fn action(&self, callback: fn(&[u8]), data: &[u8]) {
        let payload = ActionPayload::Bytes { callback, data: SmallVec::from_slice(data) };
        self.shared.core.lock().schedule_action(payload);
    }

    /// Schedule a closure to fire at the current logical front without
    /// copying; the closure owns its data.
    pub fn action_no_copy(&self, f: impl FnOnce() + Send + 'static) {
        self.shared.core.lock().schedule_action(ActionPayload::Thunk(Box::new(f)));
    }

    //----------------------------------------------------------------------
    // Introspection / cross-thread
    //----------------------------------------------------------------------

    /// The current task's logical location, in its own units.
    pub fn logical_position(&self) -> f64 {
        self.shared.core.lock().task(self.task).logical_loc
    }

    /// Seconds since the scheduler started, on its clock (wall or virtual).
    pub fn clock_now(&self) -> f64 {
        self.shared.clock.now()
    }

    /// A handle usable from other threads to wake fibers up.
    pub fn remote(&self) -> Remote {
        Remote { shared: self.shared.clone() }
    }
}

/// Cross-thread entry point into the scheduler. Only posts messages; safe
/// to clone and move anywhere.
#[derive(Clone)]
pub struct Remote {
    shared: Arc<Shared>,
}

impl Remote {
    /// Force-resume a suspended fiber. The fiber observes `Timeout`.
    pub fn fiber_wakeup(&self, fiber: FiberHandle) {
        self.shared.messages.commit(Message::Wakeup { fiber });
    }
}

//--------------------------------------------------------------------------
// Cooperative futures
//--------------------------------------------------------------------------

#[must_use = "futures do nothing unless awaited"]
pub struct Wait {
    shared: Arc<Shared>,
    fiber: FiberId,
    steps: Steps,
    armed: bool,
}

impl Future for Wait {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut PollContext<'_>) -> Poll<()> {
        let this = self.as_mut().get_mut();
        if this.armed {
            return Poll::Ready(());
        }
        this.armed = true;
        this.shared.core.lock().reschedule_in_steps(this.fiber, this.steps);
        Poll::Pending
    }
}

#[must_use = "futures do nothing unless awaited"]
pub struct Suspend {
    shared: Arc<Shared>,
    fiber: FiberId,
    armed: bool,
}

impl Future for Suspend {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut PollContext<'_>) -> Poll<()> {
        let this = self.as_mut().get_mut();
        if this.armed {
            return Poll::Ready(());
        }
        this.armed = true;
        this.shared.core.lock().fiber_suspend(this.fiber);
        Poll::Pending
    }
}

#[must_use = "futures do nothing unless awaited"]
pub struct Background {
    shared: Arc<Shared>,
    fiber: FiberId,
    armed: bool,
}

impl Future for Background {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut PollContext<'_>) -> Poll<()> {
        let this = self.as_mut().get_mut();
        if this.armed {
            // Second poll happens on the worker thread.
            return Poll::Ready(());
        }
        this.armed = true;
        this.shared.core.lock().fiber_to_background(this.fiber);
        Poll::Pending
    }
}

#[must_use = "futures do nothing unless awaited"]
pub struct Foreground {
    armed: bool,
}

impl Future for Foreground {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut PollContext<'_>) -> Poll<()> {
        let this = self.as_mut().get_mut();
        if this.armed {
            // Back on the scheduler thread.
            return Poll::Ready(());
        }
        // Yield to the worker's entry; it posts the fiber back to the
        // scheduler as a message.
        this.armed = true;
        Poll::Pending
    }
}

#[must_use = "futures do nothing unless awaited"]
pub struct WaitForHandle {
    shared: Arc<Shared>,
    fiber: FiberId,
    handle: Handle,
    signal: Signal,
    timeout: Steps,
    armed: bool,
}

impl Future for WaitForHandle {
    type Output = Wakeup;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut PollContext<'_>) -> Poll<Wakeup> {
        let this = self.as_mut().get_mut();
        let mut core = this.shared.core.lock();
        if this.armed {
            return Poll::Ready(core.fiber(this.fiber).wakeup);
        }
        this.armed = true;
        match core.put_on_waitlist(this.fiber, this.handle, this.signal, this.timeout) {
            crate::scheduler::WaitOutcome::Immediate(code) => Poll::Ready(code),
            crate::scheduler::WaitOutcome::Waiting => Poll::Pending,
        }
    }
}
