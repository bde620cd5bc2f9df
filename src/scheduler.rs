//! Scheduler core
//!
//! All scheduler state and its transitions: the task and fiber pools, the
//! handle table, running/suspended task lists, the wait/signal machine,
//! cancellation cascades and the pending action queue. The run loop in
//! `engine` and the fiber-side primitives in `context` both drive the core
//! through short critical sections; the core itself never blocks and never
//! polls a fiber.
//!
//! Pools own the records; the hierarchy holds ids. A record is recycled
//! only when it is completed, no open handles refer to it, and it is not
//! currently in the hands of the run loop or a background worker.

use crate::curve::{CurveDescriptor, CurveError, TempoCurve};
use crate::handle::{FiberHandle, Handle, HandleTable, Resolved};
use crate::messages::JobOutcome;
use crate::queue::EventQueue;
use crate::timescale::{Sync, Timescale};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use tracing::debug;

/// Scheduling delays and timeouts, in steps of the local timescale.
pub type Steps = f64;

/// A fiber's coroutine state. `Send` so fibers can migrate to background
/// workers.
pub(crate) type FiberFuture = Pin<Box<dyn Future<Output = i64> + Send + 'static>>;

/// Fiber events closer together than this (in seconds of real time) are
/// considered simultaneous and dispatched FIFO.
pub const FUSION_THRESHOLD: f64 = 100e-9;

/// Inline capacity of an action's data buffer; larger payloads spill to the
/// heap.
pub const ACTION_INLINE_SIZE: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct TaskId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct FiberId(pub u32);

/// Signal bits an object raises as it winds down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signal(u8);

impl Signal {
    pub(crate) const NONE: Signal = Signal(0);
    /// The task has run out of fibers.
    pub const IDLE: Signal = Signal(0x01);
    /// The object is completed.
    pub const COMPLETED: Signal = Signal(0x02);

    pub fn intersects(self, other: Signal) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for Signal {
    type Output = Signal;
    fn bitor(self, rhs: Signal) -> Signal {
        Signal(self.0 | rhs.0)
    }
}

/// Why a suspended fiber resumed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wakeup {
    /// The waited-on handle did not resolve to a live object.
    InvalidHandle,
    /// Reserved for handle-state errors.
    HandleError,
    /// The wait's timeout elapsed, or the fiber was force-resumed.
    Timeout,
    /// The waited-on object raised a signal matching the requested mask.
    Signaled,
    /// The waited-on object was cancelled.
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Status {
    Active,
    Suspended,
    Background,
    Idle,
    Completed,
}

/// Which object's waiters list a fiber is enlisted on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WaitTarget {
    Task(TaskId),
    Fiber(FiberId),
}

pub(crate) struct Task {
    pub parent: Option<TaskId>,
    pub children: Vec<TaskId>,
    pub status: Status,
    pub exit_code: i64,
    pub open_handles: i32,
    pub timescale: Timescale,
    /// Location of the event being dispatched, or `timescale.self_loc`.
    pub logical_loc: f64,
    /// Scheduled fibers, ordered by (logical location, ticket).
    pub fibers: EventQueue,
    pub suspended: Vec<FiberId>,
    /// Fibers waiting on this task's signals.
    pub waiting: Vec<FiberId>,
    pub main_fiber: Option<FiberId>,
}

pub(crate) struct Fiber {
    pub task: TaskId,
    pub status: Status,
    pub exit_code: i64,
    pub open_handles: i32,
    pub logical_loc: f64,
    pub ticket: u64,
    pub waiting_for: Signal,
    pub wakeup: Wakeup,
    /// The waiters list this fiber is currently on, if any.
    pub waiting_on: Option<WaitTarget>,
    /// Fibers waiting on this fiber's completion.
    pub waiting: Vec<FiberId>,
    /// The coroutine state; `None` while the run loop or a worker polls it.
    pub future: Option<FiberFuture>,
    /// Held by the run loop between begin/end of a dispatch.
    pub in_dispatch: bool,
    /// Queued for, or executing on, a background worker.
    pub in_background: bool,
}

/// A callback scheduled at a wall-clock instant.
pub(crate) struct Action {
    /// Delay relative to the preceding action (the head is absolute).
    pub delay: f64,
    pub payload: ActionPayload,
}

pub(crate) enum ActionPayload {
    /// Callback over a copied byte buffer, inline up to
    /// [`ACTION_INLINE_SIZE`].
    Bytes { callback: fn(&[u8]), data: SmallVec<[u8; ACTION_INLINE_SIZE]> },
    /// Boxed thunk; the closure owns its data.
    Thunk(Box<dyn FnOnce() + Send + 'static>),
}

impl Action {
    pub fn run(self) {
        match self.payload {
            ActionPayload::Bytes { callback, data } => callback(&data),
            ActionPayload::Thunk(f) => f(),
        }
    }
}

/// What `put_on_waitlist` decided.
pub(crate) enum WaitOutcome {
    /// The fiber is parked; it resumes with a wakeup code.
    Waiting,
    /// No parking needed; the code is known now.
    Immediate(Wakeup),
}

pub(crate) struct SchedCore {
    tasks: Vec<Option<Task>>,
    free_tasks: Vec<TaskId>,
    fibers: Vec<Option<Fiber>>,
    free_fibers: Vec<FiberId>,
    pub handles: HandleTable,

    pub running_tasks: Vec<TaskId>,
    pub suspended_tasks: Vec<TaskId>,
    pub actions: VecDeque<Action>,

    next_ticket: u64,
    /// Logical future already consumed: how far task positions run ahead of
    /// real time.
    pub look_ahead: f64,
    /// How far ahead of real time fibers may fire to reduce jitter.
    pub look_ahead_window: f64,
}

impl SchedCore {
    pub fn new(handle_slots: usize, look_ahead_window: f64) -> Self {
        Self {
            tasks: Vec::new(),
            free_tasks: Vec::new(),
            fibers: Vec::new(),
            free_fibers: Vec::new(),
            handles: HandleTable::new(handle_slots),
            running_tasks: Vec::new(),
            suspended_tasks: Vec::new(),
            actions: VecDeque::new(),
            next_ticket: 0,
            look_ahead: 0.0,
            look_ahead_window,
        }
    }

    //----------------------------------------------------------------------
    // Pools
    //----------------------------------------------------------------------

    pub fn task(&self, id: TaskId) -> &Task {
        self.tasks[id.0 as usize].as_ref().expect("live task record")
    }

    pub fn task_mut(&mut self, id: TaskId) -> &mut Task {
        self.tasks[id.0 as usize].as_mut().expect("live task record")
    }

    pub fn fiber(&self, id: FiberId) -> &Fiber {
        self.fibers[id.0 as usize].as_ref().expect("live fiber record")
    }

    pub fn fiber_mut(&mut self, id: FiberId) -> &mut Fiber {
        self.fibers[id.0 as usize].as_mut().expect("live fiber record")
    }

    pub fn task_status(&self, id: TaskId) -> Status {
        self.task(id).status
    }

    /// Whether the record behind `id` is still allocated. Cancellation
    /// cascades may recycle tasks out from under a caller iterating a
    /// snapshot of the task lists.
    pub fn task_exists(&self, id: TaskId) -> bool {
        self.tasks.get(id.0 as usize).is_some_and(|slot| slot.is_some())
    }

    pub fn fiber_status(&self, id: FiberId) -> Status {
        self.fiber(id).status
    }

    /// Allocate a task record and link it into the hierarchy and the running
    /// list. Root tasks (no parent) are clock-sourced.
    pub fn spawn_task(&mut self, parent: Option<TaskId>) -> TaskId {
        let task = Task {
            parent,
            children: Vec::new(),
            status: Status::Active,
            exit_code: 0,
            open_handles: 0,
            timescale: Timescale::identity(),
            logical_loc: 0.0,
            fibers: EventQueue::new(),
            suspended: Vec::new(),
            waiting: Vec::new(),
            main_fiber: None,
        };
        let id = match self.free_tasks.pop() {
            Some(id) => {
                self.tasks[id.0 as usize] = Some(task);
                id
            }
            None => {
                self.tasks.push(Some(task));
                TaskId((self.tasks.len() - 1) as u32)
            }
        };
        if let Some(parent) = parent {
            self.task_mut(parent).children.push(id);
        }
        self.running_tasks.push(id);
        id
    }

    /// Allocate a fiber record without a coroutine yet; the caller builds
    /// the future (which needs the fiber's id) and attaches it.
    pub fn alloc_fiber_record(&mut self, task: TaskId) -> FiberId {
        let fiber = Fiber {
            task,
            status: Status::Active,
            exit_code: 0,
            open_handles: 0,
            logical_loc: 0.0,
            ticket: 0,
            waiting_for: Signal::NONE,
            wakeup: Wakeup::Timeout,
            waiting_on: None,
            waiting: Vec::new(),
            future: None,
            in_dispatch: false,
            in_background: false,
        };
        match self.free_fibers.pop() {
            Some(id) => {
                self.fibers[id.0 as usize] = Some(fiber);
                id
            }
            None => {
                self.fibers.push(Some(fiber));
                FiberId((self.fibers.len() - 1) as u32)
            }
        }
    }

    pub fn attach_future(&mut self, fiber: FiberId, future: FiberFuture) {
        self.fiber_mut(fiber).future = Some(future);
    }

    /// Roll back a task spawn whose handle allocation failed.
    pub fn abort_spawn_task(&mut self, task_id: TaskId) {
        self.running_tasks.retain(|t| *t != task_id);
        if let Some(parent) = self.task(task_id).parent {
            self.task_mut(parent).children.retain(|c| *c != task_id);
        }
        self.tasks[task_id.0 as usize] = None;
        self.free_tasks.push(task_id);
    }

    /// Roll back a fiber spawn whose handle allocation failed.
    pub fn abort_spawn_fiber(&mut self, fiber_id: FiberId) {
        self.fibers[fiber_id.0 as usize] = None;
        self.free_fibers.push(fiber_id);
    }

    fn task_check_recycle(&mut self, id: TaskId) {
        let task = self.task(id);
        if task.status == Status::Completed && task.open_handles <= 0 {
            debug!(task = id.0, "recycle task");
            self.tasks[id.0 as usize] = None;
            self.free_tasks.push(id);
        }
    }

    fn fiber_check_recycle(&mut self, id: FiberId) {
        let fiber = self.fiber(id);
        if fiber.status == Status::Completed
            && fiber.open_handles <= 0
            && !fiber.in_dispatch
            && !fiber.in_background
        {
            debug_assert!(fiber.waiting.is_empty());
            debug!(fiber = id.0, "recycle fiber");
            self.fibers[id.0 as usize] = None;
            self.free_fibers.push(id);
        }
    }

    //----------------------------------------------------------------------
    // Scheduling
    //----------------------------------------------------------------------

    /// Queue a fiber `steps` after its task's logical location.
    pub fn reschedule_in_steps(&mut self, fiber_id: FiberId, steps: Steps) {
        if self.fiber(fiber_id).status == Status::Completed {
            // Cancelled out from under its own feet; nothing to schedule.
            return;
        }
        let task_id = self.fiber(fiber_id).task;
        let loc = self.task(task_id).logical_loc + steps;
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        {
            let fiber = self.fiber_mut(fiber_id);
            fiber.logical_loc = loc;
            fiber.ticket = ticket;
        }
        let task = self.task_mut(task_id);
        task.fibers.push(fiber_id, loc, ticket);
        task.status = Status::Active;
    }

    /// Remove a fiber from its task's scheduled queue and suspended list.
    fn unlink_from_scheduling(&mut self, fiber_id: FiberId) {
        let task_id = self.fiber(fiber_id).task;
        let task = self.task_mut(task_id);
        task.fibers.remove(fiber_id);
        task.suspended.retain(|f| *f != fiber_id);
    }

    /// Remove a fiber from whichever waiters list it is on.
    fn unlink_from_waiters(&mut self, fiber_id: FiberId) {
        let target = self.fiber_mut(fiber_id).waiting_on.take();
        if let Some(target) = target {
            let list = match target {
                WaitTarget::Task(t) => &mut self.task_mut(t).waiting,
                WaitTarget::Fiber(f) => &mut self.fiber_mut(f).waiting,
            };
            list.retain(|f| *f != fiber_id);
        }
    }

    //----------------------------------------------------------------------
    // Wait / signal machine
    //----------------------------------------------------------------------

    fn take_waiters(&mut self, target: WaitTarget) -> Vec<FiberId> {
        match target {
            WaitTarget::Task(t) => std::mem::take(&mut self.task_mut(t).waiting),
            WaitTarget::Fiber(f) => std::mem::take(&mut self.fiber_mut(f).waiting),
        }
    }

    fn wake_waiter(&mut self, fiber_id: FiberId, code: Wakeup) {
        {
            let fiber = self.fiber_mut(fiber_id);
            fiber.status = Status::Active;
            fiber.wakeup = code;
            fiber.waiting_on = None;
        }
        self.unlink_from_scheduling(fiber_id);
        self.reschedule_in_steps(fiber_id, 0.0);
    }

    /// Wake the waiters whose requested mask intersects `signal`.
    fn signal_waiters(&mut self, target: WaitTarget, signal: Signal) {
        let waiters = self.take_waiters(target);
        let mut kept = Vec::new();
        for fiber_id in waiters {
            if self.fiber(fiber_id).waiting_for.intersects(signal) {
                self.wake_waiter(fiber_id, Wakeup::Signaled);
            } else {
                kept.push(fiber_id);
            }
        }
        if !kept.is_empty() {
            match target {
                WaitTarget::Task(t) => self.task_mut(t).waiting = kept,
                WaitTarget::Fiber(f) => self.fiber_mut(f).waiting = kept,
            }
        }
    }

    /// Wake every waiter with `Cancelled`, regardless of mask.
    fn cancel_waiters(&mut self, target: WaitTarget) {
        for fiber_id in self.take_waiters(target) {
            self.wake_waiter(fiber_id, Wakeup::Cancelled);
        }
    }

    /// Park `fiber_id` until `handle` raises a signal in `signal`, with the
    /// timeout convention: 0 fails immediately, negative waits forever,
    /// positive schedules a wake after that many local steps.
    pub fn put_on_waitlist(
        &mut self,
        fiber_id: FiberId,
        handle: Handle,
        signal: Signal,
        timeout: Steps,
    ) -> WaitOutcome {
        let (status, target) = match self.handles.resolve(handle) {
            Resolved::Invalid => return WaitOutcome::Immediate(Wakeup::InvalidHandle),
            Resolved::Task(t) => (self.task(t).status, WaitTarget::Task(t)),
            Resolved::Fiber(f) => (self.fiber(f).status, WaitTarget::Fiber(f)),
        };

        // Completed satisfies any mask; idle only an IDLE request.
        let satisfied = match status {
            Status::Completed => true,
            Status::Idle => signal.intersects(Signal::IDLE),
            _ => false,
        };
        if satisfied {
            return WaitOutcome::Immediate(Wakeup::Signaled);
        }
        if timeout == 0.0 {
            return WaitOutcome::Immediate(Wakeup::Timeout);
        }

        self.unlink_from_waiters(fiber_id);
        self.unlink_from_scheduling(fiber_id);
        if timeout < 0.0 {
            let task_id = self.fiber(fiber_id).task;
            self.fiber_mut(fiber_id).logical_loc = 0.0;
            self.task_mut(task_id).suspended.push(fiber_id);
        } else {
            self.reschedule_in_steps(fiber_id, timeout);
        }
        {
            let fiber = self.fiber_mut(fiber_id);
            fiber.status = Status::Suspended;
            fiber.waiting_for = signal;
            fiber.waiting_on = Some(target);
        }
        match target {
            WaitTarget::Task(t) => self.task_mut(t).waiting.push(fiber_id),
            WaitTarget::Fiber(f) => self.fiber_mut(f).waiting.push(fiber_id),
        }
        WaitOutcome::Waiting
    }

    //----------------------------------------------------------------------
    // Completion / retirement
    //----------------------------------------------------------------------

    /// Complete a fiber whose `exit_code` is already set. Signals waiters
    /// and retires the task when this was its last fiber.
    pub fn fiber_complete(&mut self, fiber_id: FiberId) {
        {
            let fiber = self.fiber_mut(fiber_id);
            fiber.status = Status::Completed;
            fiber.future = None;
        }
        self.signal_waiters(WaitTarget::Fiber(fiber_id), Signal::COMPLETED);

        let task_id = self.fiber(fiber_id).task;
        let no_fibers_left = {
            let task = self.task(task_id);
            task.fibers.is_empty() && task.suspended.is_empty()
        };
        if no_fibers_left {
            let exit = self.fiber(fiber_id).exit_code;
            self.task_mut(task_id).exit_code = exit;
            self.task_retire(task_id);
        }
        self.fiber_check_recycle(fiber_id);
    }

    /// A task with no fibers left goes idle; if all children are already
    /// completed it completes outright.
    fn task_retire(&mut self, task_id: TaskId) {
        self.task_mut(task_id).status = Status::Idle;
        self.signal_waiters(WaitTarget::Task(task_id), Signal::IDLE);
        if self.children_all_completed(task_id) {
            self.task_complete(task_id);
        }
    }

    fn task_complete(&mut self, task_id: TaskId) {
        self.task_mut(task_id).status = Status::Completed;
        self.running_tasks.retain(|t| *t != task_id);
        self.suspended_tasks.retain(|t| *t != task_id);
        self.signal_waiters(WaitTarget::Task(task_id), Signal::COMPLETED);

        if let Some(parent) = self.task(task_id).parent {
            self.task_mut(parent).children.retain(|c| *c != task_id);
            self.notify_parent_of_completion(parent);
        }

        // The curve is released now; open handles may keep the bare record
        // around for longer.
        self.task_mut(task_id).timescale = Timescale::identity();
        self.task_check_recycle(task_id);
    }

    fn notify_parent_of_completion(&mut self, parent: TaskId) {
        if self.task(parent).status == Status::Idle && self.children_all_completed(parent) {
            self.task_complete(parent);
        }
    }

    fn children_all_completed(&self, task_id: TaskId) -> bool {
        self.task(task_id)
            .children
            .iter()
            .all(|c| self.task(*c).status == Status::Completed)
    }

    //----------------------------------------------------------------------
    // Suspend / resume / cancel
    //----------------------------------------------------------------------

    pub fn fiber_suspend(&mut self, fiber_id: FiberId) {
        self.unlink_from_scheduling(fiber_id);
        let task_id = self.fiber(fiber_id).task;
        {
            let fiber = self.fiber_mut(fiber_id);
            fiber.status = Status::Suspended;
            fiber.logical_loc = 0.0;
        }
        self.task_mut(task_id).suspended.push(fiber_id);
    }

    pub fn fiber_resume(&mut self, fiber_id: FiberId) {
        if self.fiber(fiber_id).status == Status::Completed {
            return;
        }
        self.unlink_from_waiters(fiber_id);
        self.unlink_from_scheduling(fiber_id);
        {
            let fiber = self.fiber_mut(fiber_id);
            fiber.status = Status::Active;
            // A forced resume is not a signal; report it like a timeout.
            fiber.wakeup = Wakeup::Timeout;
        }
        self.reschedule_in_steps(fiber_id, 0.0);
    }

    pub fn fiber_cancel(&mut self, fiber_id: FiberId) {
        if self.fiber(fiber_id).status == Status::Completed {
            return;
        }
        self.unlink_from_waiters(fiber_id);
        self.unlink_from_scheduling(fiber_id);
        self.cancel_waiters(WaitTarget::Fiber(fiber_id));
        self.fiber_complete(fiber_id);
    }

    /// Mark the current fiber as bound for the worker pool. The run loop
    /// notices the status after the yield and moves the future over.
    pub fn fiber_to_background(&mut self, fiber_id: FiberId) {
        let task_id = self.fiber(fiber_id).task;
        {
            let fiber = self.fiber_mut(fiber_id);
            fiber.logical_loc = 0.0;
            fiber.status = Status::Background;
        }
        self.task_mut(task_id).suspended.push(fiber_id);
    }

    pub fn task_suspend(&mut self, task_id: TaskId) {
        if self.task(task_id).status == Status::Completed {
            return;
        }
        self.running_tasks.retain(|t| *t != task_id);
        self.suspended_tasks.retain(|t| *t != task_id);
        self.task_mut(task_id).status = Status::Suspended;
        self.suspended_tasks.push(task_id);
    }

    pub fn task_resume(&mut self, task_id: TaskId) {
        if self.task(task_id).status != Status::Suspended {
            return;
        }
        self.suspended_tasks.retain(|t| *t != task_id);
        self.task_mut(task_id).status = Status::Active;
        self.running_tasks.push(task_id);
    }

    /// Cancel a task: children first, then every fiber, scheduled or
    /// suspended. The last fiber's completion retires and completes the
    /// task itself.
    pub fn task_cancel(&mut self, task_id: TaskId) {
        let children = self.task(task_id).children.clone();
        for child in children {
            self.task_cancel(child);
        }

        self.cancel_waiters(WaitTarget::Task(task_id));

        let mut fibers: Vec<FiberId> = Vec::new();
        while let Some((fiber, _, _)) = self.task_mut(task_id).fibers.pop() {
            fibers.push(fiber);
        }
        let suspended: Vec<FiberId> = self.task_mut(task_id).suspended.drain(..).collect();
        fibers.extend(suspended);
        for fiber in fibers {
            self.fiber_cancel(fiber);
        }
    }

    //----------------------------------------------------------------------
    // Timescale hierarchy
    //----------------------------------------------------------------------

    /// Translate a delay in `task_id`'s local steps into clock units,
    /// climbing source-ward through the hierarchy.
    pub fn local_to_global_delay(&self, task_id: TaskId, steps: Steps) -> f64 {
        let mut steps = steps;
        let mut current = task_id;
        loop {
            let task = self.task(current);
            steps = task.timescale.local_to_source(steps);
            match task.parent {
                None => return steps,
                Some(parent) => current = parent,
            }
        }
    }

    /// Advance every clock-rooted running task by `elapsed` clock units;
    /// each task updates its non-suspended children with the delta already
    /// converted into its own units.
    pub fn update_task_positions(&mut self, elapsed: f64) {
        let roots: Vec<TaskId> = self
            .running_tasks
            .iter()
            .copied()
            .filter(|t| self.task(*t).parent.is_none())
            .collect();
        for root in roots {
            self.update_task_position(root, elapsed);
        }
    }

    fn update_task_position(&mut self, task_id: TaskId, elapsed: f64) {
        let update = {
            let task = self.task_mut(task_id);
            let update = task.timescale.update_position(elapsed);
            task.logical_loc = task.timescale.self_loc;
            update
        };
        let children = self.task(task_id).children.clone();
        for child in children {
            if self.task(child).status != Status::Suspended {
                self.update_task_position(child, update);
            }
        }
    }

    /// Scan the head of every running task's fiber queue and pick the
    /// soonest event in clock units. Events within the fusion threshold of
    /// the current best are ordered by ticket instead.
    pub fn next_fiber_event(&self) -> Option<(FiberId, f64)> {
        let mut best: Option<(FiberId, f64, u64)> = None;

        for &task_id in &self.running_tasks {
            let Some((fiber, loc, ticket)) = self.task(task_id).fibers.peek() else {
                continue;
            };
            let local_delay = loc - self.task(task_id).timescale.self_loc;
            let delay = self.local_to_global_delay(task_id, local_delay);

            match best {
                None => best = Some((fiber, delay, ticket)),
                Some((_, best_delay, best_ticket)) => {
                    if delay < best_delay {
                        best = Some((fiber, delay, ticket));
                    } else if (delay - best_delay) < FUSION_THRESHOLD && ticket < best_ticket {
                        // Fused events keep the earlier delay but prefer the
                        // older ticket.
                        best = Some((fiber, best_delay, ticket));
                    }
                }
            }
        }
        best.map(|(fiber, delay, _)| (fiber, delay))
    }

    //----------------------------------------------------------------------
    // Dispatch hand-off
    //----------------------------------------------------------------------

    /// Pull a picked fiber out of its queue and hand its future to the run
    /// loop. Snaps the task's logical location to the fiber's, and resolves
    /// a timed-out wait if the fiber was parked.
    pub fn begin_fiber_dispatch(&mut self, fiber_id: FiberId) -> Option<FiberFuture> {
        let task_id = self.fiber(fiber_id).task;
        self.task_mut(task_id).fibers.remove(fiber_id);

        if self.fiber(fiber_id).status == Status::Suspended {
            {
                let fiber = self.fiber_mut(fiber_id);
                fiber.status = Status::Active;
                fiber.wakeup = Wakeup::Timeout;
            }
            self.unlink_from_waiters(fiber_id);
        }

        let loc = self.fiber(fiber_id).logical_loc;
        self.task_mut(task_id).logical_loc = loc;

        let fiber = self.fiber_mut(fiber_id);
        fiber.in_dispatch = true;
        fiber.future.take()
    }

    /// Release the dispatch pin; recycles the record if the fiber finished
    /// and nothing else refers to it.
    pub fn end_fiber_dispatch(&mut self, fiber_id: FiberId) {
        self.fiber_mut(fiber_id).in_dispatch = false;
        self.fiber_check_recycle(fiber_id);
    }

    //----------------------------------------------------------------------
    // Message handlers
    //----------------------------------------------------------------------

    /// A background fiber came back from a worker.
    pub fn do_foreground(&mut self, fiber_id: FiberId, outcome: JobOutcome) {
        self.fiber_mut(fiber_id).in_background = false;
        match outcome {
            JobOutcome::Yielded(future) => {
                if self.fiber(fiber_id).status == Status::Completed {
                    // Cancelled while on the worker; the coroutine never
                    // resumes.
                    drop(future);
                    self.fiber_check_recycle(fiber_id);
                    return;
                }
                self.unlink_from_scheduling(fiber_id);
                {
                    let fiber = self.fiber_mut(fiber_id);
                    fiber.status = Status::Active;
                    fiber.future = Some(future);
                }
                self.reschedule_in_steps(fiber_id, 0.0);
            }
            JobOutcome::Finished(code) => {
                if self.fiber(fiber_id).status == Status::Completed {
                    self.fiber_check_recycle(fiber_id);
                    return;
                }
                self.unlink_from_scheduling(fiber_id);
                self.fiber_mut(fiber_id).exit_code = code;
                self.fiber_complete(fiber_id);
            }
        }
    }

    pub fn do_wakeup(&mut self, handle: FiberHandle) {
        if let Some(fiber_id) = self.handles.get_fiber(handle) {
            if self.fiber(fiber_id).status == Status::Suspended {
                self.fiber_resume(fiber_id);
            }
        }
    }

    //----------------------------------------------------------------------
    // Handles
    //----------------------------------------------------------------------

    pub fn handle_release(&mut self, handle: Handle) {
        match self.handles.resolve(handle) {
            Resolved::Invalid => {}
            Resolved::Task(task_id) => {
                self.handles.recycle(handle);
                self.task_mut(task_id).open_handles -= 1;
                self.task_check_recycle(task_id);
            }
            Resolved::Fiber(fiber_id) => {
                self.handles.recycle(handle);
                self.fiber_mut(fiber_id).open_handles -= 1;
                self.fiber_check_recycle(fiber_id);
            }
        }
    }

    pub fn handle_exit_code(&self, handle: Handle) -> Option<i64> {
        match self.handles.resolve(handle) {
            Resolved::Invalid => None,
            Resolved::Task(task_id) => Some(self.task(task_id).exit_code),
            Resolved::Fiber(fiber_id) => Some(self.fiber(fiber_id).exit_code),
        }
    }

    //----------------------------------------------------------------------
    // Timescale configuration
    //----------------------------------------------------------------------

    pub fn set_scaling(&mut self, task_id: TaskId, scaling: f64) {
        self.task_mut(task_id).timescale.sync = Sync::Scaling(scaling);
    }

    /// Replace the task's timescale with a tempo curve. On a build error
    /// the previous timescale is left untouched.
    pub fn set_tempo_curve(
        &mut self,
        task_id: TaskId,
        descriptor: &CurveDescriptor,
    ) -> Result<(), CurveError> {
        let curve = TempoCurve::new(descriptor)?;
        self.task_mut(task_id).timescale.sync = Sync::Curve(curve);
        Ok(())
    }

    //----------------------------------------------------------------------
    // Actions
    //----------------------------------------------------------------------

    /// Insert an action due at the current logical front. Delays are stored
    /// as deltas from the preceding action; the insertion point is where the
    /// cumulative delay first exceeds the look-ahead.
    pub fn schedule_action(&mut self, payload: ActionPayload) {
        let delay_from_now = self.look_ahead;
        let mut cumulated = 0.0;

        for i in 0..self.actions.len() {
            let next_cumulated = cumulated + self.actions[i].delay;
            if next_cumulated > delay_from_now {
                self.actions[i].delay = next_cumulated - delay_from_now;
                self.actions
                    .insert(i, Action { delay: delay_from_now - cumulated, payload });
                return;
            }
            cumulated = next_cumulated;
        }
        self.actions
            .push_back(Action { delay: delay_from_now - cumulated, payload });
    }
}
