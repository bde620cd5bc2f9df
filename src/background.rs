//! Background worker pool
//!
//! Fibers that need to block migrate off the scheduler thread: the run loop
//! hands their coroutine to this pool, a worker polls it (running the
//! blocking section on the worker's own thread), and whatever the fiber
//! does next, yield through the foreground primitive or return, comes
//! back to the scheduler as a message.

use crate::engine::{noop_waker, Shared};
use crate::messages::{JobOutcome, Message};
use crate::scheduler::{FiberFuture, FiberId};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use tracing::debug;

/// Default worker pool size.
pub const BACKGROUND_THREADS: usize = 8;

/// A fiber parked on the job queue, coroutine included.
pub(crate) struct Job {
    pub fiber: FiberId,
    pub future: FiberFuture,
}

struct QueueState {
    jobs: VecDeque<Job>,
    running: bool,
}

pub(crate) struct JobQueue {
    state: Mutex<QueueState>,
    condition: Condvar,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState { jobs: VecDeque::new(), running: true }),
            condition: Condvar::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn start(shared: &Arc<Shared>, count: usize) {
        let mut workers = shared.jobs.workers.lock();
        for i in 0..count {
            let shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("sched-worker-{i}"))
                .spawn(move || worker_main(shared))
                .expect("spawn background worker");
            workers.push(handle);
        }
    }

    pub fn push(&self, job: Job) {
        let mut state = self.state.lock();
        state.jobs.push_back(job);
        self.condition.notify_one();
    }

    /// Stop accepting work and join the workers. A worker stuck inside a
    /// blocking fiber is joined once that fiber yields or returns.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            state.running = false;
            self.condition.notify_all();
        }
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
    }
}

fn worker_main(shared: Arc<Shared>) {
    debug!("starting worker thread");
    loop {
        let job = {
            let mut state = shared.jobs.state.lock();
            loop {
                if !state.running {
                    return;
                }
                if let Some(job) = state.jobs.pop_front() {
                    break job;
                }
                shared.jobs.condition.wait(&mut state);
            }
        };

        debug!(fiber = job.fiber.0, "picked a background job");

        // The blocking section runs here. Any yield (normally the
        // foreground primitive) hands the fiber back to the scheduler;
        // returning completes it in place.
        let mut future = job.future;
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let outcome = match future.as_mut().poll(&mut cx) {
            Poll::Pending => JobOutcome::Yielded(future),
            Poll::Ready(code) => JobOutcome::Finished(code),
        };
        shared.messages.commit(Message::Foreground { fiber: job.fiber, outcome });
    }
}
