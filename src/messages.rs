//! Cross-thread messages
//!
//! The only way other threads talk to the scheduler: a lock-free message
//! list plus a `has_messages` flag, with a conventional mutex + condition
//! used solely for the scheduler's sleep. Producers push, raise the flag
//! under the sleep mutex and signal; the scheduler drains everything before
//! processing.

use crate::engine::Clock;
use crate::handle::FiberHandle;
use crate::scheduler::{FiberFuture, FiberId};
use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Below this remaining timeout the timed wait returns; the look-ahead
/// window absorbs the residual imprecision.
const TIMED_WAIT_FLOOR: f64 = 100e-6;

/// Decay ratio of the timed-wait loop. Waiting repeatedly on geometrically
/// decreasing timeouts gives sub-millisecond precision in a handful of
/// iterations and tolerates spurious wakeups.
const TIMED_WAIT_DECAY: f64 = 0.8;

/// What a background worker reports back for a fiber it polled.
pub(crate) enum JobOutcome {
    /// The fiber yielded on the worker (normally through `foreground`);
    /// its future comes back to the scheduler thread.
    Yielded(FiberFuture),
    /// The fiber ran to completion on the worker.
    Finished(i64),
}

pub(crate) enum Message {
    /// A background fiber returning to the scheduler thread.
    Foreground { fiber: FiberId, outcome: JobOutcome },
    /// Force-resume a suspended fiber.
    Wakeup { fiber: FiberHandle },
}

pub(crate) struct MessageQueue {
    list: SegQueue<Message>,
    has_messages: AtomicBool,
    sleep_mutex: Mutex<()>,
    condition: Condvar,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self {
            list: SegQueue::new(),
            has_messages: AtomicBool::new(false),
            sleep_mutex: Mutex::new(()),
            condition: Condvar::new(),
        }
    }

    pub fn has_messages(&self) -> bool {
        self.has_messages.load(Ordering::Acquire)
    }

    /// Producer side: enqueue a message and wake the scheduler.
    pub fn commit(&self, message: Message) {
        self.list.push(message);
        let _guard = self.sleep_mutex.lock();
        self.has_messages.store(true, Ordering::Release);
        self.condition.notify_one();
    }

    /// Consumer side: pop one message. The flag transition to "empty" is
    /// made under the sleep mutex so a concurrent `commit` cannot be lost.
    pub fn next(&self) -> Option<Message> {
        if let Some(message) = self.list.pop() {
            return Some(message);
        }
        let _guard = self.sleep_mutex.lock();
        match self.list.pop() {
            Some(message) => Some(message),
            None => {
                self.has_messages.store(false, Ordering::Release);
                None
            }
        }
    }

    /// Block until a message arrives.
    pub fn wait_for_message(&self) {
        let mut guard = self.sleep_mutex.lock();
        while !self.has_messages.load(Ordering::Acquire) {
            self.condition.wait(&mut guard);
        }
    }

    /// Block until a message arrives or `timeout` seconds pass.
    ///
    /// With a virtual clock there is nothing to sleep on: the clock jumps by
    /// the full timeout unless a message is already pending.
    pub fn wait_for_message_or_timeout(&self, timeout: f64, clock: &Clock) {
        if clock.is_virtual() {
            if !self.has_messages() {
                clock.advance(timeout);
            }
            return;
        }

        let mut guard = self.sleep_mutex.lock();
        let mut remaining = timeout;
        while !self.has_messages.load(Ordering::Acquire) && remaining > TIMED_WAIT_FLOOR {
            let last_start = clock.now();
            let _ = self
                .condition
                .wait_for(&mut guard, Duration::from_secs_f64(remaining * TIMED_WAIT_DECAY));
            remaining -= clock.now() - last_start;
        }
    }
}
