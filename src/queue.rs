//! Fiber event queue
//!
//! Each task keeps its scheduled fibers ordered by ascending logical
//! location, FIFO on ties (by creation-ordered ticket). A task rarely has
//! more than a handful of fibers in flight, so the queue is an ordered
//! vector: insertion walks to the first later entry, which is exactly the
//! order the scheduler dispatches in, and removal scans by id. No entry is
//! ever stale.

use crate::scheduler::FiberId;

#[derive(Clone, Copy, Debug)]
struct Entry {
    fiber: FiberId,
    loc: f64,
    ticket: u64,
}

/// Queue of fibers ordered by `(logical location, ticket)`.
#[derive(Default)]
pub(crate) struct EventQueue {
    entries: Vec<Entry>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Insert a fiber at its ordered position. Re-inserting an already
    /// queued fiber moves it.
    pub fn push(&mut self, fiber: FiberId, loc: f64, ticket: u64) {
        self.remove(fiber);
        // Skip every entry that is earlier, or equal in location with an
        // older ticket; tickets grow monotonically, so ties land FIFO.
        let at = self
            .entries
            .partition_point(|e| e.loc < loc || (e.loc == loc && e.ticket < ticket));
        self.entries.insert(at, Entry { fiber, loc, ticket });
    }

    /// Remove a fiber. Returns whether it was queued.
    pub fn remove(&mut self, fiber: FiberId) -> bool {
        match self.entries.iter().position(|e| e.fiber == fiber) {
            Some(at) => {
                self.entries.remove(at);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, fiber: FiberId) -> bool {
        self.entries.iter().any(|e| e.fiber == fiber)
    }

    /// The soonest fiber, without removing it.
    pub fn peek(&self) -> Option<(FiberId, f64, u64)> {
        self.entries.first().map(|e| (e.fiber, e.loc, e.ticket))
    }

    pub fn pop(&mut self) -> Option<(FiberId, f64, u64)> {
        if self.entries.is_empty() {
            return None;
        }
        let e = self.entries.remove(0);
        Some((e.fiber, e.loc, e.ticket))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
