//! Generation-tagged handle table
//!
//! Tasks and fibers are referenced from the outside through packed handles:
//! `(slot index << 32) | generation`. Slots are recycled through a free
//! list; each recycle bumps the generation, so stale handles resolve to
//! nothing instead of aliasing the slot's new occupant.

use crate::scheduler::{FiberId, TaskId};
use tracing::error;

/// Default capacity of the handle table.
pub const HANDLE_SLOTS: usize = 1024;

/// An untyped object handle, valid for either a task or a fiber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Handle {
    raw: u64,
}

impl Handle {
    fn pack(index: u32, generation: u32) -> Self {
        Self { raw: (index as u64) << 32 | generation as u64 }
    }

    fn index(self) -> u32 {
        (self.raw >> 32) as u32
    }

    fn generation(self) -> u32 {
        (self.raw & 0xffff_ffff) as u32
    }
}

/// Handle to a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskHandle(pub(crate) Handle);

/// Handle to a fiber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FiberHandle(pub(crate) Handle);

impl From<TaskHandle> for Handle {
    fn from(h: TaskHandle) -> Self {
        h.0
    }
}

impl From<FiberHandle> for Handle {
    fn from(h: FiberHandle) -> Self {
        h.0
    }
}

/// What a handle resolved to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Resolved {
    Invalid,
    Task(TaskId),
    Fiber(FiberId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotKind {
    Free,
    Task(TaskId),
    Fiber(FiberId),
}

struct Slot {
    generation: u32,
    kind: SlotKind,
}

pub(crate) struct HandleTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    capacity: usize,
}

impl HandleTable {
    pub fn new(capacity: usize) -> Self {
        Self { slots: Vec::new(), free: Vec::new(), capacity }
    }

    fn alloc_slot(&mut self) -> Option<u32> {
        if let Some(index) = self.free.pop() {
            debug_assert_eq!(self.slots[index as usize].kind, SlotKind::Free);
            return Some(index);
        }
        if self.slots.len() >= self.capacity {
            error!(capacity = self.capacity, "too many in-flight handles");
            return None;
        }
        self.slots.push(Slot { generation: 1, kind: SlotKind::Free });
        Some((self.slots.len() - 1) as u32)
    }

    pub fn alloc_task(&mut self, task: TaskId) -> Option<TaskHandle> {
        let index = self.alloc_slot()?;
        let slot = &mut self.slots[index as usize];
        slot.kind = SlotKind::Task(task);
        Some(TaskHandle(Handle::pack(index, slot.generation)))
    }

    pub fn alloc_fiber(&mut self, fiber: FiberId) -> Option<FiberHandle> {
        let index = self.alloc_slot()?;
        let slot = &mut self.slots[index as usize];
        slot.kind = SlotKind::Fiber(fiber);
        Some(FiberHandle(Handle::pack(index, slot.generation)))
    }

    /// Resolve a packed handle, checking bounds and generation.
    pub fn resolve(&self, handle: Handle) -> Resolved {
        let Some(slot) = self.slots.get(handle.index() as usize) else {
            return Resolved::Invalid;
        };
        if slot.generation != handle.generation() {
            return Resolved::Invalid;
        }
        match slot.kind {
            SlotKind::Free => Resolved::Invalid,
            SlotKind::Task(id) => Resolved::Task(id),
            SlotKind::Fiber(id) => Resolved::Fiber(id),
        }
    }

    pub fn get_task(&self, handle: TaskHandle) -> Option<TaskId> {
        match self.resolve(handle.0) {
            Resolved::Task(id) => Some(id),
            _ => None,
        }
    }

    pub fn get_fiber(&self, handle: FiberHandle) -> Option<FiberId> {
        match self.resolve(handle.0) {
            Resolved::Fiber(id) => Some(id),
            _ => None,
        }
    }

    /// Recycle the slot behind a handle. Subsequent lookups with the old
    /// handle fail the generation check.
    pub fn recycle(&mut self, handle: Handle) {
        let index = handle.index();
        let Some(slot) = self.slots.get_mut(index as usize) else {
            return;
        };
        if slot.generation != handle.generation() {
            return;
        }
        slot.kind = SlotKind::Free;
        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.free.push(index);
    }
}
