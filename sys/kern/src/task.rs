// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of tasks.
//!
//! The task table is a fixed array of control blocks indexed by task id.
//! Slot 0 is the kernel/idle task: it exists from boot, runs at the least
//! important priority, never sleeps, and is the scheduler's fallback when
//! nothing else is runnable.
//!
//! Scheduling is cooperative. Nothing here preempts anything; state only
//! changes when a task yields, sleeps, exits, or is killed, and the next
//! task is chosen by a priority scan over the READY set.

use abi::{Priority, Section, TaskId, NAME_LEN};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::err::Error;
use crate::time::Timestamp;

/// Number of slots in the task table, idle task included.
pub const MAX_TASKS: usize = 8;

/// Task lifecycle states.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum TaskState {
    /// Slot unoccupied.
    #[default]
    Free,
    /// Loaded and runnable, waiting for the scheduler.
    Ready,
    /// Currently executing. At most one task is in this state.
    Running,
    /// Waiting on an external collaborator (blocking filesystem call).
    Blocked,
    /// Waiting for the clock; see `wake_time`.
    Sleeping,
    /// Terminated, awaiting reclamation.
    Zombie,
}

/// Saved register image, filled at suspension points and used if/when a
/// context switch restores the task on real hardware.
#[derive(
    Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct SavedRegs {
    /// r0-r12.
    pub r: [u32; 13],
    pub sp: u32,
    pub lr: u32,
    pub pc: u32,
}

/// Where a loaded image sits in the user pool. All `*_start` fields and
/// `stack_top` are offsets from `base`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MemLayout {
    pub base: u32,
    pub total_size: u32,
    pub text_start: u32,
    pub text_size: u32,
    pub rodata_start: u32,
    pub rodata_size: u32,
    pub data_start: u32,
    pub data_size: u32,
    pub bss_start: u32,
    pub bss_size: u32,
    pub heap_start: u32,
    pub heap_size: u32,
    pub heap_used: u32,
    pub stack_top: u32,
    pub stack_size: u32,
}

impl MemLayout {
    /// Offset of a section from `base`. `None` and `Bss` both resolve for
    /// relocation purposes; `None` answers 0 so syscall-symbol arithmetic
    /// stays trivial.
    pub fn section_start(&self, section: Section) -> u32 {
        match section {
            Section::None => 0,
            Section::Text => self.text_start,
            Section::Rodata => self.rodata_start,
            Section::Data => self.data_start,
            Section::Bss => self.bss_start,
        }
    }

    /// True when `[addr, addr + len)` lies inside this task's block.
    pub fn contains(&self, addr: u32, len: u32) -> bool {
        let Some(end) = addr.checked_add(len) else {
            return false;
        };
        addr >= self.base && end <= self.base + self.total_size
    }
}

/// One task control block.
#[derive(Clone, Debug)]
pub struct Tcb {
    name: [u8; NAME_LEN],
    state: TaskState,
    priority: Priority,
    /// Bumped every time the slot is reused, so a stale id is detectable.
    generation: u8,
    layout: MemLayout,
    wake_time: Option<Timestamp>,
    entry: u32,
    pub save: SavedRegs,
}

impl Default for Tcb {
    fn default() -> Self {
        Self {
            name: [0; NAME_LEN],
            state: TaskState::Free,
            priority: Priority::IDLE,
            generation: 0,
            layout: MemLayout::default(),
            wake_time: None,
            entry: 0,
            save: SavedRegs::default(),
        }
    }
}

impl Tcb {
    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn generation(&self) -> u8 {
        self.generation
    }

    pub fn name(&self) -> &str {
        abi::unpack_name(&self.name).unwrap_or("")
    }

    pub fn layout(&self) -> &MemLayout {
        &self.layout
    }

    pub fn layout_mut(&mut self) -> &mut MemLayout {
        &mut self.layout
    }

    pub fn entry(&self) -> u32 {
        self.entry
    }

    pub fn set_entry(&mut self, entry: u32) {
        self.entry = entry;
    }

    fn is_schedulable(&self) -> bool {
        matches!(self.state, TaskState::Ready | TaskState::Running)
    }
}

/// Snapshot row returned by [`TaskTable::snapshot_into`]; what a shell `ps`
/// renders.
#[derive(Copy, Clone, Debug)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: [u8; NAME_LEN],
    pub state: TaskState,
    pub priority: Priority,
    pub generation: u8,
    pub base: u32,
    pub total_size: u32,
}

/// The fixed task table plus the identity of the running task.
pub struct TaskTable {
    slots: [Tcb; MAX_TASKS],
    current: usize,
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskTable {
    /// Builds the table with the idle task occupying slot 0, RUNNING.
    pub fn new() -> Self {
        let mut slots: [Tcb; MAX_TASKS] = Default::default();
        slots[0].name = abi::pack_name("idle");
        slots[0].priority = Priority::IDLE;
        slots[0].state = TaskState::Running;
        Self { slots, current: 0 }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn get(&self, index: usize) -> Option<&Tcb> {
        self.slots.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Tcb> {
        self.slots.get_mut(index)
    }

    /// Reserves a FREE slot for a program being loaded. The slot stays
    /// non-schedulable until [`Self::make_ready`]; the caller releases it
    /// with [`Self::release`] if loading fails.
    pub fn allocate(
        &mut self,
        name: &str,
        priority: Priority,
    ) -> Result<usize, Error> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .skip(1)
            .find(|(_, t)| t.state == TaskState::Free)
            .ok_or(Error::NoTaskSlot)?;
        let generation = slot.generation.wrapping_add(1);
        *slot = Tcb {
            name: abi::pack_name(name),
            priority,
            generation,
            ..Tcb::default()
        };
        Ok(index)
    }

    /// FREE → READY, the final step of a successful load.
    pub fn make_ready(&mut self, index: usize) {
        self.slots[index].state = TaskState::Ready;
    }

    /// Returns a slot to FREE without reclamation bookkeeping; used when a
    /// load fails before the task ever became schedulable.
    pub fn release(&mut self, index: usize) {
        self.slots[index].state = TaskState::Free;
        self.slots[index].layout = MemLayout::default();
    }

    /// RUNNING → READY for the current task; the next [`Self::schedule`]
    /// picks again.
    pub fn yield_current(&mut self) {
        if self.slots[self.current].state == TaskState::Running {
            self.slots[self.current].state = TaskState::Ready;
        }
    }

    /// Puts `index` to sleep until `wake`. In kernel context (slot 0) this
    /// is a no-op: the kernel never sleeps.
    pub fn sleep(&mut self, index: usize, wake: Timestamp) {
        if index == 0 {
            return;
        }
        let t = &mut self.slots[index];
        if t.is_schedulable() {
            t.state = TaskState::Sleeping;
            t.wake_time = Some(wake);
        }
    }

    /// Marks a task dead. The caller (the kernel context) is responsible
    /// for pool reclamation before [`Self::bury`].
    pub fn kill(&mut self, index: usize) -> Result<(), Error> {
        if index == 0 || index >= MAX_TASKS {
            return Err(Error::BadArgument);
        }
        if self.slots[index].state == TaskState::Free {
            return Err(Error::BadArgument);
        }
        self.slots[index].state = TaskState::Zombie;
        Ok(())
    }

    /// ZOMBIE → FREE after the pools have been swept.
    pub fn bury(&mut self, index: usize) {
        if self.slots[index].state == TaskState::Zombie {
            self.slots[index].state = TaskState::Free;
            self.slots[index].layout = MemLayout::default();
        }
    }

    /// Moves every sleeper whose wake time has arrived back to READY.
    pub fn wake_sleepers(&mut self, now: Timestamp) {
        for t in self.slots.iter_mut() {
            if t.state == TaskState::Sleeping {
                if let Some(wake) = t.wake_time {
                    if wake <= now {
                        t.wake_time = None;
                        t.state = TaskState::Ready;
                    }
                }
            }
        }
    }

    /// The scheduler's pick-and-assign step: selects the schedulable task
    /// with the most important priority (ties to the smallest id) and makes
    /// it RUNNING, returning its index. The idle task is always
    /// schedulable, so this cannot fail.
    pub fn schedule(&mut self) -> usize {
        // The idle task is schedulable from boot onward, so the scan always
        // lands on something.
        let mut choice = 0;
        let mut best = self.slots[0].priority;
        for (i, t) in self.slots.iter().enumerate().skip(1) {
            if t.is_schedulable() && t.priority.is_more_important_than(best) {
                choice = i;
                best = t.priority;
            }
        }
        if choice != self.current {
            if self.slots[self.current].state == TaskState::Running {
                self.slots[self.current].state = TaskState::Ready;
            }
            self.slots[choice].state = TaskState::Running;
            self.current = choice;
        } else if self.slots[choice].state == TaskState::Ready {
            self.slots[choice].state = TaskState::Running;
        }
        choice
    }

    /// Copies up to `out.len()` table rows into `out`, returning how many
    /// were written. Occupied slots only.
    pub fn snapshot_into(&self, out: &mut [TaskInfo]) -> usize {
        let mut n = 0;
        for (i, t) in self.slots.iter().enumerate() {
            if t.state == TaskState::Free || n == out.len() {
                continue;
            }
            out[n] = TaskInfo {
                id: TaskId(i as u8),
                name: t.name,
                state: t.state,
                priority: t.priority,
                generation: t.generation,
                base: t.layout.base,
                total_size: t.layout.total_size,
            };
            n += 1;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_task(table: &mut TaskTable, name: &str, prio: u8) -> usize {
        let i = table.allocate(name, Priority(prio)).unwrap();
        table.make_ready(i);
        i
    }

    #[test]
    fn idle_task_is_running_at_boot() {
        let t = TaskTable::new();
        assert_eq!(t.current(), 0);
        assert_eq!(t.get(0).unwrap().state(), TaskState::Running);
        assert_eq!(t.get(0).unwrap().priority(), Priority::IDLE);
    }

    #[test]
    fn scheduler_prefers_important_then_small_id() {
        let mut table = TaskTable::new();
        let a = ready_task(&mut table, "a", 10);
        let b = ready_task(&mut table, "b", 5);
        let c = ready_task(&mut table, "c", 5);
        assert!(a > 0 && c > b);

        assert_eq!(table.schedule(), b);
        assert_eq!(table.get(b).unwrap().state(), TaskState::Running);
        assert_eq!(table.get(0).unwrap().state(), TaskState::Ready);

        // Same priorities: the earlier slot wins even while it's current.
        assert_eq!(table.schedule(), b);

        // When b leaves, c (same priority) beats a (less important).
        table.kill(b).unwrap();
        table.bury(b);
        assert_eq!(table.schedule(), c);
    }

    #[test]
    fn idle_is_the_fallback() {
        let mut table = TaskTable::new();
        let a = ready_task(&mut table, "a", 1);
        assert_eq!(table.schedule(), a);
        table.sleep(a, Timestamp::from(100));
        assert_eq!(table.schedule(), 0);
        assert_eq!(table.get(0).unwrap().state(), TaskState::Running);
    }

    #[test]
    fn sleep_and_wake_cycle() {
        let mut table = TaskTable::new();
        let a = ready_task(&mut table, "a", 1);
        assert_eq!(table.schedule(), a);

        table.sleep(a, Timestamp::from(50));
        assert_eq!(table.get(a).unwrap().state(), TaskState::Sleeping);
        assert_eq!(table.schedule(), 0);

        table.wake_sleepers(Timestamp::from(49));
        assert_eq!(table.get(a).unwrap().state(), TaskState::Sleeping);
        table.wake_sleepers(Timestamp::from(50));
        assert_eq!(table.get(a).unwrap().state(), TaskState::Ready);
        assert_eq!(table.schedule(), a);
    }

    #[test]
    fn kernel_never_sleeps() {
        let mut table = TaskTable::new();
        table.sleep(0, Timestamp::from(1_000_000));
        assert_eq!(table.get(0).unwrap().state(), TaskState::Running);
    }

    #[test]
    fn yield_returns_to_ready() {
        let mut table = TaskTable::new();
        let a = ready_task(&mut table, "a", 1);
        assert_eq!(table.schedule(), a);
        table.yield_current();
        assert_eq!(table.get(a).unwrap().state(), TaskState::Ready);
        // Only candidate at its priority: picked right back up.
        assert_eq!(table.schedule(), a);
        assert_eq!(table.get(a).unwrap().state(), TaskState::Running);
    }

    #[test]
    fn slot_reuse_bumps_generation() {
        let mut table = TaskTable::new();
        let a = table.allocate("one", Priority(3)).unwrap();
        let g1 = table.get(a).unwrap().generation();
        table.make_ready(a);
        table.kill(a).unwrap();
        table.bury(a);
        let b = table.allocate("two", Priority(3)).unwrap();
        assert_eq!(a, b);
        assert_ne!(table.get(b).unwrap().generation(), g1);
    }

    #[test]
    fn table_fills_up() {
        let mut table = TaskTable::new();
        for i in 1..MAX_TASKS {
            ready_task(&mut table, "t", i as u8);
        }
        assert_eq!(
            table.allocate("extra", Priority(1)),
            Err(Error::NoTaskSlot)
        );
    }

    #[test]
    fn snapshot_lists_occupied_slots() {
        let mut table = TaskTable::new();
        let a = ready_task(&mut table, "worker", 3);
        let mut rows = [TaskInfo {
            id: TaskId(0),
            name: [0; NAME_LEN],
            state: TaskState::Free,
            priority: Priority(0),
            generation: 0,
            base: 0,
            total_size: 0,
        }; MAX_TASKS];
        let n = table.snapshot_into(&mut rows);
        assert_eq!(n, 2);
        assert_eq!(rows[0].id, TaskId(0));
        assert_eq!(abi::unpack_name(&rows[1].name), Some("worker"));
        assert_eq!(rows[1].id, TaskId(a as u8));
        assert_eq!(rows[1].state, TaskState::Ready);
    }

    #[test]
    fn layout_contains() {
        let l = MemLayout {
            base: 0x1000,
            total_size: 0x800,
            ..MemLayout::default()
        };
        assert!(l.contains(0x1000, 0x800));
        assert!(l.contains(0x17FF, 1));
        assert!(!l.contains(0x17FF, 2));
        assert!(!l.contains(0xFFF, 1));
        assert!(!l.contains(u32::MAX, 2));
    }
}
