// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The MIMI runtime: pools, tasks, loader, and syscalls.
//!
//! Everything hangs off one explicitly-constructed [`Kernel`] value; there
//! is no global mutable state anywhere in this crate. The shell (an
//! external collaborator) owns the `Kernel`, the filesystem volume, and the
//! console, and threads them into [`load::load`], [`syscalls::dispatch`],
//! and [`Kernel::tick`].
//!
//! The concurrency model is cooperative and single-logical-thread: pool and
//! task-table operations are mutually excluded by the exclusive `&mut`
//! borrows they take, which is the Rust rendition of "one mutex per pool,
//! never hold both": the two pools are disjoint fields, so an operation
//! spanning both at once is not even expressible.

// Allow std-y things to be used in test. Note that this attribute is a bit
// of a trap for the programmer, because rust-analyzer by default seems to
// build things with test set. This means it's easy to introduce code
// incompatible with no_std without your editor hassling you about it.
// Beware.
#![cfg_attr(not(test), no_std)]

pub mod err;
pub mod files;
pub mod load;
pub mod pool;
pub mod syscalls;
pub mod task;
pub mod time;

pub use abi::{Arch, Priority, TaskId};
pub use err::Error;
pub use files::FileTable;
pub use pool::Pool;
pub use task::{TaskState, TaskTable};
pub use time::Timestamp;

use fs_api::FileSys;

/// Default virtual base address of the kernel pool arena.
pub const KPOOL_BASE: u32 = 0x2000_0000;

/// Default virtual base address of the user pool arena. Must not overlap
/// the kernel pool; loaded images, their stacks, and their heaps all live
/// here.
pub const UPOOL_BASE: u32 = 0x2004_0000;

/// The kernel context: both pools, the task table, the open-file table, and
/// the clock.
pub struct Kernel<'m> {
    pub kpool: Pool<'m>,
    pub upool: Pool<'m>,
    pub tasks: TaskTable,
    pub files: FileTable,
    now: Timestamp,
    arch: Arch,
}

impl<'m> Kernel<'m> {
    /// Builds a kernel over two statically-reserved arenas. `arch` is the
    /// instruction set of this target; the loader rejects images built for
    /// anything else.
    pub fn new(
        kernel_arena: &'m mut [u8],
        user_arena: &'m mut [u8],
        arch: Arch,
    ) -> Self {
        Self {
            kpool: Pool::new(kernel_arena, KPOOL_BASE),
            upool: Pool::new(user_arena, UPOOL_BASE),
            tasks: TaskTable::new(),
            files: FileTable::new(),
            now: Timestamp::default(),
            arch,
        }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn now(&self) -> Timestamp {
        self.now
    }

    /// Clock tick: advances kernel time, wakes due sleepers, and runs the
    /// scheduler. Returns the index of the task that should run next.
    ///
    /// The time source must be monotonic; a tick that goes backward is
    /// ignored rather than rewinding wake-ups.
    pub fn tick(&mut self, now_ms: u64) -> usize {
        let now = Timestamp::from(now_ms);
        if now > self.now {
            self.now = now;
        }
        self.tasks.wake_sleepers(self.now);
        self.tasks.schedule()
    }

    /// Kills a task and reclaims everything it owns: every user-pool block
    /// with its owner id, and every open file descriptor. The slot goes
    /// ZOMBIE, then FREE.
    ///
    /// Killing the kernel task (index 0) is refused.
    pub fn destroy_task(
        &mut self,
        fs: &mut dyn FileSys,
        index: usize,
    ) -> Result<(), Error> {
        self.tasks.kill(index)?;
        let owner = TaskId(index as u8);
        self.files.close_all_owned(owner, fs);
        self.upool.free_all_owned_by(owner);
        self.tasks.bury(index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fs_api::RamDisk;

    #[test]
    fn tick_runs_the_idle_task_when_nothing_is_loaded() {
        let mut karena = [0u8; 1024];
        let mut uarena = [0u8; 4096];
        let mut kernel =
            Kernel::new(&mut karena, &mut uarena, Arch::CortexM33);
        assert_eq!(kernel.tick(1), 0);
        assert_eq!(kernel.tick(2), 0);
        assert_eq!(u64::from(kernel.now()), 2);
        // A stale clock does not rewind kernel time.
        assert_eq!(kernel.tick(1), 0);
        assert_eq!(u64::from(kernel.now()), 2);
    }

    #[test]
    fn destroy_task_reclaims_memory_and_files() {
        let mut karena = [0u8; 1024];
        let mut uarena = [0u8; 8192];
        let mut kernel =
            Kernel::new(&mut karena, &mut uarena, Arch::CortexM33);
        let mut disk = RamDisk::new();
        disk.put("data.txt", b"x");

        let free_before = kernel.upool.free_bytes();
        let index = kernel.tasks.allocate("victim", Priority(5)).unwrap();
        kernel.tasks.make_ready(index);
        let owner = TaskId(index as u8);
        kernel.upool.alloc(100, owner).unwrap();
        kernel.upool.alloc(1000, owner).unwrap();
        let h = fs_api::FileSys::open(
            &mut disk,
            "data.txt",
            fs_api::OpenMode::READ,
        )
        .unwrap();
        kernel.files.insert(h, owner, fs_api::OpenMode::READ).unwrap();

        kernel.destroy_task(&mut disk, index).unwrap();
        assert_eq!(kernel.upool.free_bytes(), free_before);
        assert_eq!(
            kernel.tasks.get(index).unwrap().state(),
            TaskState::Free
        );
        // The descriptor is gone, so a later task with the same id cannot
        // reach the old handle.
        assert!(kernel.files.get(0, owner).is_err());
    }

    #[test]
    fn destroying_the_kernel_task_is_refused() {
        let mut karena = [0u8; 256];
        let mut uarena = [0u8; 256];
        let mut kernel =
            Kernel::new(&mut karena, &mut uarena, Arch::CortexM33);
        let mut disk = RamDisk::new();
        assert_eq!(
            kernel.destroy_task(&mut disk, 0),
            Err(Error::BadArgument)
        );
    }
}
