// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel's open-file table.
//!
//! User programs name files by small descriptor numbers; each descriptor
//! maps to a collaborator handle plus the owning task and the open mode.
//! Ownership is enforced on every access, and task destruction closes
//! whatever the task left open.

use abi::TaskId;
use fs_api::{FileSys, Handle, OpenMode};

use crate::err::Error;

/// Capacity of the descriptor table, all tasks together.
pub const MAX_FILES: usize = 16;

#[derive(Copy, Clone, Debug)]
struct OpenEntry {
    handle: Handle,
    owner: TaskId,
    mode: OpenMode,
}

/// Descriptor table.
#[derive(Default)]
pub struct FileTable {
    slots: [Option<OpenEntry>; MAX_FILES],
}

impl FileTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an open collaborator handle for `owner`, returning the
    /// descriptor number.
    pub fn insert(
        &mut self,
        handle: Handle,
        owner: TaskId,
        mode: OpenMode,
    ) -> Result<u32, Error> {
        let (fd, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.is_none())
            .ok_or(Error::NoFileSlot)?;
        *slot = Some(OpenEntry {
            handle,
            owner,
            mode,
        });
        Ok(fd as u32)
    }

    /// Resolves a descriptor for `owner`, returning the collaborator handle
    /// and mode. Another task's descriptor is invisible, not forbidden.
    pub fn get(
        &self,
        fd: u32,
        owner: TaskId,
    ) -> Result<(Handle, OpenMode), Error> {
        match self.slots.get(fd as usize).copied().flatten() {
            Some(e) if e.owner == owner => Ok((e.handle, e.mode)),
            _ => Err(Error::BadArgument),
        }
    }

    /// Removes a descriptor, returning the handle for the caller to close.
    pub fn take(&mut self, fd: u32, owner: TaskId) -> Result<Handle, Error> {
        let slot = self
            .slots
            .get_mut(fd as usize)
            .ok_or(Error::BadArgument)?;
        match *slot {
            Some(e) if e.owner == owner => {
                *slot = None;
                Ok(e.handle)
            }
            _ => Err(Error::BadArgument),
        }
    }

    /// Closes every descriptor `owner` still holds. Called at task
    /// destruction; close failures are ignored, the task is gone either
    /// way.
    pub fn close_all_owned(&mut self, owner: TaskId, fs: &mut dyn FileSys) {
        for slot in self.slots.iter_mut() {
            if let Some(e) = slot {
                if e.owner == owner {
                    let _ = fs.close(e.handle);
                    *slot = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_are_per_owner() {
        let mut t = FileTable::new();
        let fd = t
            .insert(Handle(7), TaskId(1), OpenMode::READ)
            .unwrap();
        assert!(t.get(fd, TaskId(1)).is_ok());
        assert_eq!(t.get(fd, TaskId(2)), Err(Error::BadArgument));
        assert_eq!(t.take(fd, TaskId(2)), Err(Error::BadArgument));
        assert_eq!(t.take(fd, TaskId(1)), Ok(Handle(7)));
        assert_eq!(t.get(fd, TaskId(1)), Err(Error::BadArgument));
    }

    #[test]
    fn table_fills_up() {
        let mut t = FileTable::new();
        for _ in 0..MAX_FILES {
            t.insert(Handle(0), TaskId(1), OpenMode::READ).unwrap();
        }
        assert_eq!(
            t.insert(Handle(0), TaskId(1), OpenMode::READ),
            Err(Error::NoFileSlot)
        );
    }
}
