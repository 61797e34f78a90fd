// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A [`FileSys`] over a directory of the host filesystem.
//!
//! Used by the `mimic` CLI so the compiler and linker see the same byte
//! stream interface they see on-device. All paths are resolved relative to
//! the root directory the volume was created with.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::{
    DirEntry, FileSys, FsError, Handle, OpenMode, Whence, DIRNAME_LEN,
};

enum Slot {
    File { file: fs::File, mode: OpenMode },
    Dir { entries: Vec<DirEntry>, next: usize },
}

/// Host-directory volume.
pub struct HostFs {
    root: PathBuf,
    slots: Vec<Option<Slot>>,
}

fn io_err(e: &std::io::Error) -> FsError {
    match e.kind() {
        std::io::ErrorKind::NotFound => FsError::NotFound,
        std::io::ErrorKind::PermissionDenied => FsError::Perm,
        _ => FsError::Io,
    }
}

impl HostFs {
    /// Creates a volume rooted at `root`; typically the current directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            slots: Vec::new(),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(Path::new(path.trim_start_matches('/')))
    }

    fn grab_slot(&mut self, slot: Slot) -> Handle {
        for (i, s) in self.slots.iter_mut().enumerate() {
            if s.is_none() {
                *s = Some(slot);
                return Handle(i as u32);
            }
        }
        self.slots.push(Some(slot));
        Handle((self.slots.len() - 1) as u32)
    }

    fn file_mut(
        &mut self,
        h: Handle,
    ) -> Result<(&mut fs::File, OpenMode), FsError> {
        match self.slots.get_mut(h.0 as usize) {
            Some(Some(Slot::File { file, mode })) => Ok((file, *mode)),
            _ => Err(FsError::Inval),
        }
    }
}

impl FileSys for HostFs {
    fn open(&mut self, path: &str, mode: OpenMode) -> Result<Handle, FsError> {
        if !mode.intersects(OpenMode::READ | OpenMode::WRITE) {
            return Err(FsError::Inval);
        }
        if mode
            .intersects(OpenMode::TRUNC | OpenMode::CREATE)
            && !mode.contains(OpenMode::WRITE)
        {
            return Err(FsError::Perm);
        }
        let full = self.resolve(path);
        if full.is_dir() {
            return Err(FsError::Inval);
        }
        let file = fs::OpenOptions::new()
            .read(mode.contains(OpenMode::READ))
            .write(
                mode.contains(OpenMode::WRITE)
                    && !mode.contains(OpenMode::APPEND),
            )
            .append(mode.contains(OpenMode::APPEND))
            .create(mode.contains(OpenMode::CREATE))
            .truncate(mode.contains(OpenMode::TRUNC))
            .open(&full)
            .map_err(|e| io_err(&e))?;
        Ok(self.grab_slot(Slot::File { file, mode }))
    }

    fn close(&mut self, h: Handle) -> Result<(), FsError> {
        match self.slots.get_mut(h.0 as usize) {
            Some(s @ Some(Slot::File { .. })) => {
                *s = None;
                Ok(())
            }
            _ => Err(FsError::Inval),
        }
    }

    fn read(&mut self, h: Handle, buf: &mut [u8]) -> Result<usize, FsError> {
        let (file, mode) = self.file_mut(h)?;
        if !mode.contains(OpenMode::READ) {
            return Err(FsError::Perm);
        }
        file.read(buf).map_err(|e| io_err(&e))
    }

    fn write(&mut self, h: Handle, buf: &[u8]) -> Result<usize, FsError> {
        let (file, mode) = self.file_mut(h)?;
        if !mode.contains(OpenMode::WRITE) {
            return Err(FsError::Perm);
        }
        file.write_all(buf).map_err(|e| io_err(&e))?;
        Ok(buf.len())
    }

    fn seek(
        &mut self,
        h: Handle,
        offset: i32,
        whence: Whence,
    ) -> Result<u32, FsError> {
        let (file, _) = self.file_mut(h)?;
        let from = match whence {
            Whence::Set => {
                if offset < 0 {
                    return Err(FsError::Inval);
                }
                SeekFrom::Start(offset as u64)
            }
            Whence::Cur => SeekFrom::Current(i64::from(offset)),
            Whence::End => SeekFrom::End(i64::from(offset)),
        };
        let pos = file.seek(from).map_err(|e| io_err(&e))?;
        u32::try_from(pos).map_err(|_| FsError::Inval)
    }

    fn tell(&mut self, h: Handle) -> Result<u32, FsError> {
        self.seek(h, 0, Whence::Cur)
    }

    fn exists(&mut self, path: &str) -> bool {
        self.resolve(path).exists()
    }

    fn is_dir(&mut self, path: &str) -> bool {
        self.resolve(path).is_dir()
    }

    fn remove(&mut self, path: &str) -> Result<(), FsError> {
        fs::remove_file(self.resolve(path)).map_err(|e| io_err(&e))
    }

    fn open_dir(&mut self, path: &str) -> Result<Handle, FsError> {
        let mut entries = Vec::new();
        let iter =
            fs::read_dir(self.resolve(path)).map_err(|e| io_err(&e))?;
        for entry in iter {
            let entry = entry.map_err(|e| io_err(&e))?;
            let meta = entry.metadata().map_err(|e| io_err(&e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let mut buf = [0; DIRNAME_LEN];
            let n = name.len().min(DIRNAME_LEN);
            buf[..n].copy_from_slice(&name.as_bytes()[..n]);
            entries.push(DirEntry {
                name: buf,
                name_len: n as u8,
                size: u32::try_from(meta.len()).unwrap_or(u32::MAX),
                attr: 0,
                is_dir: meta.is_dir(),
            });
        }
        Ok(self.grab_slot(Slot::Dir { entries, next: 0 }))
    }

    fn read_dir(&mut self, h: Handle) -> Result<Option<DirEntry>, FsError> {
        match self.slots.get_mut(h.0 as usize) {
            Some(Some(Slot::Dir { entries, next })) => {
                let e = entries.get(*next).copied();
                if e.is_some() {
                    *next += 1;
                }
                Ok(e)
            }
            _ => Err(FsError::Inval),
        }
    }

    fn close_dir(&mut self, h: Handle) -> Result<(), FsError> {
        match self.slots.get_mut(h.0 as usize) {
            Some(s @ Some(Slot::Dir { .. })) => {
                *s = None;
                Ok(())
            }
            _ => Err(FsError::Inval),
        }
    }
}
