// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory volume for tests.
//!
//! Behaves like the on-device FAT32 collaborator for everything the core
//! cares about: handle allocation, open-mode enforcement, append
//! positioning, and EOF semantics. Directories spring into existence from
//! the paths of the files placed on the disk.

use std::collections::BTreeMap;

use crate::{
    DirEntry, FileSys, FsError, Handle, OpenMode, Whence, DIRNAME_LEN,
};

#[derive(Debug)]
struct OpenFile {
    path: String,
    pos: u32,
    mode: OpenMode,
}

#[derive(Debug)]
enum Slot {
    File(OpenFile),
    Dir { entries: Vec<(String, u32, bool)>, next: usize },
}

/// An in-memory [`FileSys`].
#[derive(Debug, Default)]
pub struct RamDisk {
    files: BTreeMap<String, Vec<u8>>,
    slots: Vec<Option<Slot>>,
}

fn normalize(path: &str) -> &str {
    path.trim_start_matches('/')
}

impl RamDisk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places a file on the disk, replacing any previous content. Test
    /// fixture setup; not part of the collaborator interface.
    pub fn put(&mut self, path: &str, bytes: &[u8]) {
        self.files.insert(normalize(path).to_string(), bytes.to_vec());
    }

    /// Reads a whole file back out, for assertions.
    pub fn contents(&self, path: &str) -> Option<&[u8]> {
        self.files.get(normalize(path)).map(|v| v.as_slice())
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

    fn file_mut(&mut self, h: Handle) -> Result<&mut OpenFile, FsError> {
        match self.slots.get_mut(h.0 as usize) {
            Some(Some(Slot::File(f))) => Ok(f),
            _ => Err(FsError::Inval),
        }
    }

    fn dir_children(&self, path: &str) -> Vec<(String, u32, bool)> {
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{path}/")
        };
        let mut out: Vec<(String, u32, bool)> = Vec::new();
        for (name, data) in &self.files {
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                None => out.push((rest.to_string(), data.len() as u32, false)),
                Some((dir, _)) => {
                    if !out.iter().any(|(n, _, d)| *d && n == dir) {
                        out.push((dir.to_string(), 0, true));
                    }
                }
            }
        }
        out
    }
}

impl FileSys for RamDisk {
    fn open(&mut self, path: &str, mode: OpenMode) -> Result<Handle, FsError> {
        let path = normalize(path);
        if !mode.intersects(OpenMode::READ | OpenMode::WRITE) {
            return Err(FsError::Inval);
        }
        if self.is_dir(path) {
            return Err(FsError::Inval);
        }
        if !self.files.contains_key(path) {
            if mode.contains(OpenMode::CREATE | OpenMode::WRITE) {
                self.files.insert(path.to_string(), Vec::new());
            } else {
                return Err(FsError::NotFound);
            }
        }
        if mode.contains(OpenMode::TRUNC) {
            if !mode.contains(OpenMode::WRITE) {
                return Err(FsError::Perm);
            }
            self.files.get_mut(path).unwrap().clear();
        }
        Ok(self.grab_slot(Slot::File(OpenFile {
            path: path.to_string(),
            pos: 0,
            mode,
        })))
    }

    fn close(&mut self, h: Handle) -> Result<(), FsError> {
        match self.slots.get_mut(h.0 as usize) {
            Some(s @ Some(Slot::File(_))) => {
                *s = None;
                Ok(())
            }
            _ => Err(FsError::Inval),
        }
    }

    fn read(&mut self, h: Handle, buf: &mut [u8]) -> Result<usize, FsError> {
        let f = self.file_mut(h)?;
        if !f.mode.contains(OpenMode::READ) {
            return Err(FsError::Perm);
        }
        let (path, pos) = (f.path.clone(), f.pos as usize);
        let data = self.files.get(&path).ok_or(FsError::Io)?;
        if pos >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - pos);
        buf[..n].copy_from_slice(&data[pos..pos + n]);
        self.file_mut(h)?.pos += n as u32;
        Ok(n)
    }

    fn write(&mut self, h: Handle, buf: &[u8]) -> Result<usize, FsError> {
        let f = self.file_mut(h)?;
        if !f.mode.contains(OpenMode::WRITE) {
            return Err(FsError::Perm);
        }
        let append = f.mode.contains(OpenMode::APPEND);
        let (path, mut pos) = (f.path.clone(), f.pos as usize);
        let data = self.files.get_mut(&path).ok_or(FsError::Io)?;
        if append {
            pos = data.len();
        }
        if pos + buf.len() > data.len() {
            data.resize(pos + buf.len(), 0);
        }
        data[pos..pos + buf.len()].copy_from_slice(buf);
        self.file_mut(h)?.pos = (pos + buf.len()) as u32;
        Ok(buf.len())
    }

    fn seek(
        &mut self,
        h: Handle,
        offset: i32,
        whence: Whence,
    ) -> Result<u32, FsError> {
        let f = self.file_mut(h)?;
        let (path, pos) = (f.path.clone(), f.pos);
        let len = self.files.get(&path).ok_or(FsError::Io)?.len() as i64;
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => i64::from(pos),
            Whence::End => len,
        };
        let target = base + i64::from(offset);
        if target < 0 || target > u32::MAX as i64 {
            return Err(FsError::Inval);
        }
        self.file_mut(h)?.pos = target as u32;
        Ok(target as u32)
    }

    fn tell(&mut self, h: Handle) -> Result<u32, FsError> {
        Ok(self.file_mut(h)?.pos)
    }

    fn exists(&mut self, path: &str) -> bool {
        let path = normalize(path);
        self.files.contains_key(path) || self.is_dir(path)
    }

    fn is_dir(&mut self, path: &str) -> bool {
        let path = normalize(path);
        if path.is_empty() {
            return true;
        }
        let prefix = format!("{path}/");
        self.files.keys().any(|k| k.starts_with(&prefix))
    }

    fn remove(&mut self, path: &str) -> Result<(), FsError> {
        self.files
            .remove(normalize(path))
            .map(|_| ())
            .ok_or(FsError::NotFound)
    }

    fn open_dir(&mut self, path: &str) -> Result<Handle, FsError> {
        let path = normalize(path);
        if !self.is_dir(path) {
            return Err(FsError::NotFound);
        }
        let entries = self.dir_children(path);
        Ok(self.grab_slot(Slot::Dir { entries, next: 0 }))
    }

    fn read_dir(&mut self, h: Handle) -> Result<Option<DirEntry>, FsError> {
        match self.slots.get_mut(h.0 as usize) {
            Some(Some(Slot::Dir { entries, next })) => {
                let Some((name, size, is_dir)) = entries.get(*next) else {
                    return Ok(None);
                };
                *next += 1;
                let mut buf = [0; DIRNAME_LEN];
                let n = name.len().min(DIRNAME_LEN);
                buf[..n].copy_from_slice(&name.as_bytes()[..n]);
                Ok(Some(DirEntry {
                    name: buf,
                    name_len: n as u8,
                    size: *size,
                    attr: 0,
                    is_dir: *is_dir,
                }))
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ScopedFile;

    #[test]
    fn open_modes_enforced() {
        let mut disk = RamDisk::new();
        disk.put("a.txt", b"hello");

        assert_eq!(
            disk.open("missing", OpenMode::READ),
            Err(FsError::NotFound)
        );

        let h = disk.open("a.txt", OpenMode::READ).unwrap();
        assert_eq!(disk.write(h, b"x"), Err(FsError::Perm));
        let mut buf = [0u8; 5];
        disk.read_exact(h, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(disk.read(h, &mut buf).unwrap(), 0);
        disk.close(h).unwrap();
    }

    #[test]
    fn create_trunc_append() {
        let mut disk = RamDisk::new();
        let h = disk
            .open("log", OpenMode::WRITE | OpenMode::CREATE)
            .unwrap();
        disk.write(h, b"one").unwrap();
        disk.close(h).unwrap();

        let h = disk
            .open("log", OpenMode::WRITE | OpenMode::APPEND)
            .unwrap();
        disk.write(h, b"two").unwrap();
        disk.close(h).unwrap();
        assert_eq!(disk.contents("log"), Some(&b"onetwo"[..]));

        let h = disk
            .open("log", OpenMode::WRITE | OpenMode::TRUNC)
            .unwrap();
        disk.close(h).unwrap();
        assert_eq!(disk.contents("log"), Some(&b""[..]));
    }

    #[test]
    fn seek_and_tell() {
        let mut disk = RamDisk::new();
        disk.put("f", b"0123456789");
        let h = disk.open("f", OpenMode::READ).unwrap();
        assert_eq!(disk.seek(h, -3, Whence::End).unwrap(), 7);
        let mut b = [0u8; 3];
        disk.read_exact(h, &mut b).unwrap();
        assert_eq!(&b, b"789");
        assert_eq!(disk.tell(h).unwrap(), 10);
        assert_eq!(disk.seek(h, -11, Whence::Cur), Err(FsError::Inval));
        disk.close(h).unwrap();
    }

    #[test]
    fn directories_are_implied_by_paths() {
        let mut disk = RamDisk::new();
        disk.put("src/a.c", b"x");
        disk.put("src/sub/b.c", b"y");
        assert!(disk.is_dir("src"));
        assert!(disk.exists("src"));
        assert!(!disk.is_dir("src/a.c"));
        assert_eq!(disk.open("src", OpenMode::READ), Err(FsError::Inval));

        let d = disk.open_dir("src").unwrap();
        let mut names = Vec::new();
        while let Some(e) = disk.read_dir(d).unwrap() {
            names.push((e.name().to_string(), e.is_dir));
        }
        disk.close_dir(d).unwrap();
        names.sort();
        assert_eq!(
            names,
            vec![("a.c".to_string(), false), ("sub".to_string(), true)]
        );
    }

    #[test]
    fn scoped_file_closes_on_drop() {
        let mut disk = RamDisk::new();
        disk.put("f", b"abc");
        {
            let mut file =
                ScopedFile::open(&mut disk, "f", OpenMode::READ).unwrap();
            let mut b = [0u8; 1];
            file.read_exact(&mut b).unwrap();
            assert_eq!(b[0], b'a');
        }
        // The handle slot is free again.
        assert!(matches!(disk.slots[0], None));
    }
}
