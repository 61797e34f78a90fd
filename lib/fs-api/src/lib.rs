// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The filesystem collaborator boundary.
//!
//! The compiler and loader never touch a block device or FAT32 directly;
//! they consume the [`FileSys`] trait defined here. On the device the trait
//! is implemented over the FAT32 driver; in this repository two host-side
//! implementations exist behind the `std` feature: [`HostFs`] maps a
//! directory of the real filesystem, and [`RamDisk`] is an in-memory volume
//! for tests.
//!
//! Open files are a scoped resource. The raw trait hands out [`Handle`]s,
//! and [`ScopedFile`] wraps one so the close happens on every exit path.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

use abi::ErrorCode;
use bitflags::bitflags;

#[cfg(feature = "std")]
mod host;
#[cfg(feature = "std")]
mod ramdisk;

#[cfg(feature = "std")]
pub use host::HostFs;
#[cfg(feature = "std")]
pub use ramdisk::RamDisk;

/// Longest file name a directory entry can report.
pub const DIRNAME_LEN: usize = 64;

bitflags! {
    /// Open-mode bits, matching the on-device ABI word.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct OpenMode: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// Every write lands at the current end of the file.
        const APPEND = 1 << 2;
        /// Create the file if absent. Requires WRITE.
        const CREATE = 1 << 3;
        /// Empty the file on open. Requires WRITE.
        const TRUNC = 1 << 4;
    }
}

/// Origin for [`FileSys::seek`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Whence {
    Set = 0,
    Cur = 1,
    End = 2,
}

impl core::convert::TryFrom<u32> for Whence {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Set),
            1 => Ok(Self::Cur),
            2 => Ok(Self::End),
            _ => Err(()),
        }
    }
}

/// An open file or directory handle. Values are implementation-assigned and
/// only meaningful to the volume that produced them.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct Handle(pub u32);

/// Errors a volume can report.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FsError {
    /// Path does not resolve.
    NotFound,
    /// Tried to open a directory as a file, or an argument was malformed.
    Inval,
    /// Operation not permitted by the handle's open mode.
    Perm,
    /// Device or short-transfer failure.
    Io,
    /// No free handle slots or no space on the volume.
    Busy,
}

impl core::fmt::Display for FsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(self, f)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for FsError {}

impl FsError {
    /// The wire code the shell and syscall layer report for this error.
    pub fn code(self) -> ErrorCode {
        match self {
            FsError::NotFound => ErrorCode::NoEnt,
            FsError::Inval => ErrorCode::Inval,
            FsError::Perm => ErrorCode::Perm,
            FsError::Io => ErrorCode::Io,
            FsError::Busy => ErrorCode::Busy,
        }
    }
}

/// One directory-iteration result.
#[derive(Copy, Clone)]
pub struct DirEntry {
    pub name: [u8; DIRNAME_LEN],
    pub name_len: u8,
    pub size: u32,
    pub attr: u8,
    pub is_dir: bool,
}

impl DirEntry {
    pub fn name(&self) -> &str {
        core::str::from_utf8(&self.name[..usize::from(self.name_len)])
            .unwrap_or("")
    }
}

/// Byte-stream file access, as provided by the external FAT32 collaborator.
///
/// Path resolution is implementation-defined; the core only ever passes
/// paths through unmodified. All blocking operations are cooperative
/// suspension points on the device.
pub trait FileSys {
    fn open(&mut self, path: &str, mode: OpenMode) -> Result<Handle, FsError>;
    fn close(&mut self, h: Handle) -> Result<(), FsError>;
    /// Reads up to `buf.len()` bytes; 0 means end of file.
    fn read(&mut self, h: Handle, buf: &mut [u8]) -> Result<usize, FsError>;
    /// Writes the whole buffer; a short write is an I/O error reported by
    /// the implementation.
    fn write(&mut self, h: Handle, buf: &[u8]) -> Result<usize, FsError>;
    fn seek(
        &mut self,
        h: Handle,
        offset: i32,
        whence: Whence,
    ) -> Result<u32, FsError>;
    fn tell(&mut self, h: Handle) -> Result<u32, FsError>;
    fn exists(&mut self, path: &str) -> bool;
    fn is_dir(&mut self, path: &str) -> bool;
    /// Removes a file (not a directory). Used for temporary object blobs.
    fn remove(&mut self, path: &str) -> Result<(), FsError>;
    fn open_dir(&mut self, path: &str) -> Result<Handle, FsError>;
    /// `Ok(None)` when the directory is exhausted.
    fn read_dir(&mut self, h: Handle) -> Result<Option<DirEntry>, FsError>;
    fn close_dir(&mut self, h: Handle) -> Result<(), FsError>;

    /// Fills `buf` completely or fails: a premature end of file is an I/O
    /// error. This is what loaders use to read fixed-size records.
    fn read_exact(
        &mut self,
        h: Handle,
        buf: &mut [u8],
    ) -> Result<(), FsError> {
        let mut done = 0;
        while done < buf.len() {
            match self.read(h, &mut buf[done..])? {
                0 => return Err(FsError::Io),
                n => done += n,
            }
        }
        Ok(())
    }
}

/// A file handle that is guaranteed to be closed.
///
/// Wraps a borrow of the volume together with an open handle; dropping the
/// wrapper closes the handle, so early returns cannot leak it and nobody
/// has to write a close call on every exit path.
pub struct ScopedFile<'f, F: FileSys + ?Sized> {
    fs: &'f mut F,
    handle: Handle,
}

impl<'f, F: FileSys + ?Sized> ScopedFile<'f, F> {
    pub fn open(
        fs: &'f mut F,
        path: &str,
        mode: OpenMode,
    ) -> Result<Self, FsError> {
        let handle = fs.open(path, mode)?;
        Ok(Self { fs, handle })
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
        self.fs.read(self.handle, buf)
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), FsError> {
        self.fs.read_exact(self.handle, buf)
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize, FsError> {
        self.fs.write(self.handle, buf)
    }

    pub fn seek(
        &mut self,
        offset: i32,
        whence: Whence,
    ) -> Result<u32, FsError> {
        self.fs.seek(self.handle, offset, whence)
    }

    pub fn tell(&mut self) -> Result<u32, FsError> {
        self.fs.tell(self.handle)
    }
}

impl<F: FileSys + ?Sized> Drop for ScopedFile<'_, F> {
    fn drop(&mut self) {
        // A close failure here has no caller to report to; the volume has
        // already flushed what it could.
        let _ = self.fs.close(self.handle);
    }
}
