// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Kernel operations report precise conditions internally and collapse to
//! the ten-code wire vocabulary at the boundary: the shell and the syscall
//! return register only ever see an [`ErrorCode`].

use abi::mimi::HeaderDefect;
use abi::ErrorCode;
use fs_api::FsError;

/// Everything that can go wrong inside the runtime.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// No free block large enough, in either pool.
    OutOfMemory,
    /// A split was required but the descriptor table is full.
    DescriptorsExhausted,
    /// The named block is pinned and cannot be freed.
    Pinned,
    /// A handle, address, or argument did not refer to anything valid.
    BadArgument,
    /// All task slots are in use.
    NoTaskSlot,
    /// All file-table slots are in use.
    NoFileSlot,
    /// Path did not resolve.
    NotFound,
    /// Device-level failure, including short writes.
    Io,
    /// Operation forbidden by an open mode or by ownership.
    NotPermitted,
    /// Structural invariant violated: truncated section, bad record bytes,
    /// bad symbol index.
    Corrupt,
    /// A value exceeded an architectural or configured limit.
    TooLarge,
    /// The container header was rejected; carries the offending field.
    Image(HeaderDefect),
    /// Feature or syscall not implemented.
    NoSys,
}

impl Error {
    /// The wire code reported for this condition.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::OutOfMemory | Error::DescriptorsExhausted => {
                ErrorCode::NoMem
            }
            Error::BadArgument => ErrorCode::Inval,
            Error::NotFound => ErrorCode::NoEnt,
            Error::Io => ErrorCode::Io,
            Error::NoTaskSlot | Error::NoFileSlot => ErrorCode::Busy,
            Error::Pinned | Error::NotPermitted => ErrorCode::Perm,
            Error::NoSys => ErrorCode::NoSys,
            Error::Corrupt => ErrorCode::Corrupt,
            Error::TooLarge => ErrorCode::TooLarge,
            Error::Image(_) => ErrorCode::NoExec,
        }
    }

    /// The raw register value a loaded program sees for this condition.
    pub fn as_ret(&self) -> u32 {
        self.code().as_ret()
    }
}

impl From<FsError> for Error {
    fn from(e: FsError) -> Self {
        match e {
            FsError::NotFound => Error::NotFound,
            FsError::Inval => Error::BadArgument,
            FsError::Perm => Error::NotPermitted,
            FsError::Io => Error::Io,
            FsError::Busy => Error::NoFileSlot,
        }
    }
}
