// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared ABI definitions for the MIMI toolchain and runtime.
//!
//! Everything the compiler, linker, loader, and kernel must agree on lives
//! here: the MIMI container records, the relocation and symbol encodings,
//! the syscall numbers, and the wire error codes. The crate is `no_std` and
//! contains no behavior beyond encoding, decoding, and validation, so it can
//! be shared between the on-device runtime and host tools.

#![cfg_attr(not(test), no_std)]

use core::convert::TryFrom;

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub mod mimi;
pub mod thumb;

/// Length of every fixed name field in the ABI: MIMI image names, symbol
/// names, and task names. Longer names are truncated at this boundary by
/// every producer, so two implementations always agree on the stored bytes.
pub const NAME_LEN: usize = 16;

/// Allocation granularity of both memory pools, in bytes.
pub const ALLOC_ALIGN: u32 = 32;

/// A free block is split during allocation only when the tail remainder is
/// at least this large; smaller remainders stay attached to the allocation.
pub const SPLIT_THRESHOLD: u32 = 64;

/// Stack given to a loaded program whose header requests less.
pub const DEFAULT_STACK: u32 = 4096;

/// Heap given to a loaded program whose header requests less.
pub const DEFAULT_HEAP: u32 = 4096;

/// Result codes shared by every core operation and by the syscall ABI.
///
/// Loaded programs see these as negative `i32` values in r0; host tools map
/// them onto process exit codes. `Ok` is zero so a syscall can return a
/// payload and an error through the same register.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    NoMem = -1,
    Inval = -2,
    NoEnt = -3,
    Io = -4,
    Busy = -5,
    Perm = -6,
    NoSys = -7,
    Corrupt = -8,
    TooLarge = -9,
    NoExec = -10,
}

impl ErrorCode {
    /// Returns the code as the raw register value a loaded program observes.
    pub const fn as_ret(self) -> u32 {
        self as i32 as u32
    }
}

/// Instruction sets a MIMI can target. The loader refuses an image whose
/// `arch` does not match the running target.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Arch {
    /// ARMv6-M Thumb (Cortex-M0+).
    CortexM0Plus = 0,
    /// ARMv8-M Mainline Thumb-2 (Cortex-M33). The compiler in this
    /// repository always emits this value; its output uses B.W (T4), which
    /// v6-M lacks.
    CortexM33 = 1,
    /// RV32IMC.
    RiscV32 = 2,
}

impl TryFrom<u8> for Arch {
    type Error = ();

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::CortexM0Plus),
            1 => Ok(Self::CortexM33),
            2 => Ok(Self::RiscV32),
            _ => Err(()),
        }
    }
}

/// Program sections, in image order. `None` is the section of undefined
/// symbols; `Bss` occupies no bytes in the container.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Section {
    None = 0,
    Text = 1,
    Rodata = 2,
    Data = 3,
    Bss = 4,
}

impl TryFrom<u8> for Section {
    type Error = ();

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::None),
            1 => Ok(Self::Text),
            2 => Ok(Self::Rodata),
            3 => Ok(Self::Data),
            4 => Ok(Self::Bss),
            _ => Err(()),
        }
    }
}

impl Section {
    /// True for the sections that occupy memory at run time and can anchor
    /// a defined symbol.
    pub fn is_allocated(self) -> bool {
        !matches!(self, Section::None)
    }
}

/// Kinds of symbol records.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SymbolKind {
    /// Defined, not visible across objects.
    Local = 0,
    /// Defined, visible across objects; satisfies externs of the same name.
    Global = 1,
    /// Undefined reference, to be satisfied at link time.
    Extern = 2,
    /// A kernel entry point; `value` is the syscall number, not an offset.
    Syscall = 3,
}

impl TryFrom<u8> for SymbolKind {
    type Error = ();

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Local),
            1 => Ok(Self::Global),
            2 => Ok(Self::Extern),
            3 => Ok(Self::Syscall),
            _ => Err(()),
        }
    }
}

/// Relocation kinds understood by the loader.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RelocKind {
    /// Write the symbol's absolute load address as a u32.
    Abs32 = 0,
    /// Write `symbol - patch_addr - 4` as an i32.
    Rel32 = 1,
    /// Encode a Thumb-2 BL (two half-words) reaching the symbol.
    ThumbCall = 2,
    /// Encode a Thumb-2 B.W (two half-words) reaching the symbol.
    ThumbBranch = 3,
    /// Same write as `Abs32`, but the patch site is in a data section.
    DataPtr = 4,
}

impl TryFrom<u8> for RelocKind {
    type Error = ();

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Abs32),
            1 => Ok(Self::Rel32),
            2 => Ok(Self::ThumbCall),
            3 => Ok(Self::ThumbBranch),
            4 => Ok(Self::DataPtr),
            _ => Err(()),
        }
    }
}

/// Enumeration of syscall numbers.
///
/// A loaded program places one of these in r7, arguments in r0-r3, and
/// executes `SVC #0`; the result comes back in r0. Numbers are grouped in
/// families with room left for growth, so the gaps are deliberate.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Sysnum {
    Exit = 0,
    Yield = 1,
    Sleep = 2,
    Time = 3,
    // Compiler support calls: the codegen lowers `/` and `%` to these.
    Sdiv = 4,
    Smod = 5,

    Malloc = 10,
    Free = 11,
    Realloc = 12,

    Open = 20,
    Close = 21,
    Read = 22,
    Write = 23,
    Seek = 24,

    Putchar = 30,
    Getchar = 31,
    Puts = 32,

    GpioInit = 40,
    GpioDir = 41,
    GpioPut = 42,
    GpioGet = 43,
    GpioPulls = 44,

    PwmInit = 50,
    PwmSetWrap = 51,
    PwmSetLevel = 52,
    PwmEnable = 53,

    AdcInit = 60,
    AdcSelect = 61,
    AdcRead = 62,
    AdcTemp = 63,

    SpiInit = 70,
    SpiWrite = 71,
    SpiRead = 72,
    SpiTransfer = 73,

    I2cInit = 80,
    I2cWrite = 81,
    I2cRead = 82,
}

/// We're using an explicit `TryFrom` impl for `Sysnum` instead of
/// `FromPrimitive` because the runtime doesn't otherwise depend on
/// `num-traits` and this seems okay.
impl TryFrom<u32> for Sysnum {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Exit),
            1 => Ok(Self::Yield),
            2 => Ok(Self::Sleep),
            3 => Ok(Self::Time),
            4 => Ok(Self::Sdiv),
            5 => Ok(Self::Smod),
            10 => Ok(Self::Malloc),
            11 => Ok(Self::Free),
            12 => Ok(Self::Realloc),
            20 => Ok(Self::Open),
            21 => Ok(Self::Close),
            22 => Ok(Self::Read),
            23 => Ok(Self::Write),
            24 => Ok(Self::Seek),
            30 => Ok(Self::Putchar),
            31 => Ok(Self::Getchar),
            32 => Ok(Self::Puts),
            40 => Ok(Self::GpioInit),
            41 => Ok(Self::GpioDir),
            42 => Ok(Self::GpioPut),
            43 => Ok(Self::GpioGet),
            44 => Ok(Self::GpioPulls),
            50 => Ok(Self::PwmInit),
            51 => Ok(Self::PwmSetWrap),
            52 => Ok(Self::PwmSetLevel),
            53 => Ok(Self::PwmEnable),
            60 => Ok(Self::AdcInit),
            61 => Ok(Self::AdcSelect),
            62 => Ok(Self::AdcRead),
            63 => Ok(Self::AdcTemp),
            70 => Ok(Self::SpiInit),
            71 => Ok(Self::SpiWrite),
            72 => Ok(Self::SpiRead),
            73 => Ok(Self::SpiTransfer),
            80 => Ok(Self::I2cInit),
            81 => Ok(Self::I2cWrite),
            82 => Ok(Self::I2cRead),
            _ => Err(()),
        }
    }
}

/// Indicates priority of a task.
///
/// Priorities are small numbers; numerically lower priorities are more
/// important. The idle task runs at 255, the least important priority.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`,
/// to keep us from confusing ourselves on whether `>` means numerically
/// greater / less important, or more important / numerically smaller.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Default,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Unaligned,
    Serialize,
    Deserialize,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// The idle task's priority; nothing may be less important.
    pub const IDLE: Self = Self(255);

    /// Checks if `self` is strictly more important than `other`.
    ///
    /// This is easier to read than comparing the numeric values of the
    /// priorities, since lower numbers are more important.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }
}

/// Names a slot in the task table. Slot 0 is the kernel/idle task, which
/// also serves as the owner id for kernel-pool allocations.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TaskId(pub u8);

impl TaskId {
    pub const KERNEL: Self = Self(0);

    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Copies `name` into a fixed `[u8; NAME_LEN]` field, truncating and
/// NUL-padding as required.
pub fn pack_name(name: &str) -> [u8; NAME_LEN] {
    let mut out = [0; NAME_LEN];
    for (dst, src) in out.iter_mut().zip(name.bytes()) {
        *dst = src;
    }
    out
}

/// Recovers the textual part of a packed name field. Stops at the first NUL;
/// non-UTF-8 names come back as `None` rather than panicking on display.
pub fn unpack_name(name: &[u8; NAME_LEN]) -> Option<&str> {
    let len = name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    core::str::from_utf8(&name[..len]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_the_wire_values() {
        assert_eq!(ErrorCode::Ok as i32, 0);
        assert_eq!(ErrorCode::NoMem as i32, -1);
        assert_eq!(ErrorCode::NoExec as i32, -10);
        assert_eq!(ErrorCode::NoMem.as_ret(), 0xFFFF_FFFF);
    }

    #[test]
    fn sysnum_round_trips() {
        for n in 0..=90u32 {
            if let Ok(s) = Sysnum::try_from(n) {
                assert_eq!(s as u32, n);
            }
        }
        assert!(Sysnum::try_from(6).is_err());
        assert!(Sysnum::try_from(33).is_err());
        assert!(Sysnum::try_from(83).is_err());
    }

    #[test]
    fn name_packing_truncates_and_pads() {
        let packed = pack_name("main");
        assert_eq!(&packed[..4], b"main");
        assert!(packed[4..].iter().all(|&b| b == 0));
        assert_eq!(unpack_name(&packed), Some("main"));

        let long = pack_name("a_name_longer_than_sixteen_bytes");
        assert_eq!(unpack_name(&long), Some("a_name_longer_th"));
    }
}
