// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Syscall dispatch.
//!
//! A loaded program raises `SVC #0` with the syscall number in r7 and up to
//! four arguments in r0-r3; the architecture layer (or the test harness's
//! interpreter) funnels that here. Every handler has the same shape: it
//! takes the kernel context and the calling task's index, returns
//! `Result<u32, Error>`, and the dispatcher collapses errors to their wire
//! code in r0.
//!
//! Pointer arguments are never trusted: each one is checked against the
//! caller's memory layout before any kernel access, so a bad pointer gets
//! INVAL instead of a wild read.

use core::convert::TryFrom;

use abi::{ErrorCode, Sysnum, TaskId};
use fs_api::{FileSys, OpenMode, Whence};

use crate::err::Error;
use crate::pool::Pool;
use crate::task::MemLayout;
use crate::Kernel;

/// Byte sink/source for the putchar/getchar/puts family.
pub trait Console {
    fn putchar(&mut self, c: u8);
    /// `None` when no input is pending; the syscall then returns -1.
    fn getchar(&mut self) -> Option<u8>;
}

/// A console that swallows output and never has input.
pub struct NullConsole;

impl Console for NullConsole {
    fn putchar(&mut self, _c: u8) {}

    fn getchar(&mut self) -> Option<u8> {
        None
    }
}

/// Peripheral families (GPIO, PWM, ADC, SPI, I2C) are board concerns; the
/// kernel forwards their syscall numbers here untouched.
pub trait Board {
    fn syscall(&mut self, _num: Sysnum, _args: [u32; 4]) -> u32 {
        ErrorCode::NoSys.as_ret()
    }
}

/// A board with no peripherals: everything answers NOSYS.
pub struct NullBoard;

impl Board for NullBoard {}

/// How a syscall left the calling task.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SysOutcome {
    /// Deliver this value in r0 and keep the task schedulable. Yield and
    /// sleep land here too; the state change is already recorded and the
    /// next `tick` acts on it.
    Return(u32),
    /// The task exited with this code; its slot and memory are reclaimed.
    Exited(u32),
}

/// Longest path a program may pass to `open`.
const PATH_MAX: u32 = 128;

/// Longest string `puts` will walk before giving up.
const PUTS_MAX: u32 = 4096;

/// Entry point for a syscall raised by the task at `caller`.
pub fn dispatch(
    kernel: &mut Kernel<'_>,
    fs: &mut dyn FileSys,
    console: &mut dyn Console,
    board: &mut dyn Board,
    caller: usize,
    nr: u32,
    args: [u32; 4],
) -> SysOutcome {
    let Ok(num) = Sysnum::try_from(nr) else {
        return SysOutcome::Return(ErrorCode::NoSys.as_ret());
    };

    let r = match num {
        Sysnum::Exit => {
            return match kernel.destroy_task(fs, caller) {
                Ok(()) => SysOutcome::Exited(args[0]),
                Err(e) => SysOutcome::Return(e.as_ret()),
            };
        }
        Sysnum::Yield => {
            kernel.tasks.yield_current();
            Ok(0)
        }
        Sysnum::Sleep => {
            let wake = kernel.now().offset_ms(args[0]);
            kernel.tasks.sleep(caller, wake);
            Ok(0)
        }
        Sysnum::Time => Ok(kernel.now().as_ms_u32()),

        // Integer division support for the compiler; divide-by-zero
        // deterministically answers 0.
        Sysnum::Sdiv => Ok(div_or_zero(args[0], args[1], false)),
        Sysnum::Smod => Ok(div_or_zero(args[0], args[1], true)),

        Sysnum::Malloc => {
            kernel.upool.alloc(args[0], TaskId(caller as u8))
        }
        Sysnum::Free => kernel
            .upool
            .free_owned(args[0], TaskId(caller as u8))
            .map(|()| 0),
        Sysnum::Realloc => sys_realloc(kernel, caller, args),

        Sysnum::Open => sys_open(kernel, fs, caller, args),
        Sysnum::Close => sys_close(kernel, fs, caller, args),
        Sysnum::Read => sys_read(kernel, fs, caller, args),
        Sysnum::Write => sys_write(kernel, fs, caller, args),
        Sysnum::Seek => sys_seek(kernel, fs, caller, args),

        Sysnum::Putchar => {
            console.putchar(args[0] as u8);
            Ok(0)
        }
        Sysnum::Getchar => {
            Ok(console.getchar().map(u32::from).unwrap_or(u32::MAX))
        }
        Sysnum::Puts => sys_puts(kernel, console, caller, args),

        // Peripheral families belong to the board.
        _ => return SysOutcome::Return(board.syscall(num, args)),
    };

    SysOutcome::Return(r.unwrap_or_else(|e| e.as_ret()))
}

fn div_or_zero(a: u32, b: u32, modulo: bool) -> u32 {
    let (a, b) = (a as i32, b as i32);
    if b == 0 {
        return 0;
    }
    let v = if modulo {
        a.wrapping_rem(b)
    } else {
        a.wrapping_div(b)
    };
    v as u32
}

fn caller_layout(kernel: &Kernel<'_>, caller: usize) -> Result<MemLayout, Error> {
    Ok(*kernel
        .tasks
        .get(caller)
        .ok_or(Error::BadArgument)?
        .layout())
}

/// Borrows `[addr, addr+len)` of the caller's block for reading.
fn user_slice<'p>(
    upool: &'p Pool<'_>,
    layout: &MemLayout,
    addr: u32,
    len: u32,
) -> Result<&'p [u8], Error> {
    if !layout.contains(addr, len) {
        return Err(Error::BadArgument);
    }
    upool.slice(addr, len).ok_or(Error::BadArgument)
}

/// Borrows `[addr, addr+len)` of the caller's block for writing.
fn user_slice_mut<'p>(
    upool: &'p mut Pool<'_>,
    layout: &MemLayout,
    addr: u32,
    len: u32,
) -> Result<&'p mut [u8], Error> {
    if !layout.contains(addr, len) {
        return Err(Error::BadArgument);
    }
    upool.slice_mut(addr, len).ok_or(Error::BadArgument)
}

/// Reads a NUL-terminated string out of the caller's memory, bounded by
/// `max` bytes and by the end of the caller's block.
fn user_cstr<'p>(
    upool: &'p Pool<'_>,
    layout: &MemLayout,
    addr: u32,
    max: u32,
) -> Result<&'p str, Error> {
    if !layout.contains(addr, 1) {
        return Err(Error::BadArgument);
    }
    let avail = (layout.base + layout.total_size - addr).min(max);
    let bytes = upool.slice(addr, avail).ok_or(Error::BadArgument)?;
    let n = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or(Error::BadArgument)?;
    core::str::from_utf8(&bytes[..n]).map_err(|_| Error::BadArgument)
}

fn sys_open(
    kernel: &mut Kernel<'_>,
    fs: &mut dyn FileSys,
    caller: usize,
    args: [u32; 4],
) -> Result<u32, Error> {
    let layout = caller_layout(kernel, caller)?;
    let mode = OpenMode::from_bits(args[1]).ok_or(Error::BadArgument)?;
    let handle = {
        let path = user_cstr(&kernel.upool, &layout, args[0], PATH_MAX)?;
        fs.open(path, mode)?
    };
    match kernel.files.insert(handle, TaskId(caller as u8), mode) {
        Ok(fd) => Ok(fd),
        Err(e) => {
            let _ = fs.close(handle);
            Err(e)
        }
    }
}

fn sys_close(
    kernel: &mut Kernel<'_>,
    fs: &mut dyn FileSys,
    caller: usize,
    args: [u32; 4],
) -> Result<u32, Error> {
    let handle = kernel.files.take(args[0], TaskId(caller as u8))?;
    fs.close(handle)?;
    Ok(0)
}

fn sys_read(
    kernel: &mut Kernel<'_>,
    fs: &mut dyn FileSys,
    caller: usize,
    args: [u32; 4],
) -> Result<u32, Error> {
    let layout = caller_layout(kernel, caller)?;
    let (handle, _) = kernel.files.get(args[0], TaskId(caller as u8))?;
    let buf = user_slice_mut(&mut kernel.upool, &layout, args[1], args[2])?;
    let n = fs.read(handle, buf)?;
    Ok(n as u32)
}

fn sys_write(
    kernel: &mut Kernel<'_>,
    fs: &mut dyn FileSys,
    caller: usize,
    args: [u32; 4],
) -> Result<u32, Error> {
    let layout = caller_layout(kernel, caller)?;
    let (handle, _) = kernel.files.get(args[0], TaskId(caller as u8))?;
    let buf = user_slice(&kernel.upool, &layout, args[1], args[2])?;
    let n = fs.write(handle, buf)?;
    Ok(n as u32)
}

fn sys_seek(
    kernel: &mut Kernel<'_>,
    fs: &mut dyn FileSys,
    caller: usize,
    args: [u32; 4],
) -> Result<u32, Error> {
    let (handle, _) = kernel.files.get(args[0], TaskId(caller as u8))?;
    let whence = Whence::try_from(args[2]).map_err(|_| Error::BadArgument)?;
    let pos = fs.seek(handle, args[1] as i32, whence)?;
    Ok(pos)
}

fn sys_realloc(
    kernel: &mut Kernel<'_>,
    caller: usize,
    args: [u32; 4],
) -> Result<u32, Error> {
    let owner = TaskId(caller as u8);
    let (old, new_size) = (args[0], args[1]);
    if old == 0 {
        return kernel.upool.alloc(new_size, owner);
    }
    if new_size == 0 {
        kernel.upool.free_owned(old, owner)?;
        return Ok(0);
    }
    let old_size = kernel.upool.size_of(old).ok_or(Error::BadArgument)?;
    let new = kernel.upool.alloc(new_size, owner)?;
    kernel
        .upool
        .copy_within(old, new, old_size.min(new_size))
        .ok_or(Error::BadArgument)?;
    kernel.upool.free_owned(old, owner)?;
    Ok(new)
}

fn sys_puts(
    kernel: &mut Kernel<'_>,
    console: &mut dyn Console,
    caller: usize,
    args: [u32; 4],
) -> Result<u32, Error> {
    let layout = caller_layout(kernel, caller)?;
    let s = user_cstr(&kernel.upool, &layout, args[0], PUTS_MAX)?;
    for b in s.bytes() {
        console.putchar(b);
    }
    console.putchar(b'\n');
    Ok(s.len() as u32)
}
