// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The dynamic loader.
//!
//! Takes a MIMI container on the filesystem collaborator, places it in one
//! user-pool block owned by a fresh task, applies relocations, and leaves
//! the task READY with its entry point and initial stack set.
//!
//! Failure discipline: nothing is observable on error. The task slot is
//! reserved first and the user block second; any later failure releases
//! both before returning, and the symbol-table scratch buffer in the kernel
//! pool is freed on every path. The file handle closes itself by scope.

use abi::mimi::{MimiHeader, Reloc, Symbol, RELOC_LEN, SYMBOL_LEN};
use abi::{
    thumb, RelocKind, SymbolKind, TaskId, ALLOC_ALIGN, DEFAULT_HEAP,
    DEFAULT_STACK,
};
use byteorder::{ByteOrder, LittleEndian};
use fs_api::{FileSys, OpenMode, ScopedFile, Whence};

use crate::err::Error;
use crate::task::MemLayout;
use crate::{Kernel, Priority};

/// What a successful load reports back to the shell.
#[derive(Copy, Clone, Debug)]
pub struct LoadSummary {
    /// Task-table index of the new task.
    pub task: usize,
    /// Absolute entry address.
    pub entry: u32,
    /// Relocations skipped because they named an unresolved extern. Zero
    /// for a well-linked image; nonzero is recoverable but worth a warning.
    pub skipped_relocs: u32,
}

/// Loads the MIMI at `path` and readies it as a new task.
pub fn load(
    kernel: &mut Kernel<'_>,
    fs: &mut dyn FileSys,
    path: &str,
    priority: Priority,
) -> Result<LoadSummary, Error> {
    let mut file = ScopedFile::open(fs, path, OpenMode::READ)?;

    let mut hb = [0u8; abi::mimi::HEADER_LEN];
    file.read_exact(&mut hb).map_err(|_| Error::Corrupt)?;
    // Cannot fail on a full buffer, but stay total.
    let header = MimiHeader::from_bytes(&hb).ok_or(Error::Corrupt)?;
    header.check(kernel.arch()).map_err(Error::Image)?;

    // Seeks below address the whole file through i32 offsets.
    if header.file_len() > i32::MAX as u32 {
        return Err(Error::TooLarge);
    }

    let name = match abi::unpack_name(&header.name) {
        Some(n) if !n.is_empty() => n,
        _ => path.rsplit('/').next().unwrap_or(path),
    };

    let stack = header.stack_request.max(DEFAULT_STACK);
    let heap = header.heap_request.max(DEFAULT_HEAP);
    let total = u64::from(header.image_size())
        + u64::from(stack)
        + u64::from(heap);
    let total = (total + u64::from(ALLOC_ALIGN) - 1)
        & !(u64::from(ALLOC_ALIGN) - 1);
    let total = u32::try_from(total).map_err(|_| Error::TooLarge)?;

    let index = kernel.tasks.allocate(name, priority)?;
    let base = match kernel.upool.alloc(total, TaskId(index as u8)) {
        Ok(base) => base,
        Err(e) => {
            kernel.tasks.release(index);
            return Err(e);
        }
    };

    match install(kernel, &mut file, &header, index, base, total, stack, heap)
    {
        Ok(skipped) => {
            let entry = base + header.entry_offset;
            kernel.tasks.make_ready(index);
            Ok(LoadSummary {
                task: index,
                entry,
                skipped_relocs: skipped,
            })
        }
        Err(e) => {
            let _ = kernel.upool.free(base);
            kernel.tasks.release(index);
            Err(e)
        }
    }
}

/// Everything between the user-pool allocation and READY. Returns the
/// number of skipped extern relocations.
fn install(
    kernel: &mut Kernel<'_>,
    file: &mut ScopedFile<'_, dyn FileSys + '_>,
    header: &MimiHeader,
    index: usize,
    base: u32,
    total: u32,
    stack: u32,
    heap: u32,
) -> Result<u32, Error> {
    let layout = MemLayout {
        base,
        total_size: total,
        text_start: 0,
        text_size: header.text_size,
        rodata_start: header.text_size,
        rodata_size: header.rodata_size,
        data_start: header.text_size + header.rodata_size,
        data_size: header.data_size,
        bss_start: header.text_size + header.rodata_size + header.data_size,
        bss_size: header.bss_size,
        heap_start: header.image_size(),
        heap_size: heap,
        heap_used: 0,
        stack_top: total,
        stack_size: stack,
    };

    // Sections arrive in file order, which matches layout order, so this is
    // one forward read. A short read means the header lied: CORRUPT.
    for (start, size) in [
        (layout.text_start, layout.text_size),
        (layout.rodata_start, layout.rodata_size),
        (layout.data_start, layout.data_size),
    ] {
        if size == 0 {
            continue;
        }
        let dst = kernel
            .upool
            .slice_mut(base + start, size)
            .ok_or(Error::Corrupt)?;
        file.read_exact(dst).map_err(|_| Error::Corrupt)?;
    }

    if layout.bss_size > 0 {
        let bss = kernel
            .upool
            .slice_mut(base + layout.bss_start, layout.bss_size)
            .ok_or(Error::Corrupt)?;
        bss.fill(0);
    }

    // The symbol table sits past the relocations; pull it into kernel-pool
    // scratch first, then return to the relocation table.
    let sym_len = header
        .symbol_count
        .checked_mul(SYMBOL_LEN as u32)
        .ok_or(Error::TooLarge)?;
    let scratch = if sym_len > 0 {
        let addr = kernel.kpool.alloc(sym_len, TaskId::KERNEL)?;
        Some(addr)
    } else {
        None
    };

    let walked = walk(kernel, file, header, &layout, scratch, sym_len);

    if let Some(addr) = scratch {
        let _ = kernel.kpool.free(addr);
    }
    let skipped = walked?;

    let task = kernel.tasks.get_mut(index).ok_or(Error::BadArgument)?;
    *task.layout_mut() = layout;
    let entry = base + header.entry_offset;
    task.set_entry(entry);
    task.save = Default::default();
    task.save.pc = entry | 1; // Thumb bit
    task.save.sp = base + layout.stack_top;
    Ok(skipped)
}

fn walk(
    kernel: &mut Kernel<'_>,
    file: &mut ScopedFile<'_, dyn FileSys + '_>,
    header: &MimiHeader,
    layout: &MemLayout,
    scratch: Option<u32>,
    sym_len: u32,
) -> Result<u32, Error> {
    if let Some(addr) = scratch {
        file.seek(header.symbol_table_offset() as i32, Whence::Set)?;
        let dst = kernel
            .kpool
            .slice_mut(addr, sym_len)
            .ok_or(Error::Corrupt)?;
        file.read_exact(dst).map_err(|_| Error::Corrupt)?;
        file.seek(header.reloc_table_offset() as i32, Whence::Set)?;
    }

    let mut skipped = 0;
    for _ in 0..header.reloc_count {
        let mut rb = [0u8; RELOC_LEN];
        file.read_exact(&mut rb).map_err(|_| Error::Corrupt)?;
        let reloc = Reloc::from_bytes(&rb).ok_or(Error::Corrupt)?;

        let patch_addr =
            layout.base + layout.section_start(reloc.section) + reloc.offset;
        if !reloc.section.is_allocated() || !layout.contains(patch_addr, 4) {
            return Err(Error::Corrupt);
        }

        let sym = lookup(&kernel.kpool, scratch, sym_len, reloc.symbol)?;
        let value = match sym.kind {
            SymbolKind::Syscall => sym.value,
            SymbolKind::Extern => {
                // Unresolved extern: recoverable, the site keeps its
                // placeholder bytes.
                skipped += 1;
                continue;
            }
            SymbolKind::Local | SymbolKind::Global => {
                if !sym.section.is_allocated() {
                    return Err(Error::Corrupt);
                }
                layout.base
                    + layout.section_start(sym.section)
                    + sym.value
            }
        };

        let site = kernel
            .upool
            .slice_mut(patch_addr, 4)
            .ok_or(Error::Corrupt)?;
        apply(reloc.kind, site, patch_addr, value)?;
    }
    Ok(skipped)
}

fn lookup(
    kpool: &crate::pool::Pool<'_>,
    scratch: Option<u32>,
    sym_len: u32,
    index: u32,
) -> Result<Symbol, Error> {
    let addr = scratch.ok_or(Error::Corrupt)?;
    let table = kpool.slice(addr, sym_len).ok_or(Error::Corrupt)?;
    let off = index as usize * SYMBOL_LEN;
    let rec = table.get(off..off + SYMBOL_LEN).ok_or(Error::Corrupt)?;
    Symbol::from_bytes(rec).ok_or(Error::Corrupt)
}

/// The relocation interpreter. `site` is the four bytes at `patch_addr`;
/// `value` is the resolved symbol address (or syscall number).
fn apply(
    kind: RelocKind,
    site: &mut [u8],
    patch_addr: u32,
    value: u32,
) -> Result<(), Error> {
    match kind {
        RelocKind::Abs32 | RelocKind::DataPtr => {
            LittleEndian::write_u32(site, value);
        }
        RelocKind::Rel32 => {
            let disp = value.wrapping_sub(patch_addr).wrapping_sub(4);
            LittleEndian::write_u32(site, disp);
        }
        RelocKind::ThumbCall => {
            let [hi, lo] =
                thumb::encode_bl(patch_addr, value).ok_or(Error::TooLarge)?;
            LittleEndian::write_u16(&mut site[0..2], hi);
            LittleEndian::write_u16(&mut site[2..4], lo);
        }
        RelocKind::ThumbBranch => {
            let [hi, lo] =
                thumb::encode_bw(patch_addr, value).ok_or(Error::TooLarge)?;
            LittleEndian::write_u16(&mut site[0..2], hi);
            LittleEndian::write_u16(&mut site[2..4], lo);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abs32_writes_the_value() {
        let mut site = [0u8; 4];
        apply(RelocKind::Abs32, &mut site, 0x2000_0000, 0x2004_1234).unwrap();
        assert_eq!(LittleEndian::read_u32(&site), 0x2004_1234);
    }

    #[test]
    fn rel32_is_site_relative() {
        let mut site = [0u8; 4];
        apply(RelocKind::Rel32, &mut site, 0x100, 0x80).unwrap();
        assert_eq!(LittleEndian::read_u32(&site) as i32, -0x84);
    }

    #[test]
    fn thumb_call_round_trips_through_the_decoder() {
        let mut site = [0u8; 4];
        apply(RelocKind::ThumbCall, &mut site, 0x2000_0010, 0x2000_0200)
            .unwrap();
        let hi = LittleEndian::read_u16(&site[0..2]);
        let lo = LittleEndian::read_u16(&site[2..4]);
        assert!(thumb::is_bl(hi, lo));
        assert_eq!(
            thumb::branch_target(0x2000_0010, hi, lo),
            Some(0x2000_0200)
        );
    }

    #[test]
    fn out_of_range_call_is_rejected() {
        let mut site = [0u8; 4];
        assert_eq!(
            apply(RelocKind::ThumbCall, &mut site, 0, 0x0400_0000),
            Err(Error::TooLarge)
        );
    }
}
