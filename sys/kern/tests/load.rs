// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Loader-level properties: header validation, placement, BSS, and the
//! relocation arithmetic, checked byte-for-byte against hand-built and
//! compiler-built containers.

mod common;

use abi::mimi::{MimiHeader, Reloc, Symbol};
use abi::{thumb, Arch, Priority, RelocKind, Section, SymbolKind};
use byteorder::{ByteOrder, LittleEndian};
use fs_api::RamDisk;
use kern::load::load;
use kern::{Error, TaskState};
use mcc::Mimi;

fn put_mimi(disk: &mut RamDisk, path: &str, m: &Mimi) {
    m.write_to(disk, path).unwrap();
}

/// A tiny hand-built image: 8 bytes of text, a little of everything else.
fn scratch_image() -> Mimi {
    let mut header = MimiHeader::new(Arch::CortexM33, "scratch");
    let text = vec![0x70, 0x47, 0x00, 0xBF, 0x11, 0x22, 0x33, 0x44];
    let rodata = vec![0xAA; 12];
    let data = vec![0x01, 0x02, 0x03, 0x04];
    header.text_size = text.len() as u32;
    header.rodata_size = rodata.len() as u32;
    header.data_size = data.len() as u32;
    header.bss_size = 64;
    Mimi {
        header,
        text,
        rodata,
        data,
        relocs: Vec::new(),
        symbols: Vec::new(),
    }
}

#[test]
fn sections_load_byte_identical_and_bss_is_zeroed() {
    let mut kernel = common::fresh_kernel();
    let mut disk = RamDisk::new();
    let image = scratch_image();
    put_mimi(&mut disk, "s.mimi", &image);

    // Dirty the arena first so the BSS zeroing is observable.
    let probe = kernel.upool.alloc(8192, kern::TaskId(7)).unwrap();
    kernel.upool.slice_mut(probe, 8192).unwrap().fill(0xEE);
    kernel.upool.free(probe).unwrap();
    kernel.upool.coalesce();

    let summary = load(&mut kernel, &mut disk, "s.mimi", Priority(9)).unwrap();
    let task = kernel.tasks.get(summary.task).unwrap();
    let l = *task.layout();

    assert_eq!(task.state(), TaskState::Ready);
    assert_eq!(summary.entry, l.base);
    assert_eq!(l.text_size, 8);
    assert_eq!(l.bss_size, 64);

    // No relocations: loaded bytes equal the file's section bytes.
    assert_eq!(
        kernel.upool.slice(l.base + l.text_start, l.text_size).unwrap(),
        &image.text[..]
    );
    assert_eq!(
        kernel
            .upool
            .slice(l.base + l.rodata_start, l.rodata_size)
            .unwrap(),
        &image.rodata[..]
    );
    assert_eq!(
        kernel.upool.slice(l.base + l.data_start, l.data_size).unwrap(),
        &image.data[..]
    );
    let bss = kernel.upool.slice(l.base + l.bss_start, l.bss_size).unwrap();
    assert!(bss.iter().all(|&b| b == 0));

    // Stack grows down from base + stack_top == base + total_size.
    assert_eq!(l.stack_top, l.total_size);
}

#[test]
fn bad_magic_is_noexec() {
    let mut kernel = common::fresh_kernel();
    let mut disk = RamDisk::new();
    let image = scratch_image();
    put_mimi(&mut disk, "s.mimi", &image);
    let mut bytes = disk.contents("s.mimi").unwrap().to_vec();
    bytes[0] = 0x7F;
    disk.put("s.mimi", &bytes);

    let err = load(&mut kernel, &mut disk, "s.mimi", Priority(9)).unwrap_err();
    assert_eq!(err.code(), abi::ErrorCode::NoExec);
}

#[test]
fn arch_mismatch_and_bad_entry_are_noexec() {
    let mut kernel = common::fresh_kernel();
    let mut disk = RamDisk::new();

    let mut wrong_arch = scratch_image();
    wrong_arch.header.arch = Arch::RiscV32 as u8;
    put_mimi(&mut disk, "a.mimi", &wrong_arch);
    let err = load(&mut kernel, &mut disk, "a.mimi", Priority(9)).unwrap_err();
    assert_eq!(err.code(), abi::ErrorCode::NoExec);

    let mut bad_entry = scratch_image();
    bad_entry.header.entry_offset = bad_entry.header.text_size;
    put_mimi(&mut disk, "b.mimi", &bad_entry);
    let err = load(&mut kernel, &mut disk, "b.mimi", Priority(9)).unwrap_err();
    assert_eq!(err.code(), abi::ErrorCode::NoExec);

    let mut empty_text = scratch_image();
    empty_text.header.text_size = 0;
    empty_text.text.clear();
    put_mimi(&mut disk, "c.mimi", &empty_text);
    let err = load(&mut kernel, &mut disk, "c.mimi", Priority(9)).unwrap_err();
    assert_eq!(err.code(), abi::ErrorCode::NoExec);
}

#[test]
fn truncated_section_is_corrupt_and_releases_everything() {
    let mut kernel = common::fresh_kernel();
    let mut disk = RamDisk::new();
    let image = scratch_image();
    put_mimi(&mut disk, "s.mimi", &image);
    let full = disk.contents("s.mimi").unwrap().to_vec();
    // Cut into the rodata section.
    disk.put("s.mimi", &full[..64 + 10]);

    let free_before = kernel.upool.free_bytes();
    let err = load(&mut kernel, &mut disk, "s.mimi", Priority(9)).unwrap_err();
    assert_eq!(err, Error::Corrupt);
    assert_eq!(kernel.upool.free_bytes(), free_before);
    assert_eq!(kernel.tasks.get(1).unwrap().state(), TaskState::Free);
}

#[test]
fn out_of_memory_releases_the_task_slot() {
    let (k, _) = common::arenas();
    let tiny_user = Box::leak(vec![0u8; 1024].into_boxed_slice());
    let mut kernel = kern::Kernel::new(k, tiny_user, Arch::CortexM33);
    let mut disk = RamDisk::new();
    put_mimi(&mut disk, "s.mimi", &scratch_image());

    let err = load(&mut kernel, &mut disk, "s.mimi", Priority(9)).unwrap_err();
    assert_eq!(err.code(), abi::ErrorCode::NoMem);
    assert_eq!(kernel.tasks.get(1).unwrap().state(), TaskState::Free);
}

#[test]
fn abs32_reloc_writes_the_load_address() {
    let mut kernel = common::fresh_kernel();
    let mut disk = RamDisk::new();
    let mut image = scratch_image();
    // Patch slot at text+4 references the data symbol at offset 2.
    image.symbols.push(Symbol::new(
        "blob",
        2,
        Section::Data,
        SymbolKind::Local,
    ));
    image.relocs.push(Reloc {
        offset: 4,
        section: Section::Text,
        kind: RelocKind::Abs32,
        symbol: 0,
    });
    image.header.reloc_count = 1;
    image.header.symbol_count = 1;
    put_mimi(&mut disk, "s.mimi", &image);

    let summary = load(&mut kernel, &mut disk, "s.mimi", Priority(9)).unwrap();
    let l = *kernel.tasks.get(summary.task).unwrap().layout();
    let patched = kernel.upool.slice(l.base + 4, 4).unwrap();
    assert_eq!(
        LittleEndian::read_u32(patched),
        l.base + l.data_start + 2
    );
}

#[test]
fn thumb_call_reloc_decodes_back_to_the_symbol() {
    let mut kernel = common::fresh_kernel();
    let mut disk = RamDisk::new();
    let mut image = scratch_image();
    image.symbols.push(Symbol::new(
        "callee",
        4,
        Section::Text,
        SymbolKind::Global,
    ));
    image.relocs.push(Reloc {
        offset: 0,
        section: Section::Text,
        kind: RelocKind::ThumbCall,
        symbol: 0,
    });
    image.header.reloc_count = 1;
    image.header.symbol_count = 1;
    put_mimi(&mut disk, "s.mimi", &image);

    let summary = load(&mut kernel, &mut disk, "s.mimi", Priority(9)).unwrap();
    let l = *kernel.tasks.get(summary.task).unwrap().layout();
    let site = kernel.upool.slice(l.base, 4).unwrap();
    let hi = LittleEndian::read_u16(&site[0..2]);
    let lo = LittleEndian::read_u16(&site[2..4]);
    assert!(thumb::is_bl(hi, lo));
    // Decoding per ARMv7-M and adding to patch_addr + 4 lands on the
    // symbol's load address.
    assert_eq!(thumb::branch_target(l.base, hi, lo), Some(l.base + 4));
}

#[test]
fn syscall_symbol_value_is_taken_verbatim() {
    let mut kernel = common::fresh_kernel();
    let mut disk = RamDisk::new();
    let mut image = scratch_image();
    image.symbols.push(Symbol::new(
        "sys.2",
        2,
        Section::None,
        SymbolKind::Syscall,
    ));
    image.relocs.push(Reloc {
        offset: 4,
        section: Section::Text,
        kind: RelocKind::Abs32,
        symbol: 0,
    });
    image.header.reloc_count = 1;
    image.header.symbol_count = 1;
    put_mimi(&mut disk, "s.mimi", &image);

    let summary = load(&mut kernel, &mut disk, "s.mimi", Priority(9)).unwrap();
    let l = *kernel.tasks.get(summary.task).unwrap().layout();
    let patched = kernel.upool.slice(l.base + 4, 4).unwrap();
    assert_eq!(LittleEndian::read_u32(patched), 2);
}

#[test]
fn unresolved_extern_relocs_are_skipped_not_fatal() {
    let mut kernel = common::fresh_kernel();
    let mut disk = RamDisk::new();
    let mut image = scratch_image();
    image.symbols.push(Symbol::new(
        "missing",
        0,
        Section::None,
        SymbolKind::Extern,
    ));
    image.relocs.push(Reloc {
        offset: 4,
        section: Section::Text,
        kind: RelocKind::Abs32,
        symbol: 0,
    });
    image.header.reloc_count = 1;
    image.header.symbol_count = 1;
    put_mimi(&mut disk, "s.mimi", &image);

    let summary = load(&mut kernel, &mut disk, "s.mimi", Priority(9)).unwrap();
    assert_eq!(summary.skipped_relocs, 1);
    // The site keeps its original bytes.
    let l = *kernel.tasks.get(summary.task).unwrap().layout();
    let site = kernel.upool.slice(l.base + 4, 4).unwrap();
    assert_eq!(site, &[0x11, 0x22, 0x33, 0x44]);
}

#[test]
fn bad_symbol_index_is_corrupt() {
    let mut kernel = common::fresh_kernel();
    let mut disk = RamDisk::new();
    let mut image = scratch_image();
    image.relocs.push(Reloc {
        offset: 0,
        section: Section::Text,
        kind: RelocKind::Abs32,
        symbol: 5,
    });
    image.header.reloc_count = 1;
    put_mimi(&mut disk, "s.mimi", &image);

    let err = load(&mut kernel, &mut disk, "s.mimi", Priority(9)).unwrap_err();
    assert_eq!(err, Error::Corrupt);
}

#[test]
fn stack_and_heap_requests_round_up_to_defaults() {
    let mut kernel = common::fresh_kernel();
    let mut disk = RamDisk::new();
    let mut image = scratch_image();
    image.header.stack_request = 16 * 1024;
    image.header.heap_request = 100;
    put_mimi(&mut disk, "s.mimi", &image);

    let summary = load(&mut kernel, &mut disk, "s.mimi", Priority(9)).unwrap();
    let l = *kernel.tasks.get(summary.task).unwrap().layout();
    assert_eq!(l.stack_size, 16 * 1024);
    assert_eq!(l.heap_size, abi::DEFAULT_HEAP);
}

#[test]
fn compiler_output_loads_with_no_skipped_relocs() {
    let mut kernel = common::fresh_kernel();
    let mut disk = RamDisk::new();
    let summary = common::compile_and_load(
        &mut kernel,
        &mut disk,
        "int add(int a, int b) { return a + b; } \
         int main() { return add(1, 2); }",
    )
    .unwrap();
    assert_eq!(summary.skipped_relocs, 0);
    let task = kernel.tasks.get(summary.task).unwrap();
    assert_eq!(task.state(), TaskState::Ready);
    // Entry is text-relative offset of `main`, somewhere inside text.
    let l = task.layout();
    assert!(summary.entry >= l.base && summary.entry < l.base + l.text_size);
}
