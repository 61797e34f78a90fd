// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The MIMI container format.
//!
//! A MIMI is a single 64-byte header followed by the raw TEXT, RODATA, and
//! DATA section bytes (BSS is implicit), then `reloc_count` relocation
//! records, then `symbol_count` symbol records. Every multi-byte field is
//! little-endian regardless of the host, and the encoding is deterministic:
//! the same input sections and symbol order produce the same bytes on any
//! implementation.
//!
//! The codecs here are the single source of truth for the byte layout; the
//! linker writes through them and the loader and inspector read through
//! them.

use byteorder::{ByteOrder, LittleEndian};
use core::convert::TryFrom;
use serde::Serialize;
use static_assertions::const_assert;

use crate::{Arch, RelocKind, Section, SymbolKind, NAME_LEN};

/// `"MIMI"` read as a little-endian u32.
pub const MAGIC: u32 = 0x494D_494D;

/// Current container version.
pub const VERSION: u8 = 1;

/// Size of the fixed header, in bytes.
pub const HEADER_LEN: usize = 64;

/// Size of one on-disk symbol record.
pub const SYMBOL_LEN: usize = 24;

/// Size of one on-disk relocation record.
pub const RELOC_LEN: usize = 12;

const_assert!(SYMBOL_LEN == NAME_LEN + 8);

/// The fixed MIMI header.
///
/// Field meanings follow the container layout: `entry_offset` is relative to
/// the start of TEXT, the four section sizes describe the loaded image
/// (BSS contributes no file bytes), and `stack_request`/`heap_request` are
/// lower bounds the loader may round up to its defaults.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct MimiHeader {
    pub magic: u32,
    pub version: u8,
    pub flags: u8,
    pub arch: u8,
    pub entry_offset: u32,
    pub text_size: u32,
    pub rodata_size: u32,
    pub data_size: u32,
    pub bss_size: u32,
    pub reloc_count: u32,
    pub symbol_count: u32,
    pub stack_request: u32,
    pub heap_request: u32,
    pub name: [u8; NAME_LEN],
}

/// Why a header was rejected. The variants carry the observed field so a
/// caller can report exactly what it saw.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HeaderDefect {
    BadMagic(u32),
    BadVersion(u8),
    WrongArch(u8),
    EmptyText,
    EntryOutOfRange(u32),
}

impl MimiHeader {
    /// Starts a header for a new image named `name`, with magic and version
    /// filled in and every size zero.
    pub fn new(arch: Arch, name: &str) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            flags: 0,
            arch: arch as u8,
            entry_offset: 0,
            text_size: 0,
            rodata_size: 0,
            data_size: 0,
            bss_size: 0,
            reloc_count: 0,
            symbol_count: 0,
            stack_request: 0,
            heap_request: 0,
            name: crate::pack_name(name),
        }
    }

    /// Serialises the header into its 64-byte on-disk form.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut b = [0; HEADER_LEN];
        LittleEndian::write_u32(&mut b[0..4], self.magic);
        b[4] = self.version;
        b[5] = self.flags;
        b[6] = self.arch;
        // b[7] reserved
        LittleEndian::write_u32(&mut b[8..12], self.entry_offset);
        LittleEndian::write_u32(&mut b[12..16], self.text_size);
        LittleEndian::write_u32(&mut b[16..20], self.rodata_size);
        LittleEndian::write_u32(&mut b[20..24], self.data_size);
        LittleEndian::write_u32(&mut b[24..28], self.bss_size);
        LittleEndian::write_u32(&mut b[28..32], self.reloc_count);
        LittleEndian::write_u32(&mut b[32..36], self.symbol_count);
        LittleEndian::write_u32(&mut b[36..40], self.stack_request);
        LittleEndian::write_u32(&mut b[40..44], self.heap_request);
        b[44..60].copy_from_slice(&self.name);
        // b[60..64] reserved
        b
    }

    /// Decodes a header from `bytes`. Returns `None` only when fewer than
    /// [`HEADER_LEN`] bytes are given; field validation is [`Self::check`].
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        let mut name = [0; NAME_LEN];
        name.copy_from_slice(&bytes[44..60]);
        Some(Self {
            magic: LittleEndian::read_u32(&bytes[0..4]),
            version: bytes[4],
            flags: bytes[5],
            arch: bytes[6],
            entry_offset: LittleEndian::read_u32(&bytes[8..12]),
            text_size: LittleEndian::read_u32(&bytes[12..16]),
            rodata_size: LittleEndian::read_u32(&bytes[16..20]),
            data_size: LittleEndian::read_u32(&bytes[20..24]),
            bss_size: LittleEndian::read_u32(&bytes[24..28]),
            reloc_count: LittleEndian::read_u32(&bytes[28..32]),
            symbol_count: LittleEndian::read_u32(&bytes[32..36]),
            stack_request: LittleEndian::read_u32(&bytes[36..40]),
            heap_request: LittleEndian::read_u32(&bytes[40..44]),
            name,
        })
    }

    /// Validates the structural invariants a loader relies on. `host` is
    /// the architecture of the running target.
    pub fn check(&self, host: Arch) -> Result<(), HeaderDefect> {
        if self.magic != MAGIC {
            return Err(HeaderDefect::BadMagic(self.magic));
        }
        if self.version != VERSION {
            return Err(HeaderDefect::BadVersion(self.version));
        }
        if Arch::try_from(self.arch) != Ok(host) {
            return Err(HeaderDefect::WrongArch(self.arch));
        }
        if self.text_size == 0 {
            return Err(HeaderDefect::EmptyText);
        }
        if self.entry_offset >= self.text_size {
            return Err(HeaderDefect::EntryOutOfRange(self.entry_offset));
        }
        Ok(())
    }

    /// File offset of the TEXT section (always just past the header).
    pub fn text_offset(&self) -> u32 {
        HEADER_LEN as u32
    }

    pub fn rodata_offset(&self) -> u32 {
        self.text_offset() + self.text_size
    }

    pub fn data_offset(&self) -> u32 {
        self.rodata_offset() + self.rodata_size
    }

    pub fn reloc_table_offset(&self) -> u32 {
        self.data_offset() + self.data_size
    }

    pub fn symbol_table_offset(&self) -> u32 {
        self.reloc_table_offset() + self.reloc_count * RELOC_LEN as u32
    }

    /// Total container length implied by the header.
    pub fn file_len(&self) -> u32 {
        self.symbol_table_offset() + self.symbol_count * SYMBOL_LEN as u32
    }

    /// Bytes the image occupies once loaded (BSS included, stack and heap
    /// excluded).
    pub fn image_size(&self) -> u32 {
        self.text_size + self.rodata_size + self.data_size + self.bss_size
    }
}

/// One symbol record.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Symbol {
    pub name: [u8; NAME_LEN],
    /// Section-relative offset for defined symbols; the syscall number for
    /// `SymbolKind::Syscall`; unused for externs.
    pub value: u32,
    pub section: Section,
    pub kind: SymbolKind,
}

impl Symbol {
    pub fn new(
        name: &str,
        value: u32,
        section: Section,
        kind: SymbolKind,
    ) -> Self {
        Self {
            name: crate::pack_name(name),
            value,
            section,
            kind,
        }
    }

    /// True when another object's extern of the same name binds to this
    /// symbol.
    pub fn is_definition(&self) -> bool {
        matches!(self.kind, SymbolKind::Global | SymbolKind::Syscall)
    }

    pub fn to_bytes(&self) -> [u8; SYMBOL_LEN] {
        let mut b = [0; SYMBOL_LEN];
        b[0..16].copy_from_slice(&self.name);
        LittleEndian::write_u32(&mut b[16..20], self.value);
        b[20] = self.section as u8;
        b[21] = self.kind as u8;
        // b[22..24] padding
        b
    }

    /// Decodes one record; `None` on a short slice or an out-of-range
    /// section or kind byte.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < SYMBOL_LEN {
            return None;
        }
        let mut name = [0; NAME_LEN];
        name.copy_from_slice(&bytes[0..16]);
        Some(Self {
            name,
            value: LittleEndian::read_u32(&bytes[16..20]),
            section: Section::try_from(bytes[20]).ok()?,
            kind: SymbolKind::try_from(bytes[21]).ok()?,
        })
    }
}

/// One relocation record: patch `section`+`offset` using symbol index
/// `symbol` and the rule selected by `kind`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Reloc {
    pub offset: u32,
    pub section: Section,
    pub kind: RelocKind,
    /// Index into the container's symbol table.
    pub symbol: u32,
}

impl Reloc {
    pub fn to_bytes(&self) -> [u8; RELOC_LEN] {
        let mut b = [0; RELOC_LEN];
        LittleEndian::write_u32(&mut b[0..4], self.offset);
        LittleEndian::write_u16(&mut b[4..6], self.section as u16);
        b[6] = self.kind as u8;
        // b[7] padding
        LittleEndian::write_u32(&mut b[8..12], self.symbol);
        b
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < RELOC_LEN {
            return None;
        }
        let section = LittleEndian::read_u16(&bytes[4..6]);
        Some(Self {
            offset: LittleEndian::read_u32(&bytes[0..4]),
            section: Section::try_from(u8::try_from(section).ok()?).ok()?,
            kind: RelocKind::try_from(bytes[6]).ok()?,
            symbol: LittleEndian::read_u32(&bytes[8..12]),
        })
    }
}
