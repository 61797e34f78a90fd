// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Object blobs: the codegen's per-translation-unit output.
//!
//! A flat file with a 4×u32 mini-header `{text_size, data_size,
//! reloc_count, symbol_count}` followed by the TEXT bytes, the DATA bytes,
//! the relocation records, and the symbol records (the record encodings are
//! the MIMI ones). Objects carry no RODATA or BSS: constant data and
//! zero-initialised globals are laid out in DATA. Relocation `symbol`
//! fields index this object's own symbol table; the linker remaps them
//! when objects merge.
//!
//! An object is a temporary artefact: written by [`crate::compile`],
//! consumed once by [`crate::link_objects`], then deleted.

use abi::mimi::{Reloc, Symbol, RELOC_LEN, SYMBOL_LEN};
use byteorder::{ByteOrder, LittleEndian};
use fs_api::{FileSys, OpenMode, ScopedFile};

use crate::Error;

/// Size of the mini-header.
pub const OBJ_HEADER_LEN: usize = 16;

/// An object in memory.
#[derive(Default, Debug)]
pub struct ObjectFile {
    pub text: Vec<u8>,
    pub data: Vec<u8>,
    pub relocs: Vec<Reloc>,
    pub symbols: Vec<Symbol>,
}

impl ObjectFile {
    /// Index of the symbol named `name`, if present.
    pub fn find_symbol(&self, name: &[u8; abi::NAME_LEN]) -> Option<u32> {
        self.symbols
            .iter()
            .position(|s| &s.name == name)
            .map(|i| i as u32)
    }

    pub fn write_to(
        &self,
        fs: &mut dyn FileSys,
        path: &str,
    ) -> Result<(), Error> {
        let mut file = ScopedFile::open(
            fs,
            path,
            OpenMode::WRITE | OpenMode::CREATE | OpenMode::TRUNC,
        )?;
        let mut header = [0u8; OBJ_HEADER_LEN];
        LittleEndian::write_u32(&mut header[0..4], self.text.len() as u32);
        LittleEndian::write_u32(&mut header[4..8], self.data.len() as u32);
        LittleEndian::write_u32(&mut header[8..12], self.relocs.len() as u32);
        LittleEndian::write_u32(
            &mut header[12..16],
            self.symbols.len() as u32,
        );
        file.write(&header)?;
        file.write(&self.text)?;
        file.write(&self.data)?;
        for r in &self.relocs {
            file.write(&r.to_bytes())?;
        }
        for s in &self.symbols {
            file.write(&s.to_bytes())?;
        }
        Ok(())
    }

    pub fn read_from(
        fs: &mut dyn FileSys,
        path: &str,
    ) -> Result<Self, Error> {
        let mut file = ScopedFile::open(fs, path, OpenMode::READ)?;
        let mut header = [0u8; OBJ_HEADER_LEN];
        file.read_exact(&mut header)
            .map_err(|_| Error::Corrupt("short object header"))?;
        let text_size = LittleEndian::read_u32(&header[0..4]) as usize;
        let data_size = LittleEndian::read_u32(&header[4..8]) as usize;
        let reloc_count = LittleEndian::read_u32(&header[8..12]) as usize;
        let symbol_count = LittleEndian::read_u32(&header[12..16]) as usize;

        let mut text = vec![0u8; text_size];
        file.read_exact(&mut text)
            .map_err(|_| Error::Corrupt("truncated object text"))?;
        let mut data = vec![0u8; data_size];
        file.read_exact(&mut data)
            .map_err(|_| Error::Corrupt("truncated object data"))?;

        let mut relocs = Vec::with_capacity(reloc_count);
        let mut rb = [0u8; RELOC_LEN];
        for _ in 0..reloc_count {
            file.read_exact(&mut rb)
                .map_err(|_| Error::Corrupt("truncated relocation table"))?;
            relocs.push(
                Reloc::from_bytes(&rb)
                    .ok_or(Error::Corrupt("bad relocation record"))?,
            );
        }
        let mut symbols = Vec::with_capacity(symbol_count);
        let mut sb = [0u8; SYMBOL_LEN];
        for _ in 0..symbol_count {
            file.read_exact(&mut sb)
                .map_err(|_| Error::Corrupt("truncated symbol table"))?;
            symbols.push(
                Symbol::from_bytes(&sb)
                    .ok_or(Error::Corrupt("bad symbol record"))?,
            );
        }
        Ok(Self {
            text,
            data,
            relocs,
            symbols,
        })
    }
}
