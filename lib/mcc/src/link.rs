// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The linker: object blobs in, one MIMI out.
//!
//! Sections are concatenated with per-object bases; relocation offsets and
//! symbol values are rebased; symbols merge by name (first GLOBAL wins an
//! EXTERN, two GLOBALs of one name are a hard error, locals never merge).
//! Relocation symbol indices are remapped into the combined table during
//! the merge, so links of any number of objects stay correct.
//!
//! The output is deterministic: same objects in the same order, same bytes.

use abi::mimi::{MimiHeader, Reloc, Symbol, HEADER_LEN, RELOC_LEN, SYMBOL_LEN};
use abi::{Arch, Section, SymbolKind, NAME_LEN};
use fnv::FnvHashMap;
use fs_api::{FileSys, OpenMode, ScopedFile};

use crate::obj::ObjectFile;
use crate::Error;

/// A whole container in memory.
#[derive(Debug)]
pub struct Mimi {
    pub header: MimiHeader,
    pub text: Vec<u8>,
    pub rodata: Vec<u8>,
    pub data: Vec<u8>,
    pub relocs: Vec<Reloc>,
    pub symbols: Vec<Symbol>,
}

/// Merges `objects` (in order) into a container named `name`.
pub fn link_units(objects: &[ObjectFile], name: &str) -> Result<Mimi, Error> {
    let mut text: Vec<u8> = Vec::new();
    let mut data: Vec<u8> = Vec::new();
    let mut symbols: Vec<Symbol> = Vec::new();
    let mut relocs: Vec<Reloc> = Vec::new();
    let mut by_name: FnvHashMap<[u8; NAME_LEN], u32> = FnvHashMap::default();

    for obj in objects {
        let text_base = text.len() as u32;
        // Data cells carry word relocations; keep every object's data
        // word-aligned.
        while data.len() % 4 != 0 {
            data.push(0);
        }
        let data_base = data.len() as u32;
        text.extend_from_slice(&obj.text);
        data.extend_from_slice(&obj.data);

        let rebase = |s: &Symbol| match s.section {
            Section::Text => s.value + text_base,
            Section::Data => s.value + data_base,
            _ => s.value,
        };

        // Merge this object's symbols, remembering where each one landed
        // so relocation indices can be remapped.
        let mut map = Vec::with_capacity(obj.symbols.len());
        for sym in &obj.symbols {
            let mut adjusted = *sym;
            adjusted.value = rebase(sym);

            if sym.kind == SymbolKind::Local {
                // Locals are invisible across objects; never merged.
                map.push(symbols.len() as u32);
                symbols.push(adjusted);
                continue;
            }
            match by_name.get(&sym.name) {
                None => {
                    map.push(symbols.len() as u32);
                    by_name.insert(sym.name, symbols.len() as u32);
                    symbols.push(adjusted);
                }
                Some(&at) => {
                    let existing = &mut symbols[at as usize];
                    match (existing.kind, sym.kind) {
                        // A definition satisfies an earlier extern.
                        (SymbolKind::Extern, SymbolKind::Global)
                        | (SymbolKind::Extern, SymbolKind::Syscall) => {
                            *existing = adjusted;
                        }
                        // Externs fold into whatever is already there.
                        (_, SymbolKind::Extern) => {}
                        (SymbolKind::Syscall, SymbolKind::Syscall) => {}
                        _ => {
                            let n = abi::unpack_name(&sym.name)
                                .unwrap_or("?")
                                .to_string();
                            return Err(Error::Link(format!(
                                "multiple definition of {n}"
                            )));
                        }
                    }
                    map.push(at);
                }
            }
        }

        for r in &obj.relocs {
            let base = match r.section {
                Section::Text => text_base,
                Section::Data => data_base,
                _ => {
                    return Err(Error::Corrupt(
                        "relocation in unexpected section",
                    ))
                }
            };
            let symbol = *map
                .get(r.symbol as usize)
                .ok_or(Error::Corrupt("relocation names a bad symbol"))?;
            relocs.push(Reloc {
                offset: r.offset + base,
                section: r.section,
                kind: r.kind,
                symbol,
            });
        }
    }

    // Everything still undefined had better be a syscall; those are the
    // only references the loader is allowed to skip.
    for s in &symbols {
        if s.kind == SymbolKind::Extern {
            let n = abi::unpack_name(&s.name).unwrap_or("?");
            return Err(Error::Link(format!("unresolved reference to {n}")));
        }
    }

    // The first GLOBAL named `main` in TEXT is the entry point.
    let main = abi::pack_name("main");
    let entry = symbols
        .iter()
        .find(|s| {
            s.name == main
                && s.kind == SymbolKind::Global
                && s.section == Section::Text
        })
        .map(|s| s.value)
        .ok_or(Error::NoEntry)?;

    let mut header = MimiHeader::new(Arch::CortexM33, name);
    header.entry_offset = entry;
    header.text_size = text.len() as u32;
    header.rodata_size = 0;
    header.data_size = data.len() as u32;
    header.bss_size = 0;
    header.reloc_count = relocs.len() as u32;
    header.symbol_count = symbols.len() as u32;

    log::debug!(
        "linked {}: entry {:#x}, {}B text, {}B data, {} relocs, {} symbols",
        name,
        entry,
        header.text_size,
        header.data_size,
        header.reloc_count,
        header.symbol_count
    );

    Ok(Mimi {
        header,
        text,
        rodata: Vec::new(),
        data,
        relocs,
        symbols,
    })
}

impl Mimi {
    /// Serialises the container in layout order: header, TEXT, RODATA,
    /// DATA, relocations, symbols.
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
        file.write(&self.header.to_bytes())?;
        file.write(&self.text)?;
        file.write(&self.rodata)?;
        file.write(&self.data)?;
        for r in &self.relocs {
            file.write(&r.to_bytes())?;
        }
        for s in &self.symbols {
            file.write(&s.to_bytes())?;
        }
        Ok(())
    }

    /// Reads a container back for inspection. Validates structure (magic,
    /// record bytes, lengths) but not the target architecture.
    pub fn read_from(fs: &mut dyn FileSys, path: &str) -> Result<Self, Error> {
        let mut file = ScopedFile::open(fs, path, OpenMode::READ)?;
        let mut hb = [0u8; HEADER_LEN];
        file.read_exact(&mut hb)
            .map_err(|_| Error::Corrupt("short container header"))?;
        let header = MimiHeader::from_bytes(&hb)
            .ok_or(Error::Corrupt("short container header"))?;
        if header.magic != abi::mimi::MAGIC {
            return Err(Error::Corrupt("bad container magic"));
        }

        let mut read_section = |len: u32,
                                file: &mut ScopedFile<'_, dyn FileSys + '_>|
         -> Result<Vec<u8>, Error> {
            let mut buf = vec![0u8; len as usize];
            file.read_exact(&mut buf)
                .map_err(|_| Error::Corrupt("truncated section"))?;
            Ok(buf)
        };
        let text = read_section(header.text_size, &mut file)?;
        let rodata = read_section(header.rodata_size, &mut file)?;
        let data = read_section(header.data_size, &mut file)?;

        let mut relocs = Vec::with_capacity(header.reloc_count as usize);
        let mut rb = [0u8; RELOC_LEN];
        for _ in 0..header.reloc_count {
            file.read_exact(&mut rb)
                .map_err(|_| Error::Corrupt("truncated relocation table"))?;
            relocs.push(
                Reloc::from_bytes(&rb)
                    .ok_or(Error::Corrupt("bad relocation record"))?,
            );
        }
        let mut symbols = Vec::with_capacity(header.symbol_count as usize);
        let mut sb = [0u8; SYMBOL_LEN];
        for _ in 0..header.symbol_count {
            file.read_exact(&mut sb)
                .map_err(|_| Error::Corrupt("truncated symbol table"))?;
            symbols.push(
                Symbol::from_bytes(&sb)
                    .ok_or(Error::Corrupt("bad symbol record"))?,
            );
        }
        Ok(Self {
            header,
            text,
            rodata,
            data,
            relocs,
            symbols,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::RelocKind;

    fn global(name: &str, value: u32) -> Symbol {
        Symbol::new(name, value, Section::Text, SymbolKind::Global)
    }

    fn ext(name: &str) -> Symbol {
        Symbol::new(name, 0, Section::None, SymbolKind::Extern)
    }

    #[test]
    fn single_object_entry_offset_matches_main() {
        let obj = ObjectFile {
            text: vec![0; 24],
            data: vec![],
            relocs: vec![],
            symbols: vec![global("helper", 0), global("main", 8)],
        };
        let m = link_units(&[obj], "t").unwrap();
        assert_eq!(m.header.entry_offset, 8);
        assert_eq!(m.header.text_size, 24);
        assert_eq!(m.header.symbol_count, 2);
    }

    #[test]
    fn extern_is_satisfied_by_later_global_and_indices_remap() {
        let a = ObjectFile {
            text: vec![0; 8],
            data: vec![],
            relocs: vec![Reloc {
                offset: 4,
                section: Section::Text,
                kind: RelocKind::ThumbCall,
                symbol: 1, // "add" extern in this object
            }],
            symbols: vec![global("main", 0), ext("add")],
        };
        let b = ObjectFile {
            text: vec![0; 12],
            data: vec![],
            relocs: vec![],
            // Note the different local index for "add" here.
            symbols: vec![global("add", 4)],
        };
        let m = link_units(&[a, b], "t").unwrap();
        // One merged "add" record, defined, rebased into object b's text.
        let add = abi::pack_name("add");
        let merged: Vec<&Symbol> =
            m.symbols.iter().filter(|s| s.name == add).collect();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].kind, SymbolKind::Global);
        assert_eq!(merged[0].value, 8 + 4);
        // The relocation from object a now points at the merged record.
        let r = &m.relocs[0];
        assert_eq!(r.offset, 4);
        assert_eq!(&m.symbols[r.symbol as usize].name, &add);
    }

    #[test]
    fn duplicate_globals_are_an_error() {
        let a = ObjectFile {
            text: vec![0; 4],
            symbols: vec![global("main", 0)],
            ..ObjectFile::default()
        };
        let b = ObjectFile {
            text: vec![0; 4],
            symbols: vec![global("main", 0)],
            ..ObjectFile::default()
        };
        match link_units(&[a, b], "t") {
            Err(Error::Link(msg)) => {
                assert!(msg.contains("multiple definition of main"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unresolved_extern_is_an_error() {
        let a = ObjectFile {
            text: vec![0; 4],
            symbols: vec![global("main", 0), ext("phantom")],
            ..ObjectFile::default()
        };
        match link_units(&[a], "t") {
            Err(Error::Link(msg)) => {
                assert!(msg.contains("unresolved reference to phantom"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn missing_main_is_an_error() {
        let a = ObjectFile {
            text: vec![0; 4],
            symbols: vec![global("helper", 0)],
            ..ObjectFile::default()
        };
        assert!(matches!(link_units(&[a], "t"), Err(Error::NoEntry)));
    }

    #[test]
    fn locals_never_merge() {
        let mk = |v| ObjectFile {
            text: vec![],
            data: vec![0; 8],
            relocs: vec![],
            symbols: vec![Symbol::new(
                ".LC0",
                v,
                Section::Data,
                SymbolKind::Local,
            )],
        };
        let mut a = mk(0);
        a.symbols.push(global("main", 0));
        a.text = vec![0; 4];
        let m = link_units(&[a, mk(4)], "t").unwrap();
        let lc = abi::pack_name(".LC0");
        let locals: Vec<&Symbol> =
            m.symbols.iter().filter(|s| s.name == lc).collect();
        assert_eq!(locals.len(), 2);
        assert_eq!(locals[0].value, 0);
        assert_eq!(locals[1].value, 8 + 4);
    }

    #[test]
    fn link_output_is_deterministic() {
        let mk = || ObjectFile {
            text: vec![1, 2, 3, 4],
            data: vec![9],
            relocs: vec![],
            symbols: vec![global("main", 0)],
        };
        let a = link_units(&[mk()], "same").unwrap();
        let b = link_units(&[mk()], "same").unwrap();
        let mut disk = fs_api::RamDisk::new();
        a.write_to(&mut disk, "a.mimi").unwrap();
        b.write_to(&mut disk, "b.mimi").unwrap();
        assert_eq!(disk.contents("a.mimi"), disk.contents("b.mimi"));
    }
}
