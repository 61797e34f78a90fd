// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host driver for the MIMI C toolchain.
//!
//! Runs the same compiler and linker the device runs, over a host
//! directory instead of a FAT32 volume. Error reports carry the `[CC]`,
//! `[LINK]`, and `[LOAD]` tags the on-device shell prints, so build logs
//! read the same in both places.

use anyhow::{bail, Context, Result};
use clap::Parser;
use fs_api::{FileSys, HostFs};
use mcc::{Error, Mimi};

#[derive(Debug, Parser)]
#[clap(max_term_width = 80, about = "host driver for the MIMI C toolchain")]
enum Mimic {
    /// Compile and link C sources into a MIMI container.
    Build {
        /// C source files, compiled and linked in order.
        #[clap(min_values = 1)]
        sources: Vec<String>,
        /// Output container path.
        #[clap(short, long, default_value = "a.mimi")]
        output: String,
    },
    /// Print a container's header, symbols, and relocations.
    Inspect {
        file: String,
        /// Emit JSON instead of a table.
        #[clap(long)]
        json: bool,
    },
    /// Validate a container's header the way the loader would.
    Check {
        file: String,
    },
    /// Dump the token stream of one source file.
    Lex {
        file: String,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cmd = Mimic::parse();
    let mut vol = HostFs::new(".");
    match cmd {
        Mimic::Build { sources, output } => build(&mut vol, sources, output),
        Mimic::Inspect { file, json } => inspect(&mut vol, &file, json),
        Mimic::Check { file } => check(&mut vol, &file),
        Mimic::Lex { file } => lex(&mut vol, &file),
    }
}

/// Prints a compiler/linker failure with the shell's tags and location
/// convention, then fails the process.
fn report(err: Error) -> Result<()> {
    let tag = match &err {
        Error::Link(_) | Error::NoEntry => "[LINK]",
        _ => "[CC]",
    };
    eprintln!("{tag} {:?}: {err}", err.code());
    for d in err.diags() {
        eprintln!("{tag}   line {}, col {}: {}", d.line, d.col, d.message);
    }
    bail!("build failed");
}

fn build(
    vol: &mut HostFs,
    sources: Vec<String>,
    output: String,
) -> Result<()> {
    match mcc::build(vol, &sources, &output) {
        Ok(stats) => {
            println!(
                "{output}: entry {:#x}, text {}B, data {}B, \
                 {} relocations, {} symbols",
                stats.entry_offset,
                stats.text_size,
                stats.data_size,
                stats.reloc_count,
                stats.symbol_count
            );
            Ok(())
        }
        Err(e) => report(e),
    }
}

fn inspect(vol: &mut HostFs, file: &str, json: bool) -> Result<()> {
    let mimi = Mimi::read_from(vol, file)
        .with_context(|| format!("reading {file}"))?;
    if json {
        let doc = serde_json::json!({
            "header": mimi.header,
            "symbols": mimi.symbols,
            "relocs": mimi.relocs,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }
    let h = &mimi.header;
    println!(
        "{}: MIMI v{} arch {} entry {:#x}",
        file, h.version, h.arch, h.entry_offset
    );
    println!(
        "  text {}B  rodata {}B  data {}B  bss {}B",
        h.text_size, h.rodata_size, h.data_size, h.bss_size
    );
    println!(
        "  stack request {}B  heap request {}B  name {:?}",
        h.stack_request,
        h.heap_request,
        abi::unpack_name(&h.name).unwrap_or("")
    );
    println!("  symbols ({}):", mimi.symbols.len());
    for (i, s) in mimi.symbols.iter().enumerate() {
        println!(
            "    [{i}] {:16} {:?} {:?} value {:#x}",
            abi::unpack_name(&s.name).unwrap_or("?"),
            s.kind,
            s.section,
            s.value
        );
    }
    println!("  relocations ({}):", mimi.relocs.len());
    for r in &mimi.relocs {
        println!(
            "    {:?}+{:#x} {:?} -> symbol {}",
            r.section, r.offset, r.kind, r.symbol
        );
    }
    Ok(())
}

fn check(vol: &mut HostFs, file: &str) -> Result<()> {
    let mimi = Mimi::read_from(vol, file)
        .with_context(|| format!("reading {file}"))?;
    let h = &mimi.header;
    match h.check(abi::Arch::CortexM33) {
        Ok(()) => {
            println!("[LOAD] {file}: ok");
            Ok(())
        }
        Err(defect) => {
            // The loader reports the header fields it judged.
            eprintln!(
                "[LOAD] {file}: rejected ({defect:?}); magic {:#010x} \
                 version {} arch {} entry {:#x} (text {}B)",
                h.magic, h.version, h.arch, h.entry_offset, h.text_size
            );
            bail!("load check failed");
        }
    }
}

fn lex(vol: &mut HostFs, file: &str) -> Result<()> {
    let tok_path = format!("{file}.tok");
    let lexed = mcc::lex::lex_to_stream(vol, file, &tok_path);
    let result = match lexed {
        Ok(stats) => dump_tokens(vol, &tok_path, stats.tokens),
        Err(e) => report(e),
    };
    let _ = vol.remove(&tok_path);
    result
}

fn dump_tokens(vol: &mut HostFs, tok_path: &str, count: u32) -> Result<()> {
    let mut ts = mcc::parse::TokenStream::open(vol, tok_path)
        .context("reopening token stream")?;
    for _ in 0..count {
        let t = ts.next().context("reading token")?;
        let name = if t.flags & mcc::token::FLAG_STRTAB != 0 {
            format!(" {:?}", ts.strtab().get(t.value))
        } else if t.kind == mcc::token::TokenKind::Num
            || t.kind == mcc::token::TokenKind::CharLit
        {
            format!(" {}", t.value)
        } else {
            String::new()
        };
        println!("line {:4}  {:?}{}", t.line, t.kind, name);
    }
    Ok(())
}
